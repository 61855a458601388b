//! The link channel is the bus driver's queue of buffers between host and firmware.
//!
//! It is implemented outside of this crate. We only submit buffers to it, and the bus driver
//! calls back into the [Hif](crate::Hif), when buffers were received or sent.
use alloc::vec::Vec;

use crate::{batch::SealedBatch, error::HifError, pool::DeviceAddress};

/// A queue of the link channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelId {
    /// Data frames from host to firmware.
    TxData,
    /// Address batches handing receive buffers to the firmware.
    AddressHandoff,
    /// Data frames and address events from firmware to host.
    RxData,
    /// Events from firmware to host.
    RxEvent,
}

/// A buffer passed to the link channel.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkBuffer {
    /// Bytes, which the bus driver copies to the device.
    Bytes(Vec<u8>),
    /// A buffer, which is already mapped for the device.
    Mapped { address: DeviceAddress, len: usize },
    /// An encoded address batch.
    AddressBatch(SealedBatch),
}
impl LinkBuffer {
    /// The bytes to be copied to the device, if this isn't a mapped buffer.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::AddressBatch(batch) => Some(batch.as_bytes()),
            Self::Mapped { .. } => None,
        }
    }
}

/// The buffers of a submission, that the link channel refused to take.
#[derive(Debug, PartialEq, Eq)]
pub struct LinkRejected {
    pub error: HifError,
    pub buffers: Vec<LinkBuffer>,
}

/// The bus driver's side of the data path.
pub trait LinkChannel {
    /// Queue buffers for transmission to the firmware.
    ///
    /// This must not block. If the channel can't take the buffers, they are handed back
    /// untouched.
    fn submit(&mut self, channel: ChannelId, buffers: Vec<LinkBuffer>)
        -> Result<(), LinkRejected>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A link channel, which records everything submitted to it.
    #[derive(Default)]
    pub(crate) struct RecordingLink {
        pub busy: bool,
        pub submitted: Vec<(ChannelId, Vec<LinkBuffer>)>,
    }
    impl RecordingLink {
        pub fn count(&self, channel: ChannelId) -> usize {
            self.submitted
                .iter()
                .filter(|(submitted_channel, _)| *submitted_channel == channel)
                .count()
        }
    }
    impl LinkChannel for RecordingLink {
        fn submit(
            &mut self,
            channel: ChannelId,
            buffers: Vec<LinkBuffer>,
        ) -> Result<(), LinkRejected> {
            if self.busy {
                return Err(LinkRejected {
                    error: HifError::LinkBusy,
                    buffers,
                });
            }
            self.submitted.push((channel, buffers));
            Ok(())
        }
    }
}
