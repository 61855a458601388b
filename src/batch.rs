//! Address handoff between host and firmware.
//!
//! On PCIe, receive buffers are handed to the firmware by sending their device addresses in
//! batches. The firmware answers with address events, which tell us what to do with the buffers.
//!
//! Both directions use the same value block: `{type: u8, num: u8, address: [[u8; 5]; num]}`.
use alloc::vec::Vec;
use core::iter::FusedIterator;

use macro_bits::serializable_enum;

use crate::{
    descriptor::{CommonHeader, HeadType},
    error::{HifError, HifResult},
    pool::DeviceAddress,
};

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// The type of an address value block.
    pub enum AddrValueType: u8 {
        /// The buffers contain received frames. Host batches use this type too.
        Process => 0,
        /// The firmware no longer needs the buffers.
        Free => 1,
        /// The firmware asks for more buffers.
        Request => 2,
        /// The firmware dropped all buffers.
        Flush => 3
    }
}

/// Size of the type and count fields.
const VALUE_HEADER_LEN: usize = 2;

/// An address batch, which is still being filled.
#[derive(Debug)]
pub struct AddressBatch {
    kind: AddrValueType,
    capacity: usize,
    addresses: Vec<DeviceAddress>,
}
impl AddressBatch {
    /// Create a new batch. The capacity is limited to what fits into the count field.
    pub fn new(kind: AddrValueType, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u8::MAX as usize);
        Self {
            kind,
            capacity,
            addresses: Vec::new(),
        }
    }
    pub fn len(&self) -> usize {
        self.addresses.len()
    }
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
    pub fn is_full(&self) -> bool {
        self.addresses.len() >= self.capacity
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// Append an address. If the batch is full, the address is handed back.
    pub fn push(&mut self, address: DeviceAddress) -> Result<(), DeviceAddress> {
        if self.is_full() || self.addresses.try_reserve(1).is_err() {
            return Err(address);
        }
        self.addresses.push(address);
        Ok(())
    }
    /// Encode the batch for transmission.
    ///
    /// `hif_offset` zero bytes are reserved in front of the message for the bus driver.
    pub fn seal(self, hif_offset: usize) -> HifResult<SealedBatch> {
        let len = hif_offset
            + 1
            + VALUE_HEADER_LEN
            + self.addresses.len() * DeviceAddress::WIRE_LEN;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| HifError::OutOfMemory)?;
        bytes.resize(hif_offset, 0);
        bytes.push(
            CommonHeader::new()
                .with_head_type(HeadType::DataPcieAddr)
                .with_reserved(true)
                .into_bits(),
        );
        bytes.push(self.kind.into_bits());
        bytes.push(self.addresses.len() as u8);
        for address in self.addresses.iter() {
            bytes.extend_from_slice(&address.to_wire());
        }
        Ok(SealedBatch {
            bytes,
            count: self.addresses.len(),
        })
    }
}

/// An encoded address batch.
///
/// This can't be cloned or modified, so the same batch can never be sent twice.
#[derive(Debug, PartialEq, Eq)]
pub struct SealedBatch {
    bytes: Vec<u8>,
    count: usize,
}
impl SealedBatch {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
    /// The number of addresses in the batch.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// One value block of an address event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrValue<'a> {
    pub kind: AddrValueType,
    raw_addresses: &'a [u8],
}
impl<'a> AddrValue<'a> {
    pub fn len(&self) -> usize {
        self.raw_addresses.len() / DeviceAddress::WIRE_LEN
    }
    pub fn is_empty(&self) -> bool {
        self.raw_addresses.is_empty()
    }
    pub fn addresses(&self) -> impl Iterator<Item = DeviceAddress> + 'a {
        self.raw_addresses
            .chunks_exact(DeviceAddress::WIRE_LEN)
            .map(DeviceAddress::from_wire)
    }
}

/// Iterator over the value blocks of an address event.
pub struct AddrValues<'a> {
    remaining: u8,
    bytes: &'a [u8],
}
impl<'a> AddrValues<'a> {
    /// Parse an address event.
    ///
    /// The message must start with the common header, followed by the number of value blocks.
    pub fn parse(message: &'a [u8]) -> HifResult<Self> {
        let header = CommonHeader::parse(message).ok_or(HifError::Malformed)?;
        if header.head_type() != HeadType::DataPcieAddr {
            return Err(HifError::Malformed);
        }
        let remaining = *message.get(1).ok_or(HifError::Malformed)?;
        Ok(Self {
            remaining,
            bytes: &message[2..],
        })
    }
}
impl<'a> Iterator for AddrValues<'a> {
    type Item = HifResult<AddrValue<'a>>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let parsed = (|| {
            let header = self.bytes.get(..VALUE_HEADER_LEN)?;
            let (kind, num) = (AddrValueType::from_bits(header[0]), header[1] as usize);
            let end = VALUE_HEADER_LEN + num * DeviceAddress::WIRE_LEN;
            let raw_addresses = self.bytes.get(VALUE_HEADER_LEN..end)?;
            self.bytes = &self.bytes[end..];
            Some(AddrValue {
                kind,
                raw_addresses,
            })
        })();
        if parsed.is_none() {
            warn!(
                "Address event truncated, {} value blocks left.",
                self.remaining + 1
            );
            self.remaining = 0;
        }
        Some(parsed.ok_or(HifError::Malformed))
    }
}
impl FusedIterator for AddrValues<'_> {}
