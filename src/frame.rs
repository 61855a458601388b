use alloc::vec::Vec;

use crate::{
    descriptor::RxMsduDesc,
    error::{HifError, HifResult},
    seq::SeqNum,
};

/// The number of logical interfaces (contexts) the firmware supports.
pub const INTERFACE_COUNT: usize = 4;

/// Identifies a logical interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceId(u8);
impl InterfaceId {
    pub const fn new(id: u8) -> HifResult<Self> {
        if (id as usize) < INTERFACE_COUNT {
            Ok(Self(id))
        } else {
            Err(HifError::InterfaceOutOfBounds)
        }
    }
    pub const fn index(self) -> usize {
        self.0 as usize
    }
    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// Identifies a traffic stream of a station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamKey {
    pub station: u8,
    pub tid: u8,
}
impl StreamKey {
    pub const fn new(station: u8, tid: u8) -> Self {
        Self { station, tid }
    }
}

/// A frame received from the firmware.
///
/// The bytes start with the [RxMsduDesc], followed by the MSDU at the offset given in the
/// descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxFrame {
    desc: RxMsduDesc,
    bytes: Vec<u8>,
    checksum: Option<u16>,
}
impl RxFrame {
    /// Wrap the bytes of a single MSDU.
    ///
    /// This fails, if the descriptor can't be parsed or points past the end of the bytes.
    pub fn new(bytes: Vec<u8>) -> HifResult<Self> {
        let desc = RxMsduDesc::parse(&bytes).ok_or(HifError::Malformed)?;
        if desc.msdu_offset() < RxMsduDesc::LEN || desc.total_len() > bytes.len() {
            return Err(HifError::Malformed);
        }
        Ok(Self {
            desc,
            bytes,
            checksum: None,
        })
    }
    /// Copy a single MSDU out of `bytes`.
    pub fn copy_from(bytes: &[u8]) -> HifResult<Self> {
        let desc = RxMsduDesc::parse(bytes).ok_or(HifError::Malformed)?;
        let total_len = desc.total_len();
        let bytes = bytes.get(..total_len).ok_or(HifError::Malformed)?;
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(total_len)
            .map_err(|_| HifError::OutOfMemory)?;
        owned.extend_from_slice(bytes);
        Self::new(owned)
    }
    pub fn desc(&self) -> &RxMsduDesc {
        &self.desc
    }
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.desc.station(), self.desc.tid())
    }
    pub fn seq(&self) -> SeqNum {
        self.desc.seq()
    }
    /// The raw interface ID reported by the firmware.
    pub fn interface(&self) -> u8 {
        self.desc.interface()
    }
    /// The MSDU without descriptor.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.desc.msdu_offset()..self.desc.total_len()]
    }
    /// Descriptor and MSDU.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.desc.total_len()]
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
    pub fn checksum(&self) -> Option<u16> {
        self.checksum
    }
    pub fn set_checksum(&mut self, checksum: Option<u16>) {
        self.checksum = checksum;
    }
}
