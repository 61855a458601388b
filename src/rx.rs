//! The receive path from a single MSDU to the frame handed to the network stack.
//!
//! Frames pass through these stages:
//! 1. Interface validation and the A-MSDU guard.
//! 2. [Defragmentation](crate::defrag::DefragEngine).
//! 3. [Reordering](crate::reorder::ReorderEngine), unless the frame isn't part of a block-ack
//!    session.
use alloc::vec::Vec;
use core::iter::FusedIterator;

use embassy_time::Instant;

use crate::{
    config::HifConfig,
    defrag::DefragEngine,
    descriptor::{RxMsduDesc, RX_MH_DESC_LEN},
    error::{HifError, HifResult},
    frame::{InterfaceId, RxFrame, StreamKey},
    reorder::{FrameMeta, ReorderEngine},
    seq::SeqNum,
};

/// A frame ready for delivery and the interface it was received on.
pub type Delivered = (InterfaceId, RxFrame);

const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Protection against A-MSDU injection.
///
/// An attacker can flip the A-MSDU bit of a plain MSDU, which turns its payload into A-MSDU
/// subframes. The first subframe of such an MSDU doesn't start with a SNAP header. Once that is
/// detected, every buffer of the MPDU is dropped.
#[derive(Debug, Default)]
pub struct AmsduGuard {
    blocked: Option<(SeqNum, StreamKey)>,
}
impl AmsduGuard {
    pub const fn new() -> Self {
        Self { blocked: None }
    }
    /// Check whether the buffer may be processed.
    pub fn admit(&mut self, desc: &RxMsduDesc) -> bool {
        let mpdu = (desc.seq(), StreamKey::new(desc.station(), desc.tid()));
        if let Some(blocked) = self.blocked {
            if blocked == mpdu {
                if desc.position.last_buff_of_mpdu() {
                    self.blocked = None;
                }
                return false;
            }
            self.blocked = None;
        }
        if desc.flags.amsdu()
            && desc.position.first_msdu_of_mpdu()
            && !desc.flags.snap_hdr_present()
        {
            warn!(
                "Dropping A-MSDU without SNAP header from STA {}, seq {}.",
                desc.station(),
                desc.seq().value()
            );
            if !desc.position.last_buff_of_mpdu() {
                self.blocked = Some(mpdu);
            }
            return false;
        }
        true
    }
    /// Forget a blocked MPDU of the station.
    pub fn reset(&mut self, station: u8) {
        if self
            .blocked
            .is_some_and(|(_, key)| key.station == station)
        {
            self.blocked = None;
        }
    }
}

/// Iterator over the MSDUs packed into one buffer.
///
/// Every MSDU is followed by an MH descriptor. Consecutive MSDUs are aligned to eight bytes. The
/// hardware checksum is only reported on PCIe, so these frames never carry one.
pub struct PackedMsdus<'a> {
    bytes: &'a [u8],
    remaining: u8,
}
impl<'a> PackedMsdus<'a> {
    /// Split `bytes`, which start with the descriptor of the first MSDU.
    pub fn new(bytes: &'a [u8]) -> Self {
        let remaining = RxMsduDesc::parse(bytes)
            .map(|desc| desc.position.short_pkt_num().max(1))
            .unwrap_or(1);
        Self { bytes, remaining }
    }
}
impl Iterator for PackedMsdus<'_> {
    type Item = HifResult<RxFrame>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let Some(total_len) = RxMsduDesc::parse(self.bytes)
            .map(|desc| desc.total_len())
            .filter(|total_len| *total_len <= self.bytes.len())
        else {
            debug!(
                "Packed buffer truncated, {} MSDUs left.",
                self.remaining + 1
            );
            self.remaining = 0;
            return Some(Err(HifError::Malformed));
        };
        let frame = RxFrame::copy_from(&self.bytes[..total_len]);
        let stride = align8(total_len + RX_MH_DESC_LEN);
        self.bytes = self.bytes.get(stride..).unwrap_or_default();
        Some(frame)
    }
}
impl FusedIterator for PackedMsdus<'_> {}

/// The per stream state of the receive path.
pub struct RxPipeline {
    guard: AmsduGuard,
    defrag: DefragEngine,
    reorder: ReorderEngine<Delivered>,
}
impl RxPipeline {
    pub fn new(config: &HifConfig) -> Self {
        Self {
            guard: AmsduGuard::new(),
            defrag: DefragEngine::new(
                config.defrag_streams,
                config.defrag_lifetime,
                config.max_frame_len,
            ),
            reorder: ReorderEngine::from_config(config),
        }
    }
    /// Process a single MSDU. Frames ready for delivery are passed to `out`.
    pub fn process(&mut self, frame: RxFrame, now: Instant, out: &mut impl FnMut(Delivered)) {
        let Ok(interface) = InterfaceId::new(frame.interface()) else {
            debug!("Dropping frame for invalid interface {}.", frame.interface());
            return;
        };
        if !self.guard.admit(frame.desc()) {
            return;
        }
        let Some(frame) = self.defrag.on_fragment(frame, now) else {
            return;
        };
        let desc = *frame.desc();
        if desc.flags.bc_mc() || !desc.flags.qos() {
            out((interface, frame));
            return;
        }
        if desc.position.null_frame() || desc.position.qos_null() {
            self.reorder.filter(frame.key(), frame.seq(), now, out);
            return;
        }
        let meta = FrameMeta {
            key: frame.key(),
            seq: frame.seq(),
            pn: desc.cipher().has_replay_counter().then(|| desc.pn()),
            last_msdu: desc.position.last_msdu_of_mpdu(),
            ba_session: desc.flags.ba_session(),
        };
        self.reorder.on_frame(meta, (interface, frame), now, out);
    }
    pub fn add_ba(
        &mut self,
        key: StreamKey,
        start: SeqNum,
        window_size: u16,
        out: &mut impl FnMut(Delivered),
    ) -> HifResult<()> {
        self.reorder.add_ba(key, start, window_size, out)
    }
    pub fn del_ba(&mut self, key: StreamKey, out: &mut impl FnMut(Delivered)) -> bool {
        self.reorder.del_ba(key, out)
    }
    pub fn bar(
        &mut self,
        key: StreamKey,
        start: SeqNum,
        now: Instant,
        out: &mut impl FnMut(Delivered),
    ) {
        self.reorder.bar(key, start, now, out)
    }
    /// Drop all state of a station. Buffered frames are still delivered in order.
    pub fn remove_station(&mut self, station: u8, out: &mut impl FnMut(Delivered)) {
        self.guard.reset(station);
        self.defrag.recover(station);
        self.reorder.remove_station(station, out);
    }
    pub fn reset_pn(&mut self, station: u8) {
        self.reorder.reset_pn(station);
    }
    /// Run the timers of both engines. Returns the streams, that were lost.
    pub fn poll(&mut self, now: Instant, out: &mut impl FnMut(Delivered)) -> Vec<StreamKey> {
        self.defrag.expire(now);
        self.reorder.poll_timeouts(now, out)
    }
    pub fn next_deadline(&self) -> Option<Instant> {
        self.reorder.next_deadline()
    }
}
