//! Reassembly of fragmented MSDUs.
//!
//! Only a small number of fragment chains is tracked at once. The chains are kept in
//! most-recently-used order, so that a new chain replaces the one, that wasn't touched for the
//! longest time.
use alloc::vec::Vec;

use embassy_time::{Duration, Instant};

use crate::{
    error::{HifError, HifResult},
    frame::{RxFrame, StreamKey},
    seq::SeqNum,
};

/// A fragment chain, which is still being accumulated.
struct DefragNode {
    key: StreamKey,
    seq: SeqNum,
    last_frag: u8,
    /// The length of the reassembled MSDU, so far.
    msdu_len: usize,
    /// Header bytes, which every later fragment repeats and which are stripped during assembly.
    link_header_len: usize,
    fragments: Vec<RxFrame>,
    last_update: Instant,
}

/// The defragmentation engine.
pub struct DefragEngine {
    /// Ordered from most to least recently used.
    nodes: Vec<DefragNode>,
    capacity: usize,
    lifetime: Duration,
    max_frame_len: usize,
}
impl DefragEngine {
    pub fn new(capacity: usize, lifetime: Duration, max_frame_len: usize) -> Self {
        Self {
            nodes: Vec::new(),
            capacity: capacity.max(1),
            lifetime,
            max_frame_len,
        }
    }
    /// The number of chains currently being accumulated.
    pub fn active_streams(&self) -> usize {
        self.nodes.len()
    }
    fn position(&self, key: StreamKey) -> Option<usize> {
        self.nodes.iter().position(|node| node.key == key)
    }
    fn touch(&mut self, index: usize) {
        let node = self.nodes.remove(index);
        self.nodes.insert(0, node);
    }
    /// Process a received MSDU.
    ///
    /// Unfragmented frames are returned immediately. Fragments are buffered, until the last one
    /// arrives, at which point the reassembled frame is returned.
    pub fn on_fragment(&mut self, frame: RxFrame, now: Instant) -> Option<RxFrame> {
        let desc = *frame.desc();
        if desc.is_unfragmented() {
            return Some(frame);
        }
        let key = frame.key();
        let seq = frame.seq();
        let frag_num = desc.frag_num();

        if frag_num == 0 {
            self.start_chain(frame, now);
            return None;
        }

        let Some(index) = self.position(key) else {
            debug!(
                "Dropping orphan fragment {} of seq {} for STA {} TID {}.",
                frag_num,
                seq.value(),
                key.station,
                key.tid
            );
            return None;
        };
        let node = &mut self.nodes[index];
        if node.seq != seq || node.last_frag.wrapping_add(1) != frag_num {
            debug!(
                "Dropping fragment {} of seq {}, expected fragment {} of seq {}.",
                frag_num,
                seq.value(),
                node.last_frag.wrapping_add(1),
                node.seq.value()
            );
            return None;
        }
        let Some(added) = desc.msdu_len().checked_sub(node.link_header_len) else {
            debug!("Dropping fragment {} shorter than its link header.", frag_num);
            return None;
        };
        if node.fragments.try_reserve(1).is_err() {
            self.purge(index, "allocation failed");
            return None;
        }
        node.fragments.push(frame);
        node.msdu_len += added;
        node.last_frag = frag_num;
        node.last_update = now;

        if desc.more_frag() {
            self.touch(index);
            return None;
        }
        let node = self.nodes.remove(index);
        match self.assemble(&node) {
            Ok(frame) => {
                trace!(
                    "Reassembled seq {} from {} fragments.",
                    seq.value(),
                    node.fragments.len()
                );
                Some(frame)
            }
            Err(_err) => {
                warn!(
                    "Discarding {} fragments of seq {}: {:?}",
                    node.fragments.len(),
                    seq.value(),
                    _err
                );
                None
            }
        }
    }
    fn start_chain(&mut self, frame: RxFrame, now: Instant) {
        let key = frame.key();
        let seq = frame.seq();
        if let Some(index) = self.position(key) {
            let existing = self.nodes[index].seq;
            if !existing.precedes_or_eq(seq) {
                debug!(
                    "Dropping first fragment of seq {}, chain for seq {} is newer.",
                    seq.value(),
                    existing.value()
                );
                return;
            }
            self.purge(index, "replaced by a new chain");
        }
        if self.nodes.len() >= self.capacity {
            if let Some(evicted) = self.nodes.pop() {
                debug!(
                    "Evicting fragment chain of STA {} TID {}.",
                    evicted.key.station, evicted.key.tid
                );
            }
        }
        let mut fragments = Vec::new();
        if fragments.try_reserve(4).is_err() {
            warn!("Dropping first fragment of seq {}, out of memory.", seq.value());
            return;
        }
        let desc = *frame.desc();
        fragments.push(frame);
        self.nodes.insert(
            0,
            DefragNode {
                key,
                seq,
                last_frag: 0,
                msdu_len: desc.msdu_len(),
                link_header_len: desc.link_header_len(),
                fragments,
                last_update: now,
            },
        );
    }
    fn purge(&mut self, index: usize, _reason: &str) {
        let node = self.nodes.remove(index);
        debug!(
            "Discarding fragment chain of seq {}: {}",
            node.seq.value(),
            _reason
        );
    }
    /// Concatenate the fragments of a node into one frame.
    ///
    /// The first fragment is copied whole, including its descriptor. Later fragments are copied
    /// without their link header.
    fn assemble(&self, node: &DefragNode) -> HifResult<RxFrame> {
        let first = node.fragments.first().ok_or(HifError::Malformed)?;
        if node.msdu_len > self.max_frame_len {
            return Err(HifError::OutOfMemory);
        }
        let msdu_len = u16::try_from(node.msdu_len).map_err(|_| HifError::OutOfMemory)?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(first.desc().msdu_offset() + node.msdu_len)
            .map_err(|_| HifError::OutOfMemory)?;
        bytes.extend_from_slice(first.as_bytes());
        for fragment in node.fragments.iter().skip(1) {
            let payload = fragment.payload();
            bytes.extend_from_slice(&payload[node.link_header_len.min(payload.len())..]);
        }

        let mut desc = *first.desc();
        desc.layout = desc.layout.with_msdu_len(msdu_len);
        desc.security = desc.security.with_more_frag(false).with_frag_num(0);
        desc.write(&mut bytes).ok_or(HifError::Malformed)?;
        // The hardware checksum only covered the first fragment.
        RxFrame::new(bytes)
    }
    /// Drop chains, which haven't seen a fragment for longer than the lifetime.
    pub fn expire(&mut self, now: Instant) -> usize {
        let lifetime = self.lifetime;
        let before = self.nodes.len();
        self.nodes.retain(|node| {
            !now.checked_duration_since(node.last_update)
                .is_some_and(|age| age > lifetime)
        });
        let expired = before - self.nodes.len();
        if expired != 0 {
            debug!("Expired {} fragment chains.", expired);
        }
        expired
    }
    /// Drop all chains of a station.
    pub fn recover(&mut self, station: u8) {
        self.nodes.retain(|node| node.key.station != station);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::msdu_bytes;

    fn fragment(seq: u16, frag_num: u8, more_frag: bool, msdu_len: u16, fill: u8) -> RxFrame {
        RxFrame::new(msdu_bytes(1, 0, seq, frag_num, more_frag, msdu_len, fill)).unwrap()
    }
    fn engine() -> DefragEngine {
        DefragEngine::new(3, Duration::from_millis(500), 4096)
    }
    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn reassembles_three_fragments() {
        let mut engine = engine();
        assert!(engine.on_fragment(fragment(10, 0, true, 100, 0xa0), at(0)).is_none());
        assert!(engine.on_fragment(fragment(10, 1, true, 114, 0xa1), at(1)).is_none());
        let frame = engine
            .on_fragment(fragment(10, 2, false, 114, 0xa2), at(2))
            .unwrap();

        let payload = frame.payload();
        assert_eq!(payload.len(), 300);
        assert!(payload[..100].iter().all(|byte| *byte == 0xa0));
        assert!(payload[100..200].iter().all(|byte| *byte == 0xa1));
        assert!(payload[200..].iter().all(|byte| *byte == 0xa2));
        assert_eq!(frame.desc().msdu_len(), 300);
        assert!(frame.desc().is_unfragmented());
        assert_eq!(engine.active_streams(), 0);
    }

    #[test]
    fn missing_fragment_never_yields_partial_frame() {
        let mut engine = engine();
        assert!(engine.on_fragment(fragment(10, 0, true, 100, 0xa0), at(0)).is_none());
        // Fragment 1 got lost.
        assert!(engine.on_fragment(fragment(10, 2, false, 114, 0xa2), at(1)).is_none());
        assert!(engine.on_fragment(fragment(11, 0, true, 100, 0xb0), at(2)).is_none());
        let frame = engine
            .on_fragment(fragment(11, 1, false, 114, 0xb1), at(3))
            .unwrap();
        assert_eq!(frame.seq().value(), 11);
        assert_eq!(frame.payload().len(), 200);
        assert!(frame.payload()[..100].iter().all(|byte| *byte == 0xb0));
        assert!(frame.payload()[100..].iter().all(|byte| *byte == 0xb1));
    }

    #[test]
    fn newer_chain_wins() {
        let mut engine = engine();
        engine.on_fragment(fragment(20, 0, true, 100, 0xa0), at(0));
        // An older first fragment is dropped.
        assert!(engine.on_fragment(fragment(19, 0, true, 100, 0xff), at(1)).is_none());
        let frame = engine
            .on_fragment(fragment(20, 1, false, 114, 0xa1), at(2))
            .unwrap();
        assert_eq!(frame.payload()[0], 0xa0);

        // A first fragment with the same sequence number restarts the chain.
        engine.on_fragment(fragment(30, 0, true, 100, 0xa0), at(3));
        engine.on_fragment(fragment(30, 0, true, 50, 0xc0), at(4));
        let frame = engine
            .on_fragment(fragment(30, 1, false, 64, 0xc1), at(5))
            .unwrap();
        assert_eq!(frame.payload().len(), 100);
        assert_eq!(frame.payload()[0], 0xc0);
    }

    #[test]
    fn chain_survives_wraparound() {
        let mut engine = engine();
        engine.on_fragment(fragment(4095, 0, true, 100, 0xa0), at(0));
        // Seq 0 follows 4095, so it replaces the chain.
        engine.on_fragment(fragment(0, 0, true, 100, 0xb0), at(1));
        assert!(engine.on_fragment(fragment(4095, 1, false, 114, 0xa1), at(2)).is_none());
        let frame = engine
            .on_fragment(fragment(0, 1, false, 114, 0xb1), at(3))
            .unwrap();
        assert_eq!(frame.seq().value(), 0);
    }

    #[test]
    fn unfragmented_frames_bypass() {
        let mut engine = engine();
        let frame = fragment(5, 0, false, 60, 0x11);
        assert_eq!(engine.on_fragment(frame.clone(), at(0)), Some(frame));
        assert_eq!(engine.active_streams(), 0);
    }

    #[test]
    fn least_recently_used_chain_is_evicted() {
        let mut engine = engine();
        for station in 0..4 {
            let frame = RxFrame::new(msdu_bytes(station, 0, 1, 0, true, 40, 0)).unwrap();
            engine.on_fragment(frame, at(station as u64));
        }
        assert_eq!(engine.active_streams(), 3);
        // Station 0 was evicted, so its second fragment is an orphan.
        let frame = RxFrame::new(msdu_bytes(0, 0, 1, 1, false, 54, 0)).unwrap();
        assert!(engine.on_fragment(frame, at(5)).is_none());
        let frame = RxFrame::new(msdu_bytes(1, 0, 1, 1, false, 54, 0)).unwrap();
        assert!(engine.on_fragment(frame, at(6)).is_some());
    }

    #[test]
    fn oversized_frames_are_discarded() {
        let mut engine = DefragEngine::new(3, Duration::from_millis(500), 150);
        engine.on_fragment(fragment(10, 0, true, 100, 0), at(0));
        assert!(engine.on_fragment(fragment(10, 1, false, 114, 0), at(1)).is_none());
        assert_eq!(engine.active_streams(), 0);
    }

    #[test]
    fn expire_and_recover() {
        let mut engine = engine();
        engine.on_fragment(fragment(10, 0, true, 100, 0), at(0));
        let frame = RxFrame::new(msdu_bytes(2, 3, 10, 0, true, 100, 0)).unwrap();
        engine.on_fragment(frame, at(400));
        assert_eq!(engine.expire(at(600)), 1);
        assert_eq!(engine.active_streams(), 1);
        engine.recover(2);
        assert_eq!(engine.active_streams(), 0);
    }
}
