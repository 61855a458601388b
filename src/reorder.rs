//! Block-ack reordering.
//!
//! The firmware delivers frames of an aggregation session in the order they were received, which
//! isn't necessarily the order they were sent in. For every stream with a block-ack session, a
//! window of sequence numbers is tracked and frames are released in order.
//!
//! The engine is generic over the buffered item, so that it can be driven without real frames.
use alloc::vec::Vec;

use embassy_time::{Duration, Instant};

use crate::{
    config::HifConfig,
    error::{HifError, HifResult},
    frame::StreamKey,
    seq::SeqNum,
};

/// What the reorder engine needs to know about a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameMeta {
    pub key: StreamKey,
    pub seq: SeqNum,
    /// The packet number, if the cipher provides one.
    pub pn: Option<u64>,
    /// Whether this is the last MSDU of its MPDU. Only A-MSDU subframes clear this.
    pub last_msdu: bool,
    /// Whether the firmware marked the frame as part of a block-ack session.
    pub ba_session: bool,
}
impl FrameMeta {
    pub const fn new(key: StreamKey, seq: SeqNum) -> Self {
        Self {
            key,
            seq,
            pn: None,
            last_msdu: true,
            ba_session: true,
        }
    }
}

/// The frames buffered for one sequence number.
struct Slot<T> {
    seq: SeqNum,
    items: Vec<T>,
    /// Cleared while an A-MSDU is still missing subframes.
    complete: bool,
    pn: Option<u64>,
}

struct ReorderNode<T> {
    key: StreamKey,
    start: SeqNum,
    size: u16,
    /// Indexed by `seq & (slots.len() - 1)`.
    slots: Vec<Option<Slot<T>>>,
    buffered: usize,
    last_pn: Option<u64>,
    pn_reset: bool,
    deadline: Option<Instant>,
    timeouts: u8,
    last_used: u64,
}
impl<T> ReorderNode<T> {
    fn new(key: StreamKey, start: SeqNum, size: u16, last_used: u64) -> HifResult<Self> {
        let size = size.clamp(1, SeqNum::HALF);
        let slot_count = (size as usize).next_power_of_two();
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(slot_count)
            .map_err(|_| HifError::OutOfMemory)?;
        slots.resize_with(slot_count, || None);
        Ok(Self {
            key,
            start,
            size,
            slots,
            buffered: 0,
            last_pn: None,
            pn_reset: false,
            deadline: None,
            timeouts: 0,
            last_used,
        })
    }
    fn index(&self, seq: SeqNum) -> usize {
        seq.value() as usize & (self.slots.len() - 1)
    }
    /// Check the PN against the last delivered one.
    fn accept_pn(&mut self, pn: Option<u64>) -> bool {
        let Some(pn) = pn else {
            return true;
        };
        if let Some(last_pn) = self.last_pn {
            if pn <= last_pn && !self.pn_reset {
                debug!(
                    "Dropping replayed frame for STA {} TID {}, PN {} <= {}.",
                    self.key.station, self.key.tid, pn, last_pn
                );
                return false;
            }
        }
        self.last_pn = Some(pn);
        self.pn_reset = false;
        true
    }
    fn deliver(&mut self, slot: Slot<T>, out: &mut impl FnMut(T)) {
        if self.accept_pn(slot.pn) {
            slot.items.into_iter().for_each(out);
        }
    }
    /// Take the slot of `seq` out of the window, if it's buffered.
    fn take(&mut self, seq: SeqNum) -> Option<Slot<T>> {
        let index = self.index(seq);
        if !matches!(&self.slots[index], Some(slot) if slot.seq == seq) {
            return None;
        }
        self.buffered -= 1;
        self.slots[index].take()
    }
    /// Release complete slots from the start of the window, until a gap is hit.
    fn release_contiguous(&mut self, out: &mut impl FnMut(T)) {
        loop {
            let start = self.start;
            let ready = matches!(
                &self.slots[self.index(start)],
                Some(slot) if slot.seq == start && slot.complete
            );
            if !ready {
                break;
            }
            if let Some(slot) = self.take(start) {
                self.deliver(slot, out);
            }
            self.start = start + 1;
        }
    }
    /// Move the start of the window to `new_start`, releasing everything before it in order.
    ///
    /// `new_start` must not precede the current start.
    fn release_until(&mut self, new_start: SeqNum, out: &mut impl FnMut(T)) {
        // Nothing is buffered beyond one lap of the slots.
        let steps = new_start
            .distance_from(self.start)
            .min(self.slots.len() as u16);
        for offset in 0..steps {
            if self.buffered == 0 {
                break;
            }
            if let Some(slot) = self.take(self.start + offset) {
                self.deliver(slot, out);
            }
        }
        self.start = new_start;
    }
    /// Release everything buffered in order.
    fn flush(&mut self, out: &mut impl FnMut(T)) {
        let end = self.start + self.slots.len() as u16;
        self.release_until(end, out);
    }
    fn first_buffered(&self) -> Option<SeqNum> {
        (0..self.slots.len() as u16)
            .map(|offset| self.start + offset)
            .find(|seq| matches!(&self.slots[self.index(*seq)], Some(slot) if slot.seq == *seq))
    }
    /// Skip the gap at the start of the window.
    fn force_release(&mut self, out: &mut impl FnMut(T)) {
        let Some(first) = self.first_buffered() else {
            return;
        };
        self.release_until(first, out);
        // The first slot is released, even if the A-MSDU is incomplete.
        if let Some(slot) = self.take(first) {
            self.deliver(slot, out);
        }
        self.start = first + 1;
        self.release_contiguous(out);
    }
    fn insert(
        &mut self,
        seq: SeqNum,
        item: Option<T>,
        pn: Option<u64>,
        last_msdu: bool,
        out: &mut impl FnMut(T),
    ) {
        if seq.precedes(self.start) {
            trace!(
                "Dropping stale seq {}, window starts at {}.",
                seq.value(),
                self.start.value()
            );
            return;
        }
        if !seq.is_within(self.start, self.size) {
            self.release_until(seq - (self.size - 1), out);
        }
        let index = self.index(seq);
        if seq == self.start && self.buffered == 0 && last_msdu && self.slots[index].is_none() {
            if self.accept_pn(pn) {
                item.into_iter().for_each(&mut *out);
            }
            self.start = seq + 1;
            return;
        }
        match &mut self.slots[index] {
            Some(slot) if slot.seq == seq && !slot.complete => {
                if let Some(item) = item {
                    if slot.items.try_reserve(1).is_ok() {
                        slot.items.push(item);
                    } else {
                        warn!("Dropping A-MSDU subframe of seq {}, out of memory.", seq.value());
                    }
                }
                slot.complete = last_msdu;
            }
            existing => {
                let mut items = Vec::new();
                if let Some(item) = item {
                    if items.try_reserve(1).is_err() {
                        warn!("Dropping seq {}, out of memory.", seq.value());
                        return;
                    }
                    items.push(item);
                }
                if existing.is_some() {
                    trace!("Replacing buffered seq {}.", seq.value());
                } else {
                    self.buffered += 1;
                }
                *existing = Some(Slot {
                    seq,
                    items,
                    complete: last_msdu,
                    pn,
                });
            }
        }
        self.release_contiguous(out);
    }
    /// Push the deadline out, while frames are waiting.
    fn rearm(&mut self, now: Instant, timeout: Duration) {
        if self.buffered != 0 {
            self.deadline = Some(now + timeout);
        } else {
            self.deadline = None;
            self.timeouts = 0;
        }
    }
}

/// The reorder engine.
pub struct ReorderEngine<T> {
    nodes: Vec<ReorderNode<T>>,
    max_streams: usize,
    default_window: u16,
    timeout: Duration,
    max_timeouts: u8,
    tick: u64,
}
impl<T> ReorderEngine<T> {
    pub fn new(
        max_streams: usize,
        default_window: u16,
        timeout: Duration,
        max_timeouts: u8,
    ) -> Self {
        Self {
            nodes: Vec::new(),
            max_streams: max_streams.max(1),
            default_window,
            timeout,
            max_timeouts,
            tick: 0,
        }
    }
    pub fn from_config(config: &HifConfig) -> Self {
        Self::new(
            config.max_reorder_streams,
            config.default_reorder_window,
            config.reorder_timeout,
            config.max_reorder_timeouts,
        )
    }
    fn position(&self, key: StreamKey) -> Option<usize> {
        self.nodes.iter().position(|node| node.key == key)
    }
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
    fn create(
        &mut self,
        key: StreamKey,
        start: SeqNum,
        size: u16,
        out: &mut impl FnMut(T),
    ) -> HifResult<usize> {
        if self.nodes.len() >= self.max_streams {
            if let Some(index) = self
                .nodes
                .iter()
                .enumerate()
                .min_by_key(|(_, node)| node.last_used)
                .map(|(index, _)| index)
            {
                let mut evicted = self.nodes.remove(index);
                debug!(
                    "Evicting reorder stream of STA {} TID {}.",
                    evicted.key.station, evicted.key.tid
                );
                evicted.flush(out);
            }
        }
        let tick = self.next_tick();
        let node = ReorderNode::new(key, start, size, tick)?;
        self.nodes
            .try_reserve(1)
            .map_err(|_| HifError::OutOfMemory)?;
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }
    /// Process a received frame.
    ///
    /// Frames are handed to `out` in sequence order. Frames of streams without a block-ack
    /// session are passed through.
    pub fn on_frame(&mut self, meta: FrameMeta, item: T, now: Instant, out: &mut impl FnMut(T)) {
        let index = match self.position(meta.key) {
            Some(index) => index,
            None if meta.ba_session => {
                match self.create(meta.key, meta.seq, self.default_window, out) {
                    Ok(index) => index,
                    Err(_) => {
                        out(item);
                        return;
                    }
                }
            }
            None => {
                out(item);
                return;
            }
        };
        let tick = self.next_tick();
        let timeout = self.timeout;
        let node = &mut self.nodes[index];
        node.last_used = tick;
        node.insert(meta.seq, Some(item), meta.pn, meta.last_msdu, out);
        node.rearm(now, timeout);
    }
    /// Set up a block-ack session (ADDBA).
    ///
    /// An existing session for the stream is flushed and restarted at `start`.
    pub fn add_ba(
        &mut self,
        key: StreamKey,
        start: SeqNum,
        window_size: u16,
        out: &mut impl FnMut(T),
    ) -> HifResult<()> {
        let mut last_pn = None;
        if let Some(index) = self.position(key) {
            let mut node = self.nodes.remove(index);
            node.flush(out);
            last_pn = node.last_pn;
        }
        let index = self.create(key, start, window_size, out)?;
        self.nodes[index].last_pn = last_pn;
        debug!(
            "Block-ack session for STA {} TID {} at seq {} with window {}.",
            key.station,
            key.tid,
            start.value(),
            window_size
        );
        Ok(())
    }
    /// Tear down a block-ack session (DELBA), releasing buffered frames in order.
    pub fn del_ba(&mut self, key: StreamKey, out: &mut impl FnMut(T)) -> bool {
        let Some(index) = self.position(key) else {
            return false;
        };
        let mut node = self.nodes.remove(index);
        node.flush(out);
        debug!(
            "Block-ack session for STA {} TID {} removed.",
            key.station, key.tid
        );
        true
    }
    /// Handle a block-ack request (BAR), which moves the window start forward.
    pub fn bar(&mut self, key: StreamKey, start: SeqNum, now: Instant, out: &mut impl FnMut(T)) {
        let timeout = self.timeout;
        let Some(node) = self.nodes.iter_mut().find(|node| node.key == key) else {
            return;
        };
        if !node.start.precedes(start) {
            return;
        }
        node.release_until(start, out);
        node.release_contiguous(out);
        node.rearm(now, timeout);
    }
    /// Mark a sequence number as consumed by a frame, that won't be delivered (FILTER).
    pub fn filter(&mut self, key: StreamKey, seq: SeqNum, now: Instant, out: &mut impl FnMut(T)) {
        let timeout = self.timeout;
        let Some(node) = self.nodes.iter_mut().find(|node| node.key == key) else {
            return;
        };
        node.insert(seq, None, None, true, out);
        node.rearm(now, timeout);
    }
    /// Remove every stream of a station, releasing buffered frames in order.
    pub fn remove_station(&mut self, station: u8, out: &mut impl FnMut(T)) {
        while let Some(index) = self
            .nodes
            .iter()
            .position(|node| node.key.station == station)
        {
            let mut node = self.nodes.remove(index);
            node.flush(out);
        }
    }
    /// Let the next frame of the station through, even if its PN didn't increase.
    pub fn reset_pn(&mut self, station: u8) {
        self.nodes
            .iter_mut()
            .filter(|node| node.key.station == station)
            .for_each(|node| node.pn_reset = true);
    }
    /// Release frames of stalled windows.
    ///
    /// Returns the streams, which stalled too often and were removed. The control plane should
    /// tear down their block-ack sessions.
    pub fn poll_timeouts(&mut self, now: Instant, out: &mut impl FnMut(T)) -> Vec<StreamKey> {
        let timeout = self.timeout;
        let max_timeouts = self.max_timeouts;
        let mut lost = Vec::new();
        let mut index = 0;
        while index < self.nodes.len() {
            let node = &mut self.nodes[index];
            if !node.deadline.is_some_and(|deadline| deadline <= now) {
                index += 1;
                continue;
            }
            node.timeouts += 1;
            if node.timeouts > max_timeouts {
                let mut node = self.nodes.remove(index);
                warn!(
                    "Reorder stream of STA {} TID {} lost.",
                    node.key.station, node.key.tid
                );
                node.flush(out);
                lost.push(node.key);
                continue;
            }
            trace!(
                "Reorder timeout for STA {} TID {} at seq {}.",
                node.key.station,
                node.key.tid,
                node.start.value()
            );
            node.force_release(out);
            node.rearm(now, timeout);
            index += 1;
        }
        lost
    }
    /// The earliest deadline of all streams.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.nodes.iter().filter_map(|node| node.deadline).min()
    }
    /// The start and size of the stream's window.
    pub fn window(&self, key: StreamKey) -> Option<(SeqNum, u16)> {
        self.nodes
            .iter()
            .find(|node| node.key == key)
            .map(|node| (node.start, node.size))
    }
    pub fn buffered(&self, key: StreamKey) -> usize {
        self.nodes
            .iter()
            .find(|node| node.key == key)
            .map(|node| node.buffered)
            .unwrap_or(0)
    }
    pub fn stream_count(&self) -> usize {
        self.nodes.len()
    }
}
