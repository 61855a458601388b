//! The pool of transfer buffers shared between host and device.
//!
//! Every buffer has exactly one owner at a time, which is tracked by its [BufferState]:
//!
//! ```text
//!          acquire                 map_for_device
//!   Free ----------> HostOwned -------------------> DeviceOwned
//!    ^                |    ^                            |
//!    +----------------+    +----------------------------+
//!          release                    unmap
//! ```
//!
//! While a buffer is owned by the host, it's represented by a [HostBuffer], which can't be cloned.
//! Moving the [HostBuffer] back into the pool is the only way to change the owner, so a buffer can
//! never be owned by two parties at once.
use alloc::{boxed::Box, vec::Vec};
use core::{
    cell::RefCell,
    mem,
    ops::{Deref, DerefMut},
};

use embassy_sync::blocking_mutex;

use crate::{
    batch::{AddrValueType, AddressBatch, SealedBatch},
    descriptor::{RxMsduDesc, RX_MH_DESC_LEN},
    error::{HifError, HifResult},
    link::{ChannelId, LinkBuffer, LinkChannel},
    sync::SignalQueue,
    DefaultRawMutex,
};

/// How often the write-done bit is checked, before we give up waiting for the device.
const MAX_WRITE_DONE_RETRIES: usize = 8;

/// An address in the device's view of memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceAddress(u64);
impl DeviceAddress {
    /// Marks an address as pointing to host memory.
    pub const MH_ADDRESS_BIT: u64 = 1 << 39;
    /// Addresses are 40 bits wide on the wire.
    pub const PHYS_MASK: u64 = (1 << 40) - 1;
    pub const WIRE_LEN: usize = 5;

    /// Create a device address from a physical (bus) address.
    pub const fn from_physical(physical: u64) -> Self {
        Self((physical | Self::MH_ADDRESS_BIT) & Self::PHYS_MASK)
    }
    /// The physical address, without the marker bit.
    pub const fn physical(self) -> u64 {
        self.0 & !Self::MH_ADDRESS_BIT & Self::PHYS_MASK
    }
    pub const fn raw(self) -> u64 {
        self.0
    }
    /// The little endian wire representation.
    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut wire = [0u8; Self::WIRE_LEN];
        wire.copy_from_slice(&self.0.to_le_bytes()[..Self::WIRE_LEN]);
        wire
    }
    /// Read an address from the wire. Missing bytes are treated as zero.
    pub fn from_wire(wire: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        let len = wire.len().min(Self::WIRE_LEN);
        raw[..len].copy_from_slice(&wire[..len]);
        Self(u64::from_le_bytes(raw) & Self::PHYS_MASK)
    }
}

/// Identifies a buffer inside a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufferId(pub u16);

/// The direction in which data flows through a mapped buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaDirection {
    /// The device writes into the buffer.
    FromDevice,
    /// The device reads from the buffer.
    ToDevice,
}

/// Who currently owns a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferState {
    Free,
    HostOwned,
    DeviceOwned(DmaDirection),
    /// The buffer couldn't be mapped or was force reclaimed and is never used again.
    Lost,
}

/// Translates between host buffers and device addresses.
pub trait DmaMapper {
    /// Map a buffer for the device and return its physical address.
    fn map(&mut self, id: BufferId, buffer: &mut [u8], direction: DmaDirection) -> Option<u64>;
    /// Find the buffer mapped at `physical` and unmap it.
    fn unmap(&mut self, physical: u64) -> Option<BufferId>;
    /// Make the device's writes to the buffer visible to the CPU.
    fn sync_for_cpu(&mut self, _id: BufferId, _buffer: &mut [u8]) {}
}

/// A mapper, which places buffer `n` at `base + n * stride`.
///
/// This is what a linear IOMMU window looks like and is useful for SDIO, where addresses are never
/// sent to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearMapper {
    base: u64,
    stride: u64,
    count: usize,
}
impl LinearMapper {
    pub const fn new(base: u64, stride: u64, count: usize) -> Self {
        Self {
            base,
            stride,
            count,
        }
    }
}
impl DmaMapper for LinearMapper {
    fn map(&mut self, id: BufferId, _buffer: &mut [u8], _direction: DmaDirection) -> Option<u64> {
        if (id.0 as usize) < self.count {
            Some(self.base + id.0 as u64 * self.stride)
        } else {
            None
        }
    }
    fn unmap(&mut self, physical: u64) -> Option<BufferId> {
        let offset = physical.checked_sub(self.base)?;
        if self.stride == 0 || offset % self.stride != 0 {
            return None;
        }
        let index = offset / self.stride;
        (index < self.count as u64).then_some(BufferId(index as u16))
    }
}

/// A buffer currently owned by the host.
#[derive(Debug)]
pub struct HostBuffer {
    id: BufferId,
    data: Box<[u8]>,
}
impl HostBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }
}
impl Deref for HostBuffer {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
impl DerefMut for HostBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u32,
    pub released: u32,
    pub mapped: u32,
    pub unmapped: u32,
    pub lost: u32,
    /// Buffers, which were unmapped while the device hadn't marked them as written.
    pub write_pending: u32,
}

struct Slot {
    state: BufferState,
    /// The memory of the buffer, while it's not owned by a [HostBuffer].
    storage: Option<Box<[u8]>>,
    address: Option<DeviceAddress>,
}

struct PoolState<M> {
    mapper: M,
    slots: Vec<Slot>,
    free_list: Vec<BufferId>,
    batch: AddressBatch,
    /// A batch, which was sealed but rejected by the link.
    unsent: Option<SealedBatch>,
    device_owned: usize,
    stats: PoolStats,
}
impl<M: DmaMapper> PoolState<M> {
    fn slot_mut(&mut self, id: BufferId) -> HifResult<&mut Slot> {
        self.slots
            .get_mut(id.0 as usize)
            .ok_or(HifError::InvalidBufferState)
    }
    fn take_full_batch(&mut self, force: bool, hif_offset: usize) -> HifResult<Option<SealedBatch>> {
        if let Some(unsent) = self.unsent.take() {
            return Ok(Some(unsent));
        }
        if self.batch.is_empty() || !(force || self.batch.is_full()) {
            return Ok(None);
        }
        let capacity = self.batch.capacity();
        let batch = mem::replace(
            &mut self.batch,
            AddressBatch::new(AddrValueType::Process, capacity),
        );
        batch.seal(hif_offset).map(Some)
    }
}

/// A fixed set of transfer buffers.
pub struct BufferPool<M> {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<PoolState<M>>>,
    buffer_size: usize,
    hif_offset: usize,
    replenish: SignalQueue,
}
impl<M: DmaMapper> BufferPool<M> {
    /// Allocate the buffers of the pool.
    pub fn new(
        capacity: usize,
        buffer_size: usize,
        batch_capacity: usize,
        hif_offset: usize,
        mapper: M,
    ) -> HifResult<Self> {
        if capacity > u16::MAX as usize {
            return Err(HifError::OutOfMemory);
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| HifError::OutOfMemory)?;
        let mut free_list = Vec::new();
        free_list
            .try_reserve_exact(capacity)
            .map_err(|_| HifError::OutOfMemory)?;
        for index in 0..capacity {
            let mut storage = Vec::new();
            storage
                .try_reserve_exact(buffer_size)
                .map_err(|_| HifError::OutOfMemory)?;
            storage.resize(buffer_size, 0u8);
            slots.push(Slot {
                state: BufferState::Free,
                storage: Some(storage.into_boxed_slice()),
                address: None,
            });
            // Buffers are taken from the end, so we push them in reverse.
            free_list.push(BufferId((capacity - 1 - index) as u16));
        }
        debug!(
            "Allocated buffer pool with {} buffers of {} bytes.",
            capacity, buffer_size
        );
        Ok(Self {
            state: blocking_mutex::Mutex::new(RefCell::new(PoolState {
                mapper,
                slots,
                free_list,
                batch: AddressBatch::new(AddrValueType::Process, batch_capacity),
                unsent: None,
                device_owned: 0,
                stats: PoolStats::default(),
            })),
            buffer_size,
            hif_offset,
            replenish: SignalQueue::new(),
        })
    }
    fn with_state<R>(&self, f: impl FnOnce(&mut PoolState<M>) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
    /// Take a free buffer out of the pool.
    ///
    /// If no buffer is free, [HifError::Exhausted] is returned and the replenish signal is raised,
    /// so that a worker can retry later.
    pub fn acquire(&self) -> HifResult<HostBuffer> {
        let acquired = self.with_state(|state| {
            let id = state.free_list.pop().ok_or(HifError::Exhausted)?;
            state.stats.acquired += 1;
            let slot = state.slot_mut(id)?;
            debug_assert_eq!(slot.state, BufferState::Free);
            slot.state = BufferState::HostOwned;
            let data = slot.storage.take().ok_or(HifError::InvalidBufferState)?;
            Ok(HostBuffer { id, data })
        });
        if acquired.is_err() {
            trace!("Buffer pool exhausted.");
            self.replenish.put();
        }
        acquired
    }
    /// Return a buffer to the free list.
    pub fn release(&self, buffer: HostBuffer) -> HifResult<()> {
        self.with_state(|state| {
            let HostBuffer { id, data } = buffer;
            let slot = state.slot_mut(id)?;
            if slot.state != BufferState::HostOwned || slot.storage.is_some() {
                error!("Buffer {} released while not owned by the host.", id.0);
                return Err(HifError::InvalidBufferState);
            }
            slot.state = BufferState::Free;
            slot.storage = Some(data);
            state.free_list.push(id);
            state.stats.released += 1;
            Ok(())
        })
    }
    /// Hand a buffer to the device and return the address the device should use.
    ///
    /// Before a receive buffer is handed out, its write-done bit is cleared, so stale contents
    /// can't be mistaken for a completed write. If the buffer can't be mapped, it's counted as
    /// lost and never used again.
    pub fn map_for_device(
        &self,
        mut buffer: HostBuffer,
        direction: DmaDirection,
    ) -> HifResult<DeviceAddress> {
        if direction == DmaDirection::FromDevice {
            let _ = RxMsduDesc::set_write_done_at(&mut buffer, RX_MH_DESC_LEN, false);
        }
        self.with_state(|state| {
            let HostBuffer { id, mut data } = buffer;
            let physical = state.mapper.map(id, &mut data, direction);
            let stats = &mut state.stats;
            let slot = state
                .slots
                .get_mut(id.0 as usize)
                .ok_or(HifError::InvalidBufferState)?;
            if slot.state != BufferState::HostOwned {
                return Err(HifError::InvalidBufferState);
            }
            slot.storage = Some(data);
            let Some(physical) = physical else {
                error!("Failed to map buffer {} for the device.", id.0);
                slot.state = BufferState::Lost;
                stats.lost += 1;
                return Err(HifError::TranslationFailed);
            };
            let address = DeviceAddress::from_physical(physical);
            slot.state = BufferState::DeviceOwned(direction);
            slot.address = Some(address);
            stats.mapped += 1;
            state.device_owned += 1;
            Ok(address)
        })
    }
    /// Take a buffer back from the device.
    ///
    /// The buffer stays owned by the host. It's up to the caller to reuse or release it.
    pub fn unmap(&self, address: DeviceAddress) -> HifResult<HostBuffer> {
        self.take_back(address, true)
    }
    /// Undo [Self::map_for_device] for a buffer the device never learned about.
    ///
    /// Unlike [Self::unmap], this doesn't wait for the write-done bit, since the device can't have
    /// written to the buffer.
    pub fn cancel_map(&self, address: DeviceAddress) -> HifResult<HostBuffer> {
        self.take_back(address, false)
    }
    fn take_back(&self, address: DeviceAddress, check_write_done: bool) -> HifResult<HostBuffer> {
        self.with_state(|state| {
            let Some(id) = state.mapper.unmap(address.physical()) else {
                warn!("Unmapping unknown address {:x}.", address.raw());
                return Err(HifError::UnknownAddress);
            };
            let PoolState {
                mapper,
                slots,
                stats,
                device_owned,
                ..
            } = state;
            let slot = slots
                .get_mut(id.0 as usize)
                .ok_or(HifError::UnknownAddress)?;
            let BufferState::DeviceOwned(direction) = slot.state else {
                warn!("Buffer {} unmapped while not owned by the device.", id.0);
                return Err(HifError::InvalidBufferState);
            };
            if slot.address.map(DeviceAddress::physical) != Some(address.physical()) {
                return Err(HifError::UnknownAddress);
            }
            let mut data = slot.storage.take().ok_or(HifError::InvalidBufferState)?;
            if check_write_done && direction == DmaDirection::FromDevice {
                let mut retries = 0;
                while RxMsduDesc::write_done_at(&data, RX_MH_DESC_LEN) == Some(false)
                    && retries < MAX_WRITE_DONE_RETRIES
                {
                    mapper.sync_for_cpu(id, &mut data);
                    retries += 1;
                }
                if retries == MAX_WRITE_DONE_RETRIES {
                    warn!("Device still writing buffer {} after unmap.", id.0);
                    stats.write_pending += 1;
                }
            }
            slot.state = BufferState::HostOwned;
            slot.address = None;
            stats.unmapped += 1;
            *device_owned -= 1;
            Ok(HostBuffer { id, data })
        })
    }
    /// Add an address to the current address batch.
    ///
    /// Once the batch is full, it's flushed to the link. If that fails, the batch is kept and
    /// flushing is retried on the next call. While a full batch can't be flushed,
    /// [HifError::BatchBusy] is returned and the address isn't taken.
    pub fn batch_address(
        &self,
        address: DeviceAddress,
        link: &mut impl LinkChannel,
    ) -> HifResult<()> {
        // Retry a previously failed flush first.
        let _ = self.flush_full(link);
        self.with_state(|state| {
            if state.unsent.is_some() {
                return Err(HifError::BatchBusy);
            }
            state.batch.push(address).map_err(|_| HifError::BatchBusy)
        })?;
        // The flush result doesn't matter here, since the address is in the batch either way.
        let _ = self.flush_full(link);
        Ok(())
    }
    fn flush_full(&self, link: &mut impl LinkChannel) -> HifResult<()> {
        self.flush_internal(link, false)
    }
    /// Flush the current batch, even if it's not full yet.
    pub fn flush_addresses(&self, link: &mut impl LinkChannel) -> HifResult<()> {
        // An unsent batch is flushed first, then the open one.
        self.flush_internal(link, true)?;
        self.flush_internal(link, true)
    }
    fn flush_internal(&self, link: &mut impl LinkChannel, force: bool) -> HifResult<()> {
        let hif_offset = self.hif_offset;
        let Some(sealed) = self.with_state(|state| state.take_full_batch(force, hif_offset))?
        else {
            return Ok(());
        };
        let count = sealed.count();
        match link.submit(
            ChannelId::AddressHandoff,
            alloc::vec![LinkBuffer::AddressBatch(sealed)],
        ) {
            Ok(()) => {
                trace!("Flushed address batch with {} addresses.", count);
                Ok(())
            }
            Err(mut rejected) => {
                debug!("Address batch rejected by the link, keeping it.");
                if let Some(LinkBuffer::AddressBatch(sealed)) = rejected.buffers.pop() {
                    self.with_state(|state| state.unsent = Some(sealed));
                }
                Err(rejected.error)
            }
        }
    }
    /// Reclaim every buffer currently owned by the device and drop pending addresses.
    ///
    /// This is used, when the firmware dropped all buffers it held. Returns the number of
    /// buffers reclaimed.
    pub fn reclaim_all(&self) -> usize {
        self.with_state(|state| {
            let mut reclaimed = 0;
            for (index, slot) in state.slots.iter_mut().enumerate() {
                if let BufferState::DeviceOwned(_) = slot.state {
                    if let Some(physical) = slot.address.take().map(DeviceAddress::physical) {
                        let _ = state.mapper.unmap(physical);
                    }
                    slot.state = BufferState::Free;
                    state.free_list.push(BufferId(index as u16));
                    reclaimed += 1;
                }
            }
            let capacity = state.batch.capacity();
            state.batch = AddressBatch::new(AddrValueType::Process, capacity);
            state.unsent = None;
            state.device_owned = 0;
            debug!("Reclaimed {} buffers from the device.", reclaimed);
            reclaimed
        })
    }
    pub fn state_of(&self, id: BufferId) -> Option<BufferState> {
        self.with_state(|state| state.slots.get(id.0 as usize).map(|slot| slot.state))
    }
    pub fn free_count(&self) -> usize {
        self.with_state(|state| state.free_list.len())
    }
    pub fn device_owned_count(&self) -> usize {
        self.with_state(|state| state.device_owned)
    }
    /// The number of addresses waiting to be sent to the device.
    pub fn batched_count(&self) -> usize {
        self.with_state(|state| {
            state.batch.len() + state.unsent.as_ref().map(SealedBatch::count).unwrap_or(0)
        })
    }
    pub fn stats(&self) -> PoolStats {
        self.with_state(|state| state.stats)
    }
    /// Raised whenever the pool ran out of buffers or the device asked for more.
    pub fn replenish_signal(&self) -> &SignalQueue {
        &self.replenish
    }
    /// The number of buffers missing to reach `target` buffers owned by the device.
    pub fn replenish_deficit(&self, target: usize) -> usize {
        target.saturating_sub(self.device_owned_count())
    }
}
