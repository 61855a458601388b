//! The host interface, which connects the bus driver's link channel to the data path.
use alloc::{collections::VecDeque, vec::Vec};
use core::{cell::RefCell, future::pending};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex;
use embassy_time::Instant;
use portable_atomic::{AtomicU8, Ordering};

use crate::{
    batch::{AddrValueType, AddrValues},
    config::{HifConfig, Transport},
    credit::{CreditController, CreditGrant},
    descriptor::{
        mh_checksum, CmdHeader, CommonHeader, HeadType, TxMsduDesc, EVT_FLOW_CONTROL,
        RX_MH_DESC_LEN,
    },
    error::{HifError, HifResult},
    frame::{InterfaceId, RxFrame, StreamKey},
    link::{ChannelId, LinkBuffer, LinkChannel},
    pool::{BufferPool, DeviceAddress, DmaDirection, DmaMapper, HostBuffer, LinearMapper},
    rx::{Delivered, PackedMsdus, RxPipeline},
    seq::SeqNum,
    DefaultRawMutex,
};

/// The network stack's side of the receive path.
pub trait FrameSink {
    /// Called for every frame, in sequence order per stream.
    fn deliver(&mut self, interface: InterfaceId, frame: RxFrame);
    /// Called when a stream stalled too often. The block-ack session should be torn down.
    fn on_stream_lost(&mut self, _key: StreamKey) {}
}

/// Work a background task should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkEvent {
    /// Receive buffers ran out. Call [Hif::replenish].
    Replenish,
    /// The firmware granted new credit. Retry pending transmissions.
    CreditArrived,
}

struct Pools<M> {
    rx: BufferPool<M>,
    tx: BufferPool<M>,
}

/// A batch of frames handed to the link channel and not yet completed.
struct TxBatch {
    grant: CreditGrant,
    addresses: Vec<DeviceAddress>,
    count: usize,
}

fn mapped_addresses(buffers: &[LinkBuffer]) -> impl Iterator<Item = DeviceAddress> + '_ {
    buffers.iter().filter_map(|buffer| match buffer {
        LinkBuffer::Mapped { address, .. } => Some(*address),
        _ => None,
    })
}

/// The host interface.
///
/// This ties the buffer pools, the credit controller and the receive pipeline together. All
/// methods take `&self`, so the RX and TX workers can share it.
pub struct Hif<M> {
    config: HifConfig,
    pools: Option<Pools<M>>,
    credit: CreditController,
    rx: blocking_mutex::Mutex<DefaultRawMutex, RefCell<RxPipeline>>,
    tx_batches: blocking_mutex::Mutex<DefaultRawMutex, RefCell<VecDeque<TxBatch>>>,
    tx_sequence: AtomicU8,
}
impl<M: DmaMapper> Hif<M> {
    fn with_pools(config: HifConfig, pools: Option<Pools<M>>) -> Self {
        Self {
            config,
            pools,
            credit: CreditController::from_config(&config),
            rx: blocking_mutex::Mutex::new(RefCell::new(RxPipeline::new(&config))),
            tx_batches: blocking_mutex::Mutex::new(RefCell::new(VecDeque::new())),
            tx_sequence: AtomicU8::new(0),
        }
    }
    /// Set up the host interface for PCIe.
    ///
    /// Both pools are allocated with [HifConfig::pool_capacity] buffers.
    pub fn pcie(config: HifConfig, rx_mapper: M, tx_mapper: M) -> HifResult<Self> {
        let config = HifConfig {
            transport: Transport::Pcie,
            ..config.with_tx_buffers(config.pool_capacity)
        };
        let new_pool = |mapper| {
            BufferPool::new(
                config.pool_capacity,
                config.buffer_size,
                config.address_batch_capacity,
                config.hif_offset,
                mapper,
            )
        };
        let pools = Pools {
            rx: new_pool(rx_mapper)?,
            tx: new_pool(tx_mapper)?,
        };
        info!(
            "PCIe host interface up, {} buffers per pool, TX budget {}.",
            config.pool_capacity, config.tx_budget
        );
        Ok(Self::with_pools(config, Some(pools)))
    }
    pub fn config(&self) -> &HifConfig {
        &self.config
    }
    pub fn credit(&self) -> &CreditController {
        &self.credit
    }
    /// The pool of receive buffers. Only present on PCIe.
    pub fn rx_pool(&self) -> Option<&BufferPool<M>> {
        self.pools.as_ref().map(|pools| &pools.rx)
    }
    /// The pool of transmit buffers. Only present on PCIe.
    pub fn tx_pool(&self) -> Option<&BufferPool<M>> {
        self.pools.as_ref().map(|pools| &pools.tx)
    }
    pub fn open_interface(&self, interface: InterfaceId) {
        self.credit.open_interface(interface);
    }
    pub fn close_interface(&self, interface: InterfaceId) {
        self.credit.close_interface(interface);
    }

    /// Hand a receive buffer to the device, or back to the pool if that isn't possible.
    fn hand_to_device(
        &self,
        pool: &BufferPool<M>,
        buffer: HostBuffer,
        link: &mut impl LinkChannel,
    ) -> HifResult<()> {
        let address = pool.map_for_device(buffer, DmaDirection::FromDevice)?;
        if let Err(err) = pool.batch_address(address, link) {
            // The device never learned about the buffer, so we can take it back.
            pool.release(pool.cancel_map(address)?)?;
            return Err(err);
        }
        Ok(())
    }
    /// Hand receive buffers to the device, until the configured target is reached.
    ///
    /// Returns the number of buffers handed out. On SDIO this does nothing.
    pub fn replenish(&self, link: &mut impl LinkChannel) -> HifResult<usize> {
        let Some(pools) = &self.pools else {
            return Ok(0);
        };
        let deficit = pools.rx.replenish_deficit(self.config.rx_buffer_target);
        let mut handed_out = 0;
        for _ in 0..deficit {
            let Ok(buffer) = pools.rx.acquire() else {
                break;
            };
            if self.hand_to_device(&pools.rx, buffer, link).is_err() {
                break;
            }
            handed_out += 1;
        }
        // Partial batches are flushed, so the device doesn't starve.
        let _ = pools.rx.flush_addresses(link);
        if handed_out != 0 {
            trace!("Handed {} receive buffers to the device.", handed_out);
        }
        Ok(handed_out)
    }

    /// Take a receive buffer back from the device and copy its frame out.
    fn take_rx_buffer(
        &self,
        pools: &Pools<M>,
        address: DeviceAddress,
        link: &mut impl LinkChannel,
    ) -> HifResult<RxFrame> {
        let buffer = pools.rx.unmap(address)?;
        let frame = buffer
            .get(RX_MH_DESC_LEN..)
            .ok_or(HifError::Malformed)
            .and_then(RxFrame::copy_from)
            .map(|mut frame| {
                frame.set_checksum(mh_checksum(&buffer));
                frame
            });
        // The buffer is reused right away, if the device still needs buffers.
        if pools.rx.device_owned_count() < self.config.rx_buffer_target {
            let _ = self.hand_to_device(&pools.rx, buffer, link);
        } else {
            pools.rx.release(buffer)?;
        }
        frame
    }
    fn on_address_event(
        &self,
        message: &[u8],
        link: &mut impl LinkChannel,
        frames: &mut Vec<RxFrame>,
    ) -> HifResult<()> {
        let Some(pools) = &self.pools else {
            warn!("Address event received on SDIO.");
            return Err(HifError::Malformed);
        };
        for value in AddrValues::parse(message)? {
            let value = value?;
            match value.kind {
                AddrValueType::Process => {
                    for address in value.addresses() {
                        match self.take_rx_buffer(pools, address, link) {
                            Ok(frame) => frames.push(frame),
                            Err(_err) => debug!("Dropping receive buffer: {:?}", _err),
                        }
                    }
                }
                AddrValueType::Free => {
                    for address in value.addresses() {
                        if let Ok(buffer) = pools.rx.unmap(address) {
                            pools.rx.release(buffer)?;
                        }
                    }
                }
                AddrValueType::Request => {
                    self.replenish(link)?;
                }
                AddrValueType::Flush => {
                    info!("Firmware flushed its receive buffers.");
                    pools.rx.reclaim_all();
                    self.replenish(link)?;
                }
                _ => {
                    debug!("Unknown address value type.");
                }
            }
        }
        Ok(())
    }
    fn on_event(&self, message: &[u8]) {
        let Some(header) = CmdHeader::parse(message) else {
            debug!("Dropping truncated event.");
            return;
        };
        if header.cmd_id != EVT_FLOW_CONTROL {
            trace!("Ignoring event {}.", header.cmd_id);
            return;
        }
        let Some(flow) = message
            .get(CmdHeader::LEN..CmdHeader::LEN + 4)
            .and_then(|flow| flow.try_into().ok())
        else {
            debug!("Dropping truncated flow control event.");
            return;
        };
        self.credit.on_credit(flow, true);
    }
    /// Collect the frames of one received buffer.
    fn on_buffer(
        &self,
        channel: ChannelId,
        buffer: LinkBuffer,
        link: &mut impl LinkChannel,
        frames: &mut Vec<RxFrame>,
    ) -> HifResult<()> {
        let bytes = match buffer {
            LinkBuffer::Mapped { address, .. } => {
                let pools = self.pools.as_ref().ok_or(HifError::UnknownAddress)?;
                frames.push(self.take_rx_buffer(pools, address, link)?);
                return Ok(());
            }
            LinkBuffer::Bytes(bytes) => bytes,
            LinkBuffer::AddressBatch(_) => return Err(HifError::Malformed),
        };
        let message = bytes
            .get(self.config.hif_offset..)
            .ok_or(HifError::Malformed)?;
        let header = CommonHeader::parse(message).ok_or(HifError::Malformed)?;
        match (channel, header.head_type()) {
            (ChannelId::RxEvent, _) | (_, HeadType::Event) => {
                self.on_event(message);
                Ok(())
            }
            (_, HeadType::DataPcieAddr) => self.on_address_event(message, link, frames),
            (_, HeadType::Data | HeadType::DataSpecial) => {
                for frame in PackedMsdus::new(message) {
                    frames.push(frame?);
                }
                Ok(())
            }
            _ => {
                trace!("Ignoring message of type {}.", header.raw_type());
                Ok(())
            }
        }
    }
    fn dispatch(delivered: Vec<Delivered>, sink: &mut impl FrameSink) -> usize {
        let count = delivered.len();
        for (interface, frame) in delivered {
            sink.deliver(interface, frame);
        }
        count
    }
    /// Run `f` on the receive pipeline and hand the frames it releases to the sink.
    fn with_rx<R>(
        &self,
        sink: &mut impl FrameSink,
        f: impl FnOnce(&mut RxPipeline, &mut Vec<Delivered>) -> R,
    ) -> R {
        let mut delivered = Vec::new();
        let result = self.rx.lock(|rx| f(&mut rx.borrow_mut(), &mut delivered));
        Self::dispatch(delivered, sink);
        result
    }
    /// Process buffers the link channel received from the firmware.
    ///
    /// Returns the number of frames delivered to the sink.
    pub fn on_received(
        &self,
        channel: ChannelId,
        buffers: Vec<LinkBuffer>,
        now: Instant,
        link: &mut impl LinkChannel,
        sink: &mut impl FrameSink,
    ) -> usize {
        let mut frames = Vec::new();
        for buffer in buffers {
            if let Err(_err) = self.on_buffer(channel, buffer, link, &mut frames) {
                debug!("Dropping received buffer: {:?}", _err);
            }
        }
        let mut delivered = Vec::new();
        self.rx.lock(|rx| {
            let mut rx = rx.borrow_mut();
            for frame in frames {
                if frame.desc().layout.host_type() == HeadType::DataSpecial.into_bits() {
                    self.credit.on_credit(frame.desc().credit_flow(), false);
                }
                rx.process(frame, now, &mut |frame| delivered.push(frame));
            }
        });
        Self::dispatch(delivered, sink)
    }

    fn prepare_tx(
        &self,
        interface: InterfaceId,
        color: u8,
        frame: &[u8],
    ) -> HifResult<LinkBuffer> {
        let pkt_len = u16::try_from(frame.len()).map_err(|_| HifError::Malformed)?;
        let sequence = self.tx_sequence.fetch_add(1, Ordering::Relaxed);
        let desc = TxMsduDesc::new(interface.raw(), color, sequence, pkt_len);
        let len = TxMsduDesc::LEN + frame.len();
        let Some(pools) = &self.pools else {
            let offset = self.config.hif_offset;
            let mut bytes = Vec::new();
            bytes
                .try_reserve_exact(offset + len)
                .map_err(|_| HifError::OutOfMemory)?;
            bytes.resize(offset + TxMsduDesc::LEN, 0);
            desc.write(&mut bytes[offset..]).ok_or(HifError::Malformed)?;
            bytes.extend_from_slice(frame);
            return Ok(LinkBuffer::Bytes(bytes));
        };
        let mut buffer = pools.tx.acquire()?;
        if buffer.len() < len {
            pools.tx.release(buffer)?;
            return Err(HifError::Malformed);
        }
        let region = &mut buffer[..len];
        desc.write(region).ok_or(HifError::Malformed)?;
        region[TxMsduDesc::LEN..].copy_from_slice(frame);
        let address = pools.tx.map_for_device(buffer, DmaDirection::ToDevice)?;
        Ok(LinkBuffer::Mapped { address, len })
    }
    fn reclaim_tx(&self, buffers: &[LinkBuffer]) {
        let Some(pools) = &self.pools else {
            return;
        };
        for address in mapped_addresses(buffers) {
            match pools.tx.unmap(address) {
                Ok(buffer) => {
                    let _ = pools.tx.release(buffer);
                }
                Err(_err) => warn!("Failed to reclaim TX buffer: {:?}", _err),
            }
        }
    }
    /// Send frames to the firmware.
    ///
    /// As many frames as there is credit for are taken from the front of `frames` and submitted
    /// to the link channel as one batch. The remaining frames stay in `frames`. If the link
    /// rejects the batch, all frames stay in `frames` and the credit is returned. A frame at the
    /// front, which is too large to ever be sent, is dropped and [HifError::Malformed] is returned.
    ///
    /// Returns the number of frames submitted.
    pub fn transmit(
        &self,
        interface: InterfaceId,
        frames: &mut Vec<Vec<u8>>,
        link: &mut impl LinkChannel,
    ) -> HifResult<usize> {
        if frames.is_empty() {
            return Ok(0);
        }
        let mut grant = self.credit.request_send(interface, frames.len())?;
        let mut buffers = Vec::new();
        if buffers.try_reserve_exact(grant.total()).is_err() {
            self.credit.cancel(grant)?;
            return Err(HifError::OutOfMemory);
        }
        let mut failure = None;
        for (index, frame) in frames.iter().take(grant.total()).enumerate() {
            let color = grant.color_for(index).unwrap_or_default();
            match self.prepare_tx(interface, color, frame) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let count = buffers.len();
        if count == 0 {
            self.credit.cancel(grant)?;
            let err = failure.unwrap_or(HifError::Malformed);
            if err == HifError::Malformed {
                // The frame can never be sent, so it would block every later call.
                let dropped = frames.remove(0);
                warn!("Dropping TX frame of {} bytes, which doesn't fit.", dropped.len());
            }
            return Err(err);
        }
        let unused = grant.total() - count;
        if unused != 0 {
            debug!("Only {} of {} granted frames prepared.", count, count + unused);
            self.credit.refund(&mut grant, unused)?;
        }
        let mut addresses = Vec::new();
        let reserved = addresses.try_reserve_exact(count).is_ok()
            && self
                .tx_batches
                .lock(|batches| batches.borrow_mut().try_reserve(1).is_ok());
        if !reserved {
            self.reclaim_tx(&buffers);
            self.credit.cancel(grant)?;
            return Err(HifError::OutOfMemory);
        }
        addresses.extend(mapped_addresses(&buffers));

        match link.submit(ChannelId::TxData, buffers) {
            Ok(()) => {
                trace!("Submitted {} frames for interface {}.", count, interface.raw());
                self.tx_batches.lock(|batches| {
                    batches.borrow_mut().push_back(TxBatch {
                        grant,
                        addresses,
                        count,
                    })
                });
                frames.drain(..count);
                Ok(count)
            }
            Err(rejected) => {
                debug!("TX batch rejected by the link.");
                self.reclaim_tx(&rejected.buffers);
                self.credit.cancel(grant)?;
                Err(rejected.error)
            }
        }
    }
    /// The link channel finished sending buffers.
    ///
    /// TX batches complete in the order they were submitted. The batch's buffers are returned to
    /// the pool and its grant is acknowledged. Returns the number of completed frames.
    pub fn on_send_complete(&self, channel: ChannelId, buffers: Vec<LinkBuffer>) -> HifResult<usize> {
        if channel != ChannelId::TxData {
            // Address batches and commands don't hold any resources after sending.
            return Ok(0);
        }
        let batch = self.tx_batches.lock(|batches| {
            let mut batches = batches.borrow_mut();
            let front = batches.front().ok_or(HifError::UnknownGrant)?;
            if front.count != buffers.len()
                || !front.addresses.iter().copied().eq(mapped_addresses(&buffers))
            {
                warn!("Completed buffers don't match the oldest TX batch.");
                return Err(HifError::Malformed);
            }
            batches.pop_front().ok_or(HifError::UnknownGrant)
        })?;
        // Every buffer is reclaimed, even if one of them fails.
        let mut failure = None;
        if let Some(pools) = &self.pools {
            for address in batch.addresses.iter() {
                let reclaimed = pools
                    .tx
                    .unmap(*address)
                    .and_then(|buffer| pools.tx.release(buffer));
                if let Err(err) = reclaimed {
                    warn!("Failed to reclaim TX buffer: {:?}", err);
                    failure.get_or_insert(err);
                }
            }
        }
        match self.credit.on_ack(batch.grant) {
            // The interface was closed while the batch was in flight, which already settled it.
            Ok(()) | Err(HifError::UnknownGrant) => {}
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(batch.count),
        }
    }

    /// Set up a block-ack session for a stream.
    pub fn add_ba(
        &self,
        key: StreamKey,
        start: SeqNum,
        window_size: u16,
        sink: &mut impl FrameSink,
    ) -> HifResult<()> {
        self.with_rx(sink, |rx, delivered| {
            rx.add_ba(key, start, window_size, &mut |frame| delivered.push(frame))
        })
    }
    /// Tear down a block-ack session. Buffered frames are delivered first.
    pub fn del_ba(&self, key: StreamKey, sink: &mut impl FrameSink) -> bool {
        self.with_rx(sink, |rx, delivered| {
            rx.del_ba(key, &mut |frame| delivered.push(frame))
        })
    }
    pub fn bar(&self, key: StreamKey, start: SeqNum, now: Instant, sink: &mut impl FrameSink) {
        self.with_rx(sink, |rx, delivered| {
            rx.bar(key, start, now, &mut |frame| delivered.push(frame))
        })
    }
    pub fn remove_station(&self, station: u8, sink: &mut impl FrameSink) {
        self.with_rx(sink, |rx, delivered| {
            rx.remove_station(station, &mut |frame| delivered.push(frame))
        })
    }
    pub fn reset_pn(&self, station: u8) {
        self.rx.lock(|rx| rx.borrow_mut().reset_pn(station))
    }
    /// Run the receive timers.
    ///
    /// This should be called at [Self::next_deadline] or periodically.
    pub fn poll(&self, now: Instant, sink: &mut impl FrameSink) {
        let lost = self.with_rx(sink, |rx, delivered| {
            rx.poll(now, &mut |frame| delivered.push(frame))
        });
        for key in lost {
            sink.on_stream_lost(key);
        }
    }
    pub fn next_deadline(&self) -> Option<Instant> {
        self.rx.lock(|rx| rx.borrow().next_deadline())
    }
    /// Wait until a background task has something to do.
    pub async fn wait_for_work(&self) -> WorkEvent {
        let replenish = async {
            match &self.pools {
                Some(pools) => pools.rx.replenish_signal().next().await,
                None => pending().await,
            }
        };
        match select(replenish, self.credit.credit_signal().next()).await {
            Either::First(()) => WorkEvent::Replenish,
            Either::Second(()) => WorkEvent::CreditArrived,
        }
    }
}
impl Hif<LinearMapper> {
    /// Set up the host interface for SDIO.
    ///
    /// No pools are used, since the bus driver copies every message.
    pub fn sdio(config: HifConfig) -> Self {
        let config = HifConfig {
            transport: Transport::Sdio,
            ..config
        };
        info!("SDIO host interface up, TX budget {}.", config.tx_budget);
        Self::with_pools(config, None)
    }
}

#[cfg(test)]
mod tests {
    use alloc::{collections::BTreeMap, rc::Rc, vec};

    use embassy_futures::block_on;

    use super::*;
    use crate::{
        descriptor::RxMsduDesc,
        frame::tests::msdu_bytes,
        link::tests::RecordingLink,
        pool::{BufferId, PoolStats},
        rx::tests::edit_desc,
    };

    const BASE: u64 = 0x4000_0000;
    const STRIDE: u64 = 0x1000;

    #[derive(Default)]
    struct Collector {
        frames: Vec<(InterfaceId, RxFrame)>,
        lost: Vec<StreamKey>,
    }
    impl FrameSink for Collector {
        fn deliver(&mut self, interface: InterfaceId, frame: RxFrame) {
            self.frames.push((interface, frame));
        }
        fn on_stream_lost(&mut self, key: StreamKey) {
            self.lost.push(key);
        }
    }

    /// Plays the device. Contents written by "the device" show up, when the host syncs.
    struct DeviceMapper {
        inner: LinearMapper,
        written: Rc<RefCell<BTreeMap<u16, Vec<u8>>>>,
    }
    impl DmaMapper for DeviceMapper {
        fn map(&mut self, id: BufferId, buffer: &mut [u8], direction: DmaDirection) -> Option<u64> {
            self.inner.map(id, buffer, direction)
        }
        fn unmap(&mut self, physical: u64) -> Option<BufferId> {
            self.inner.unmap(physical)
        }
        fn sync_for_cpu(&mut self, id: BufferId, buffer: &mut [u8]) {
            if let Some(bytes) = self.written.borrow_mut().remove(&id.0) {
                buffer[..bytes.len()].copy_from_slice(&bytes);
            }
        }
    }

    fn config() -> HifConfig {
        HifConfig {
            pool_capacity: 8,
            buffer_size: 256,
            rx_buffer_target: 4,
            address_batch_capacity: 3,
            ..HifConfig::pcie()
        }
    }
    fn pcie() -> (Hif<DeviceMapper>, Rc<RefCell<BTreeMap<u16, Vec<u8>>>>) {
        let written = Rc::new(RefCell::new(BTreeMap::new()));
        let mapper = || DeviceMapper {
            inner: LinearMapper::new(BASE, STRIDE, 8),
            written: written.clone(),
        };
        let hif = Hif::pcie(config(), mapper(), mapper()).unwrap();
        (hif, written)
    }
    fn batched_addresses(link: &RecordingLink) -> Vec<DeviceAddress> {
        link.submitted
            .iter()
            .filter(|(channel, _)| *channel == ChannelId::AddressHandoff)
            .flat_map(|(_, buffers)| buffers.iter())
            .flat_map(|buffer| {
                let bytes = buffer.bytes().unwrap();
                bytes[3..]
                    .chunks_exact(DeviceAddress::WIRE_LEN)
                    .map(DeviceAddress::from_wire)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
    fn address_event(kind: AddrValueType, addresses: &[DeviceAddress]) -> LinkBuffer {
        let mut message = vec![
            CommonHeader::new()
                .with_head_type(HeadType::DataPcieAddr)
                .into_bits(),
            1,
            kind.into_bits(),
            addresses.len() as u8,
        ];
        for address in addresses {
            message.extend_from_slice(&address.to_wire());
        }
        LinkBuffer::Bytes(message)
    }
    /// What the device writes into a receive buffer: MH descriptor, then the MSDU.
    fn device_write(msdu: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; RX_MH_DESC_LEN];
        // Next MSDU pointer, checksum enable and the checksum itself.
        bytes[..4].copy_from_slice(&0x8000_5678u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&(1u32 << 28).to_le_bytes());
        bytes[12..16].copy_from_slice(&0x1234u32.to_le_bytes());
        bytes.extend_from_slice(msdu);
        bytes
    }
    fn buffer_id(address: DeviceAddress) -> u16 {
        ((address.physical() - BASE) / STRIDE) as u16
    }
    fn interface(id: u8) -> InterfaceId {
        InterfaceId::new(id).unwrap()
    }

    #[test]
    fn replenish_hands_out_target() {
        let (hif, _) = pcie();
        let mut link = RecordingLink::default();
        assert_eq!(hif.replenish(&mut link).unwrap(), 4);
        // One full batch of three, then the flushed rest.
        assert_eq!(link.count(ChannelId::AddressHandoff), 2);
        assert_eq!(batched_addresses(&link).len(), 4);
        let pool = hif.rx_pool().unwrap();
        assert_eq!(pool.device_owned_count(), 4);
        assert_eq!(hif.replenish(&mut link).unwrap(), 0);
    }

    #[test]
    fn received_buffers_are_delivered_and_recycled() {
        let (hif, written) = pcie();
        let mut link = RecordingLink::default();
        let mut sink = Collector::default();
        hif.replenish(&mut link).unwrap();
        let addresses = batched_addresses(&link);

        let msdu = msdu_bytes(2, 0, 33, 0, false, 60, 0x5a);
        written
            .borrow_mut()
            .insert(buffer_id(addresses[0]), device_write(&msdu));
        let delivered = hif.on_received(
            ChannelId::RxData,
            vec![address_event(AddrValueType::Process, &addresses[..1])],
            Instant::from_millis(0),
            &mut link,
            &mut sink,
        );
        assert_eq!(delivered, 1);
        let (interface, frame) = &sink.frames[0];
        assert_eq!(interface.raw(), 0);
        assert_eq!(frame.payload(), &msdu[RxMsduDesc::LEN..]);
        assert_eq!(frame.checksum(), Some(0x1234));

        let pool = hif.rx_pool().unwrap();
        // The buffer went straight back to the device.
        assert_eq!(pool.device_owned_count(), 4);
        assert_eq!(pool.batched_count(), 1);
        assert_eq!(pool.stats().write_pending, 0);
    }

    #[test]
    fn free_and_flush_events() {
        let (hif, _) = pcie();
        let mut link = RecordingLink::default();
        let mut sink = Collector::default();
        hif.replenish(&mut link).unwrap();
        let addresses = batched_addresses(&link);
        let pool = hif.rx_pool().unwrap();

        hif.on_received(
            ChannelId::RxData,
            vec![address_event(AddrValueType::Free, &addresses[..2])],
            Instant::from_millis(0),
            &mut link,
            &mut sink,
        );
        assert_eq!(pool.device_owned_count(), 2);
        assert_eq!(pool.free_count(), 6);

        // A flush reclaims everything and hands out fresh buffers.
        hif.on_received(
            ChannelId::RxData,
            vec![address_event(AddrValueType::Flush, &[])],
            Instant::from_millis(0),
            &mut link,
            &mut sink,
        );
        assert_eq!(pool.device_owned_count(), 4);
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn credit_arrives_with_events_and_frames() {
        let hif = Hif::sdio(HifConfig::sdio());
        let mut link = RecordingLink::default();
        let mut sink = Collector::default();

        let mut event = vec![0u8; CmdHeader::LEN];
        CmdHeader {
            common: CommonHeader::new().with_head_type(HeadType::Event),
            cmd_id: EVT_FLOW_CONTROL,
            payload_len: 16,
            ms_time: 0,
            status: 0,
            rsp_count: 0,
        }
        .write(&mut event)
        .unwrap();
        event.extend_from_slice(&[1, 2, 3, 4]);
        hif.on_received(
            ChannelId::RxEvent,
            vec![LinkBuffer::Bytes(event)],
            Instant::from_millis(0),
            &mut link,
            &mut sink,
        );
        assert_eq!(block_on(hif.wait_for_work()), WorkEvent::CreditArrived);
        assert_eq!(hif.credit().colors()[3].credit, 4);

        let mut special = msdu_bytes(1, 0, 5, 0, false, 20, 0);
        edit_desc(&mut special, |desc| {
            desc.layout = desc.layout.with_host_type(HeadType::DataSpecial.into_bits());
            desc.reserved = u32::from_le_bytes([10, 0, 0, 0]);
        });
        hif.on_received(
            ChannelId::RxData,
            vec![LinkBuffer::Bytes(special)],
            Instant::from_millis(0),
            &mut link,
            &mut sink,
        );
        assert_eq!(hif.credit().colors()[0].credit, 11);
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn sdio_transmit_within_credit() {
        let hif = Hif::sdio(HifConfig::sdio());
        let mut link = RecordingLink::default();
        hif.open_interface(interface(1));
        hif.credit().on_credit([2, 0, 0, 0], false);

        let mut frames = vec![vec![0xaa; 100], vec![0xbb; 50], vec![0xcc; 10]];
        assert_eq!(hif.transmit(interface(1), &mut frames, &mut link), Ok(2));
        assert_eq!(frames, [vec![0xcc; 10]]);
        assert_eq!(
            hif.transmit(interface(1), &mut frames, &mut link),
            Err(HifError::NoCredit)
        );

        let (channel, buffers) = link.submitted.pop().unwrap();
        assert_eq!(channel, ChannelId::TxData);
        let bytes = buffers[1].bytes().unwrap();
        let desc = TxMsduDesc::parse(bytes).unwrap();
        assert_eq!(desc.common.ctx_id(), 1);
        assert_eq!(desc.color(), 0);
        assert_eq!(desc.pkt_len, 50);
        assert_eq!(desc.offset as usize, TxMsduDesc::LEN);
        assert_eq!(&bytes[TxMsduDesc::LEN..], &[0xbb; 50]);
        assert_eq!(hif.credit().in_flight(), 2);

        assert_eq!(hif.on_send_complete(ChannelId::TxData, buffers), Ok(2));
        assert_eq!(hif.credit().in_flight(), 0);
        assert_eq!(
            hif.on_send_complete(ChannelId::TxData, Vec::new()),
            Err(HifError::UnknownGrant)
        );
    }

    #[test]
    fn busy_link_returns_unbatched_buffer() {
        let (hif, _) = pcie();
        let mut link = RecordingLink {
            busy: true,
            ..Default::default()
        };
        // Three addresses fill the batch, which can't be flushed. The fourth buffer is taken back.
        assert_eq!(hif.replenish(&mut link).unwrap(), 3);
        let pool = hif.rx_pool().unwrap();
        assert_eq!(pool.device_owned_count(), 3);
        assert_eq!(pool.batched_count(), 3);
        assert_eq!(
            pool.stats(),
            PoolStats {
                acquired: 4,
                released: 1,
                mapped: 4,
                unmapped: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn completion_after_close_is_settled() {
        let (hif, _) = pcie();
        let mut link = RecordingLink::default();
        hif.open_interface(interface(0));
        hif.credit().on_credit([8, 0, 0, 0], false);
        let mut frames = vec![vec![7; 32]];
        assert_eq!(hif.transmit(interface(0), &mut frames, &mut link), Ok(1));
        hif.close_interface(interface(0));
        assert_eq!(hif.credit().in_flight(), 0);

        let (_, buffers) = link.submitted.pop().unwrap();
        assert_eq!(hif.on_send_complete(ChannelId::TxData, buffers), Ok(1));
        let pool = hif.tx_pool().unwrap();
        assert_eq!(pool.free_count(), 8);
        assert_eq!(pool.device_owned_count(), 0);
    }

    #[test]
    fn oversized_head_frame_is_dropped() {
        let (hif, _) = pcie();
        let mut link = RecordingLink::default();
        hif.credit().on_credit([8, 0, 0, 0], false);
        let mut frames = vec![vec![1; 300], vec![2; 64]];
        assert_eq!(
            hif.transmit(interface(0), &mut frames, &mut link),
            Err(HifError::Malformed)
        );
        assert_eq!(frames, [vec![2; 64]]);
        assert_eq!(hif.credit().colors()[0].credit, 8);
        assert_eq!(hif.credit().in_flight(), 0);
        assert_eq!(hif.transmit(interface(0), &mut frames, &mut link), Ok(1));
        assert!(frames.is_empty());
    }

    #[test]
    fn rejected_transmit_keeps_frames() {
        let (hif, _) = pcie();
        let mut link = RecordingLink {
            busy: true,
            ..Default::default()
        };
        hif.credit().on_credit([8, 0, 0, 0], false);
        let mut frames = vec![vec![1; 64], vec![2; 64]];
        assert_eq!(
            hif.transmit(interface(0), &mut frames, &mut link),
            Err(HifError::LinkBusy)
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(hif.credit().in_flight(), 0);
        assert_eq!(hif.credit().colors()[0].credit, 8);
        let pool = hif.tx_pool().unwrap();
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn pcie_transmit_maps_buffers() {
        let (hif, _) = pcie();
        let mut link = RecordingLink::default();
        hif.credit().on_credit([8, 0, 0, 0], false);
        let mut frames = vec![vec![1; 64], vec![2; 300], vec![3; 64]];
        // The second frame doesn't fit into a pool buffer, so only the first is sent.
        assert_eq!(hif.transmit(interface(0), &mut frames, &mut link), Ok(1));
        assert_eq!(frames.len(), 2);
        assert_eq!(hif.credit().in_flight(), 1);
        assert_eq!(hif.credit().colors()[0].credit, 7);

        let (_, buffers) = link.submitted.pop().unwrap();
        let pool = hif.tx_pool().unwrap();
        assert_eq!(pool.device_owned_count(), 1);
        assert!(matches!(
            buffers[0],
            LinkBuffer::Mapped { len, .. } if len == TxMsduDesc::LEN + 64
        ));
        hif.on_send_complete(ChannelId::TxData, buffers).unwrap();
        assert_eq!(pool.free_count(), 8);
        assert_eq!(
            pool.stats(),
            PoolStats {
                acquired: 2,
                released: 2,
                mapped: 1,
                unmapped: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn stalled_stream_is_reported() {
        let hif = Hif::sdio(HifConfig {
            max_reorder_timeouts: 0,
            ..HifConfig::sdio()
        });
        let mut link = RecordingLink::default();
        let mut sink = Collector::default();
        let key = StreamKey::new(1, 0);
        hif.add_ba(key, SeqNum::new(0), 8, &mut sink).unwrap();
        let mut bytes = msdu_bytes(1, 0, 2, 0, false, 20, 0);
        edit_desc(&mut bytes, |desc| {
            desc.flags = desc.flags.with_ba_session(true)
        });
        hif.on_received(
            ChannelId::RxData,
            vec![LinkBuffer::Bytes(bytes)],
            Instant::from_millis(0),
            &mut link,
            &mut sink,
        );
        assert!(sink.frames.is_empty());
        let deadline = hif.next_deadline().unwrap();
        hif.poll(deadline, &mut sink);
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.lost, [key]);
    }
}
