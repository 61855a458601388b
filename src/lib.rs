//! # `wlan-hif-core`
//! This is the host side data path of a WLAN NIC, which talks to its firmware over PCIe or SDIO.
//! It sits between the bus driver and the network stack and doesn't touch any hardware itself.
//! ## Overview
//! This chapter will give a short overview of how frames move through the data path.
//!
//! ### Receive (RX)
//! On PCIe, the host hands empty receive buffers to the firmware by address. These addresses are
//! collected into address batches, which are sent once they're full. The firmware writes a frame
//! into one of these buffers and then sends an address event, which tells us which buffers it
//! filled, freed or wants back. Every buffer lives in a [BufferPool], which tracks whether the host
//! or the device currently owns it. A buffer the device handed back is reused immediately, if the
//! device is short on buffers.
//!
//! On SDIO, the bus driver copies whole messages, which may contain multiple MSDUs packed back to
//! back. These are split with [PackedMsdus].
//!
//! Every received MSDU then goes through the [RxPipeline]. Fragments are reassembled by the
//! [DefragEngine]. Frames of streams with a block-ack session are reordered by the
//! [ReorderEngine], which releases them in sequence order, or once a missing frame timed out.
//! Everything else is delivered to the [FrameSink] straight away.
//!
//! ### Transmit (TX)
//! The firmware only accepts as many frames as it advertised credit for. Credit is split into four
//! colors, which are either bound to one interface or shared. Before sending, the [Hif] reserves
//! credit through the [CreditController] and gets a [CreditGrant] in return. The grant is consumed
//! once the bus driver reports the frames as sent. If the link channel is busy, the grant is
//! cancelled and the frames stay with the caller.
//!
//! ### Workers
//! Nothing in here blocks. When a resource runs out, a signal is raised instead, which a worker can
//! await through [Hif::wait_for_work]. Reorder timeouts are run through [Hif::poll].

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

extern crate alloc;

mod batch;
mod config;
mod credit;
mod defrag;
mod descriptor;
mod error;
mod frame;
mod hif;
mod link;
mod pool;
mod reorder;
mod rx;
mod seq;
mod sync;

pub use batch::{AddrValue, AddrValueType, AddrValues, AddressBatch, SealedBatch};
pub use config::{HifConfig, Transport};
pub use credit::{ColorStatus, CreditController, CreditGrant, GrantId, COLOR_COUNT};
pub use defrag::DefragEngine;
pub use descriptor::*;
pub use error::{HifError, HifResult};
pub use frame::{InterfaceId, RxFrame, StreamKey, INTERFACE_COUNT};
pub use hif::{FrameSink, Hif, WorkEvent};
pub use link::{ChannelId, LinkBuffer, LinkChannel, LinkRejected};
pub use pool::{
    BufferId, BufferPool, BufferState, DeviceAddress, DmaDirection, DmaMapper, HostBuffer,
    LinearMapper, PoolStats,
};
pub use reorder::{FrameMeta, ReorderEngine};
pub use rx::{AmsduGuard, Delivered, PackedMsdus, RxPipeline};
pub use seq::SeqNum;
pub use sync::SignalQueue;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
