//! TX flow control.
//!
//! The firmware can only hold a limited number of TX descriptors. It advertises how many frames it
//! accepts through credit, which is split into four colors. A color is either bound to one
//! interface (exclusive) or shared by all interfaces.
//!
//! Every admission hands out a [CreditGrant], which records how much was drawn from each color. The
//! grant is consumed when the firmware acknowledges the frames, so it can't be acknowledged twice.
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::{
    config::HifConfig,
    error::{HifError, HifResult},
    frame::{InterfaceId, INTERFACE_COUNT},
    sync::SignalQueue,
    DefaultRawMutex,
};

/// The number of credit colors.
pub const COLOR_COUNT: usize = HifConfig::COLOR_COUNT;

/// Identifies an outstanding grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GrantId {
    slot: u16,
    generation: u16,
}

/// Credit reserved for a number of frames.
///
/// This can't be cloned. It has to be handed back through [CreditController::on_ack] or
/// [CreditController::cancel].
#[derive(Debug, PartialEq, Eq)]
pub struct CreditGrant {
    id: GrantId,
    interface: InterfaceId,
    per_color: [u16; COLOR_COUNT],
    /// Frames admitted while credit accounting is disabled.
    uncredited: u16,
}
impl CreditGrant {
    pub fn id(&self) -> GrantId {
        self.id
    }
    pub fn interface(&self) -> InterfaceId {
        self.interface
    }
    /// The amount drawn from each color.
    pub fn per_color(&self) -> &[u16; COLOR_COUNT] {
        &self.per_color
    }
    /// The number of frames, that may be sent.
    pub fn total(&self) -> usize {
        self.per_color.iter().map(|count| *count as usize).sum::<usize>() + self.uncredited as usize
    }
    /// The color the frame at `frame_index` is sent with.
    ///
    /// Frames are assigned to colors in color order.
    pub fn color_for(&self, frame_index: usize) -> Option<u8> {
        let mut end = 0;
        for (color, count) in self.per_color.iter().enumerate() {
            end += *count as usize;
            if frame_index < end {
                return Some(color as u8);
            }
        }
        (frame_index < end + self.uncredited as usize).then_some(0)
    }
}

/// The state of one color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorStatus {
    /// The interface the color is bound to. Unbound colors are shared.
    pub owner: Option<InterfaceId>,
    /// Credit advertised by the firmware and not yet granted.
    pub credit: u16,
    /// Frames granted and not yet acknowledged.
    pub in_flight: u16,
}

#[derive(Clone, Copy)]
struct GrantRecord {
    interface: InterfaceId,
    per_color: [u16; COLOR_COUNT],
    uncredited: u16,
}
struct GrantSlot {
    generation: u16,
    record: Option<GrantRecord>,
}

struct CreditState {
    colors: [ColorStatus; COLOR_COUNT],
    open: [bool; INTERFACE_COUNT],
    grants: Vec<GrantSlot>,
    free_grants: Vec<u16>,
    uncredited_in_flight: usize,
    budget: usize,
    enabled: bool,
}
impl CreditState {
    fn in_flight(&self) -> usize {
        self.colors
            .iter()
            .map(|color| color.in_flight as usize)
            .sum::<usize>()
            + self.uncredited_in_flight
    }
    fn budget_left(&self) -> usize {
        self.budget.saturating_sub(self.in_flight())
    }
    fn exclusive_color(&self, interface: InterfaceId) -> Option<usize> {
        self.colors
            .iter()
            .position(|color| color.owner == Some(interface))
    }
    /// Find or bind the interface's exclusive color.
    fn assign_color(&mut self, interface: InterfaceId) -> Option<usize> {
        self.open[interface.index()] = true;
        if let Some(color) = self.exclusive_color(interface) {
            return Some(color);
        }
        // Colors of closed interfaces become available again.
        let open = self.open;
        for color in self.colors.iter_mut() {
            if color.owner.is_some_and(|owner| !open[owner.index()]) {
                color.owner = None;
            }
        }
        let color = self.colors.iter().position(|color| color.owner.is_none())?;
        self.colors[color].owner = Some(interface);
        debug!("Bound color {} to interface {}.", color, interface.raw());
        Some(color)
    }
    /// Split `count` frames over the exclusive color and the shared colors.
    fn plan(&self, exclusive: Option<usize>, count: usize) -> [u16; COLOR_COUNT] {
        let mut per_color = [0u16; COLOR_COUNT];
        let mut remaining = count;
        let shared = self
            .colors
            .iter()
            .enumerate()
            .filter(|(_, color)| color.owner.is_none())
            .map(|(index, _)| index);
        for color in exclusive.into_iter().chain(shared) {
            if remaining == 0 {
                break;
            }
            let drawn = remaining.min(self.colors[color].credit as usize);
            per_color[color] = drawn as u16;
            remaining -= drawn;
        }
        per_color
    }
    fn allocate_grant(&mut self, record: GrantRecord) -> HifResult<GrantId> {
        let slot = match self.free_grants.pop() {
            Some(slot) => slot,
            None => {
                if self.grants.len() >= u16::MAX as usize {
                    return Err(HifError::OutOfMemory);
                }
                self.grants
                    .try_reserve(1)
                    .map_err(|_| HifError::OutOfMemory)?;
                self.grants.push(GrantSlot {
                    generation: 0,
                    record: None,
                });
                (self.grants.len() - 1) as u16
            }
        };
        let entry = &mut self.grants[slot as usize];
        entry.record = Some(record);
        Ok(GrantId {
            slot,
            generation: entry.generation,
        })
    }
    fn record_mut(&mut self, id: GrantId) -> HifResult<&mut GrantRecord> {
        self.grants
            .get_mut(id.slot as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.record.as_mut())
            .ok_or(HifError::UnknownGrant)
    }
    fn free_grant(&mut self, slot: u16) {
        if let Some(entry) = self.grants.get_mut(slot as usize) {
            entry.record = None;
            entry.generation = entry.generation.wrapping_add(1);
            // The free list never outgrows the table, for which space was already reserved.
            if self.free_grants.try_reserve(1).is_ok() {
                self.free_grants.push(slot);
            }
        }
    }
    /// Mark the frames of a record as no longer in flight.
    fn settle(&mut self, record: &GrantRecord) {
        for (color, count) in self.colors.iter_mut().zip(record.per_color) {
            color.in_flight = color.in_flight.saturating_sub(count);
        }
        self.uncredited_in_flight = self
            .uncredited_in_flight
            .saturating_sub(record.uncredited as usize);
    }
    fn reset(&mut self) {
        self.colors = Default::default();
        self.uncredited_in_flight = 0;
        for slot in 0..self.grants.len() as u16 {
            if self.grants[slot as usize].record.is_some() {
                self.free_grant(slot);
            }
        }
    }
}

/// Admission control for TX frames.
pub struct CreditController {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<CreditState>>,
    credit_arrived: SignalQueue,
}
impl CreditController {
    /// Create a new controller.
    ///
    /// If `enabled` is false, the firmware didn't negotiate credit based flow control and only
    /// the budget limits admission. The budget is capped at [u16::MAX], the width of the per
    /// color counters.
    pub fn new(enabled: bool, budget: usize) -> Self {
        let budget = budget.min(u16::MAX as usize);
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(CreditState {
                colors: Default::default(),
                open: [false; INTERFACE_COUNT],
                grants: Vec::new(),
                free_grants: Vec::new(),
                uncredited_in_flight: 0,
                budget,
                enabled,
            })),
            credit_arrived: SignalQueue::new(),
        }
    }
    pub fn from_config(config: &HifConfig) -> Self {
        Self::new(config.credit_enabled, config.tx_budget)
    }
    fn with_state<R>(&self, f: impl FnOnce(&mut CreditState) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
    /// Bind a color to the interface, if one is available.
    pub fn open_interface(&self, interface: InterfaceId) {
        self.with_state(|state| {
            if state.assign_color(interface).is_none() {
                debug!(
                    "No color left for interface {}, using shared credit.",
                    interface.raw()
                );
            }
        })
    }
    /// Unbind the interface's color and forfeit its outstanding grants.
    ///
    /// Once no interface is open anymore, all credit is reset.
    pub fn close_interface(&self, interface: InterfaceId) {
        self.with_state(|state| {
            state.open[interface.index()] = false;
            for color in state.colors.iter_mut() {
                if color.owner == Some(interface) {
                    color.owner = None;
                }
            }
            for slot in 0..state.grants.len() as u16 {
                let Some(record) = state.grants[slot as usize].record else {
                    continue;
                };
                if record.interface == interface {
                    state.settle(&record);
                    state.free_grant(slot);
                }
            }
            if !state.open.iter().any(|open| *open) {
                info!("Last interface closed, resetting credit.");
                state.reset();
            }
        })
    }
    /// Reserve credit for up to `count` frames.
    ///
    /// At most [HifConfig::MAX_FRAMES_PER_REQUEST] frames are granted per call. The grant may be
    /// smaller than requested. If nothing can be granted, [HifError::NoCredit] is returned.
    pub fn request_send(&self, interface: InterfaceId, count: usize) -> HifResult<CreditGrant> {
        self.with_state(|state| {
            let count = count
                .min(HifConfig::MAX_FRAMES_PER_REQUEST)
                .min(state.budget_left());
            let (per_color, uncredited) = if state.enabled {
                let exclusive = state.assign_color(interface);
                (state.plan(exclusive, count), 0)
            } else {
                state.open[interface.index()] = true;
                ([0; COLOR_COUNT], count as u16)
            };
            let record = GrantRecord {
                interface,
                per_color,
                uncredited,
            };
            let total = per_color.iter().map(|count| *count as usize).sum::<usize>()
                + uncredited as usize;
            if total == 0 {
                trace!("No credit for interface {}.", interface.raw());
                return Err(HifError::NoCredit);
            }
            let id = state.allocate_grant(record)?;
            for (color, count) in state.colors.iter_mut().zip(per_color) {
                color.credit -= count;
                color.in_flight += count;
            }
            state.uncredited_in_flight += uncredited as usize;
            trace!(
                "Granted {} frames to interface {}.",
                total,
                interface.raw()
            );
            Ok(CreditGrant {
                id,
                interface,
                per_color,
                uncredited,
            })
        })
    }
    /// The number of frames [Self::request_send] would currently grant the interface.
    pub fn available(&self, interface: InterfaceId) -> usize {
        self.with_state(|state| {
            let count = HifConfig::MAX_FRAMES_PER_REQUEST.min(state.budget_left());
            if !state.enabled {
                return count;
            }
            let exclusive = state.exclusive_color(interface).or_else(|| {
                // A color would be bound on request.
                let open = state.open;
                state.colors.iter().position(|color| {
                    color.owner.map_or(true, |owner| !open[owner.index()])
                })
            });
            state
                .plan(exclusive, count)
                .iter()
                .map(|count| *count as usize)
                .sum()
        })
    }
    /// The firmware consumed the frames of the grant.
    pub fn on_ack(&self, grant: CreditGrant) -> HifResult<()> {
        self.with_state(|state| {
            let record = *state.record_mut(grant.id)?;
            state.settle(&record);
            state.free_grant(grant.id.slot);
            Ok(())
        })
    }
    /// Return the credit of `unused` frames at the end of the grant.
    pub fn refund(&self, grant: &mut CreditGrant, unused: usize) -> HifResult<()> {
        self.with_state(|state| {
            let record = state.record_mut(grant.id)?;
            let mut remaining = unused.min(grant.total());
            let mut returned = [0u16; COLOR_COUNT];
            let uncredited = remaining.min(record.uncredited as usize) as u16;
            record.uncredited -= uncredited;
            remaining -= uncredited as usize;
            for color in (0..COLOR_COUNT).rev() {
                let count = remaining.min(record.per_color[color] as usize) as u16;
                record.per_color[color] -= count;
                returned[color] = count;
                remaining -= count as usize;
            }
            grant.per_color = record.per_color;
            grant.uncredited = record.uncredited;
            for (color, count) in state.colors.iter_mut().zip(returned) {
                color.credit = color.credit.saturating_add(count);
                color.in_flight = color.in_flight.saturating_sub(count);
            }
            state.uncredited_in_flight = state
                .uncredited_in_flight
                .saturating_sub(uncredited as usize);
            Ok(())
        })
    }
    /// Return the whole grant, because its frames couldn't be sent.
    pub fn cancel(&self, mut grant: CreditGrant) -> HifResult<()> {
        let total = grant.total();
        self.refund(&mut grant, total)?;
        self.with_state(|state| state.free_grant(grant.id.slot));
        Ok(())
    }
    /// Handle credit reported by the firmware.
    ///
    /// If `is_event` is set, the credit came from a flow control event, in which case all zeroes
    /// reset the credit of every color.
    pub fn on_credit(&self, flow: [u8; COLOR_COUNT], is_event: bool) {
        let added = self.with_state(|state| {
            if is_event && flow == [0; COLOR_COUNT] {
                debug!("Firmware reset credit.");
                for color in state.colors.iter_mut() {
                    color.credit = 0;
                }
                return false;
            }
            for (color, credit) in state.colors.iter_mut().zip(flow) {
                color.credit = color.credit.saturating_add(credit as u16);
            }
            flow.iter().any(|credit| *credit != 0)
        });
        if added {
            self.credit_arrived.put();
        }
    }
    /// The total number of frames in flight.
    pub fn in_flight(&self) -> usize {
        self.with_state(|state| state.in_flight())
    }
    pub fn colors(&self) -> [ColorStatus; COLOR_COUNT] {
        self.with_state(|state| state.colors)
    }
    pub fn is_enabled(&self) -> bool {
        self.with_state(|state| state.enabled)
    }
    /// Raised whenever the firmware reported new credit.
    pub fn credit_signal(&self) -> &SignalQueue {
        &self.credit_arrived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interface(id: u8) -> InterfaceId {
        InterfaceId::new(id).unwrap()
    }

    #[test]
    fn budget_is_clamped_to_counter_width() {
        let controller = CreditController::new(true, 200_000);
        let mut grants = Vec::new();
        for _ in 0..1100 {
            controller.on_credit([64, 0, 0, 0], false);
            if let Ok(grant) = controller.request_send(interface(0), 64) {
                grants.push(grant);
            }
        }
        assert_eq!(grants.len(), 1024);
        assert_eq!(controller.in_flight(), u16::MAX as usize);
        assert_eq!(controller.colors()[0].in_flight, u16::MAX);
        assert_eq!(
            controller.request_send(interface(0), 1).unwrap_err(),
            HifError::NoCredit
        );
    }

    #[test]
    fn exclusive_before_shared() {
        let controller = CreditController::new(true, 1024);
        controller.open_interface(interface(0));
        controller.open_interface(interface(1));
        controller.on_credit([5, 10, 20, 30], true);
        assert_eq!(controller.credit_signal().pending(), 1);

        let grant = controller.request_send(interface(0), 40).unwrap();
        // Color 0 is exclusive, colors 2 and 3 are shared and color 1 belongs to interface 1.
        assert_eq!(grant.per_color(), &[5, 0, 20, 15]);
        assert_eq!(grant.total(), 40);
        assert_eq!(grant.color_for(0), Some(0));
        assert_eq!(grant.color_for(5), Some(2));
        assert_eq!(grant.color_for(25), Some(3));
        assert_eq!(grant.color_for(40), None);
        assert_eq!(controller.in_flight(), 40);
        assert_eq!(controller.available(interface(0)), 15);
        assert_eq!(controller.available(interface(1)), 25);

        controller.on_ack(grant).unwrap();
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(controller.colors()[3].credit, 15);
    }

    #[test]
    fn requests_are_capped() {
        let controller = CreditController::new(true, 1024);
        controller.on_credit([100, 100, 0, 0], false);
        let grant = controller.request_send(interface(2), 100).unwrap();
        assert_eq!(grant.total(), HifConfig::MAX_FRAMES_PER_REQUEST);

        let disabled = CreditController::new(false, 1024);
        let grant = disabled.request_send(interface(0), 100).unwrap();
        assert_eq!(grant.total(), HifConfig::MAX_FRAMES_PER_REQUEST);
        assert_eq!(grant.color_for(63), Some(0));
        assert_eq!(disabled.in_flight(), 64);
        disabled.on_ack(grant).unwrap();
        assert_eq!(disabled.in_flight(), 0);
    }

    #[test]
    fn no_credit_is_soft_failure() {
        let controller = CreditController::new(true, 1024);
        assert_eq!(
            controller.request_send(interface(0), 1),
            Err(HifError::NoCredit)
        );
        controller.on_credit([0, 0, 0, 1], false);
        assert!(controller.request_send(interface(0), 1).is_ok());
        assert_eq!(
            controller.request_send(interface(0), 1),
            Err(HifError::NoCredit)
        );
    }

    #[test]
    fn refund_and_cancel_return_credit() {
        let controller = CreditController::new(true, 1024);
        controller.on_credit([4, 0, 4, 0], false);
        let mut grant = controller.request_send(interface(0), 8).unwrap();
        assert_eq!(grant.per_color(), &[4, 0, 4, 0]);
        controller.refund(&mut grant, 3).unwrap();
        assert_eq!(grant.per_color(), &[4, 0, 1, 0]);
        assert_eq!(controller.colors()[2].credit, 3);
        assert_eq!(controller.in_flight(), 5);

        controller.cancel(grant).unwrap();
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(controller.colors()[0].credit, 4);
        assert_eq!(controller.colors()[2].credit, 4);
    }

    #[test]
    fn closing_interface_forfeits_grants() {
        let controller = CreditController::new(true, 1024);
        controller.open_interface(interface(0));
        controller.open_interface(interface(1));
        controller.on_credit([10, 10, 0, 0], false);
        let first = controller.request_send(interface(0), 5).unwrap();
        let second = controller.request_send(interface(1), 5).unwrap();

        controller.close_interface(interface(0));
        assert_eq!(controller.colors()[0].owner, None);
        assert_eq!(controller.in_flight(), 5);
        assert_eq!(controller.on_ack(first), Err(HifError::UnknownGrant));

        // Interface 2 takes the released color.
        controller.open_interface(interface(2));
        assert_eq!(controller.colors()[0].owner, Some(interface(2)));

        controller.close_interface(interface(2));
        controller.close_interface(interface(1));
        assert_eq!(controller.colors(), [ColorStatus::default(); COLOR_COUNT]);
        assert_eq!(controller.on_ack(second), Err(HifError::UnknownGrant));
    }

    #[test]
    fn zero_credit_event_resets() {
        let controller = CreditController::new(true, 1024);
        controller.on_credit([1, 2, 3, 4], false);
        // All zeroes from a frame don't mean anything.
        controller.on_credit([0; COLOR_COUNT], false);
        assert_eq!(controller.colors()[3].credit, 4);
        controller.on_credit([0; COLOR_COUNT], true);
        assert!(controller.colors().iter().all(|color| color.credit == 0));
    }

    #[test]
    fn in_flight_is_conserved() {
        const BUDGET: usize = 100;
        let controller = CreditController::new(true, BUDGET);
        let mut grants: Vec<CreditGrant> = Vec::new();
        let mut seed = 0x0bad_f00du32;
        for _ in 0..5000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let value = (seed >> 16) as usize;
            match value % 5 {
                0 => controller.on_credit([(value % 50) as u8, 3, 7, (value % 11) as u8], false),
                1 | 2 => {
                    if let Ok(grant) =
                        controller.request_send(interface((value % 4) as u8), value % 80)
                    {
                        grants.push(grant);
                    }
                }
                3 => {
                    if !grants.is_empty() {
                        let grant = grants.swap_remove(value % grants.len());
                        controller.on_ack(grant).unwrap();
                    }
                }
                _ => {
                    if let Some(grant) = grants.last_mut() {
                        controller.refund(grant, value % 4).unwrap();
                    }
                }
            }
            let outstanding: usize = grants.iter().map(CreditGrant::total).sum();
            assert_eq!(controller.in_flight(), outstanding);
            assert!(outstanding <= BUDGET);
            let colors = controller.colors();
            for color in 0..COLOR_COUNT {
                let granted: usize = grants
                    .iter()
                    .map(|grant| grant.per_color()[color] as usize)
                    .sum();
                assert_eq!(colors[color].in_flight as usize, granted);
            }
        }
    }
}
