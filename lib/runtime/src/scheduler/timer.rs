use crate::{device::Device, device::DeviceTag, scheduler::SchedulerContext};
use emucore_time::SimTime;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fmt::Debug,
};

/// Opaque payload handed back to a timer callback when it fires
pub type TimerParam = u64;

/// Identity of a pooled timer slot
///
/// Stable across re-arms; devices keep the handle and adjust the same
/// conceptual timer many times per emulated second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle(pub(crate) u32);

/// What a firing timer tells its callback
#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    /// Global simulation time of the firing
    pub now: SimTime,
    /// The param the timer was armed with
    pub param: TimerParam,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TimerError {
    #[error("periodic interval must be a positive finite time")]
    InvalidPeriod,
    #[error("unknown timer handle")]
    UnknownHandle,
}

#[allow(clippy::type_complexity)]
pub(crate) enum TimerWork {
    /// Re-armable device timer
    Recurring(Box<dyn FnMut(&mut dyn Device, &SchedulerContext<'_>, TimerEvent) + Send + Sync>),
    /// Fire-and-forget entry, used for synchronize barriers
    Once(Box<dyn FnOnce(&mut dyn Device, &SchedulerContext<'_>, TimerEvent) + Send + Sync>),
}

impl Debug for TimerWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recurring(_) => f.write_str("Recurring"),
            Self::Once(_) => f.write_str("Once"),
        }
    }
}

struct TimerSlot {
    owner: DeviceTag,
    /// None while the callback is checked out for firing
    work: Option<TimerWork>,
    target: SimTime,
    period: Option<SimTime>,
    param: TimerParam,
    enabled: bool,
    /// Bumped on every arm/disarm so stale heap entries can be skipped
    generation: u64,
    /// Transient slots are released back to the pool after firing
    transient: bool,
}

impl Debug for TimerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSlot")
            .field("owner", &self.owner)
            .field("target", &self.target)
            .field("period", &self.period)
            .field("enabled", &self.enabled)
            .field("transient", &self.transient)
            .finish()
    }
}

/// Heap ordering is (target, slot); the slot index implements the
/// allocation-order tie break for identical target times
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    target: SimTime,
    slot: u32,
    generation: u64,
}

/// A checked-out due timer, callback included
pub(crate) struct FiredTimer {
    pub handle: TimerHandle,
    pub owner: DeviceTag,
    pub work: TimerWork,
    pub target: SimTime,
    pub param: TimerParam,
    pub generation: u64,
}

/// Serialized per-slot state, enough to reproduce subsequent firing order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TimerSlotState {
    pub target: SimTime,
    pub period: Option<SimTime>,
    pub param: TimerParam,
    pub enabled: bool,
}

/// The pending set of timed callbacks
///
/// A slot pool plus a binary heap with lazy invalidation: re-arming never
/// reallocates identity, it bumps the slot generation and pushes a fresh
/// heap entry; entries whose generation no longer matches are discarded
/// when encountered.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    slots: Vec<TimerSlot>,
    free: Vec<u32>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl TimerQueue {
    /// Allocate a persistent, re-armable timer slot
    pub fn allocate(&mut self, owner: DeviceTag, work: TimerWork) -> TimerHandle {
        self.allocate_inner(owner, work, false)
    }

    /// Allocate a transient slot that frees itself after firing
    pub fn allocate_transient(&mut self, owner: DeviceTag, work: TimerWork) -> TimerHandle {
        self.allocate_inner(owner, work, true)
    }

    fn allocate_inner(&mut self, owner: DeviceTag, work: TimerWork, transient: bool) -> TimerHandle {
        // Only transient slots recycle: persistent handles keep their
        // allocation-order tie break stable for the life of the machine
        if transient {
            if let Some(index) = self.free.pop() {
                let slot = &mut self.slots[index as usize];
                slot.owner = owner;
                slot.work = Some(work);
                slot.transient = true;

                return TimerHandle(index);
            }
        }

        let index = u32::try_from(self.slots.len()).unwrap();
        self.slots.push(TimerSlot {
            owner,
            work: Some(work),
            target: SimTime::NEVER,
            period: None,
            param: 0,
            enabled: false,
            generation: 0,
            transient,
        });

        TimerHandle(index)
    }

    /// Re-arm a timer: fire once `delay` after `now`, then every `period`
    ///
    /// A `delay` of [SimTime::NEVER] disables the timer without freeing its
    /// identity. A zero or never `period` is a configuration error.
    pub fn arm(
        &mut self,
        handle: TimerHandle,
        now: SimTime,
        delay: SimTime,
        period: Option<SimTime>,
        param: TimerParam,
    ) -> Result<(), TimerError> {
        if let Some(period) = period {
            if period.is_zero() || period.is_never() {
                return Err(TimerError::InvalidPeriod);
            }
        }

        let slot = self
            .slots
            .get_mut(handle.0 as usize)
            .ok_or(TimerError::UnknownHandle)?;

        slot.generation += 1;
        slot.period = period;
        slot.param = param;

        if delay.is_never() {
            slot.enabled = false;
            slot.target = SimTime::NEVER;
            return Ok(());
        }

        slot.enabled = true;
        slot.target = now + delay;

        self.heap.push(Reverse(HeapEntry {
            target: slot.target,
            slot: handle.0,
            generation: slot.generation,
        }));

        Ok(())
    }

    /// Disable without freeing identity; no effect if already fired
    pub fn disarm(&mut self, handle: TimerHandle) -> Result<(), TimerError> {
        let slot = self
            .slots
            .get_mut(handle.0 as usize)
            .ok_or(TimerError::UnknownHandle)?;

        slot.generation += 1;
        slot.enabled = false;
        slot.target = SimTime::NEVER;

        Ok(())
    }

    /// Whether the timer is armed, and if so how long until it fires
    pub fn remaining(
        &self,
        handle: TimerHandle,
        now: SimTime,
    ) -> Result<Option<SimTime>, TimerError> {
        let slot = self
            .slots
            .get(handle.0 as usize)
            .ok_or(TimerError::UnknownHandle)?;

        Ok(slot.enabled.then(|| slot.target - now))
    }

    /// Minimum target time among enabled entries, [SimTime::NEVER] if none
    pub fn next_event_time(&mut self) -> SimTime {
        while let Some(Reverse(entry)) = self.heap.peek() {
            let slot = &self.slots[entry.slot as usize];

            if slot.generation != entry.generation || !slot.enabled {
                self.heap.pop();
                continue;
            }

            return entry.target;
        }

        SimTime::NEVER
    }

    /// Check out the next due timer, if any
    ///
    /// The caller invokes the callback without holding the queue lock and
    /// must hand the slot back through [Self::finish_fire] before checking
    /// out the next one.
    pub fn checkout_due(&mut self, now: SimTime) -> Option<FiredTimer> {
        loop {
            let Reverse(entry) = self.heap.peek()?;
            if entry.target > now {
                return None;
            }

            let Reverse(entry) = self.heap.pop().unwrap();
            let slot = &mut self.slots[entry.slot as usize];

            if slot.generation != entry.generation || !slot.enabled {
                continue;
            }

            // The fire loop finishes each checkout before the next, so the
            // callback is always home at this point
            let work = slot.work.take().unwrap();

            // One-shots are spent; periodic entries re-arm in finish_fire
            if slot.period.is_none() {
                slot.enabled = false;
                slot.target = SimTime::NEVER;
            }

            return Some(FiredTimer {
                handle: TimerHandle(entry.slot),
                owner: slot.owner.clone(),
                work,
                target: entry.target,
                param: slot.param,
                generation: entry.generation,
            });
        }
    }

    /// Return a checked-out slot after its callback ran
    ///
    /// `work` is `None` when the callback was consumed (transient one-shot).
    /// Periodic slots whose generation was not bumped by the callback are
    /// re-armed here; a backlog of missed periods collapses into a single
    /// firing, re-anchored relative to `now`, so a long stall never causes
    /// a callback storm.
    pub fn finish_fire(
        &mut self,
        handle: TimerHandle,
        generation: u64,
        fired_target: SimTime,
        work: Option<TimerWork>,
        now: SimTime,
    ) {
        let slot = &mut self.slots[handle.0 as usize];

        match work {
            Some(work) => {
                slot.work = Some(work);

                if let (true, true, Some(period)) =
                    (slot.generation == generation, slot.enabled, slot.period)
                {
                    let mut next = fired_target + period;

                    if next <= now {
                        tracing::debug!(
                            "timer for {} fell {} behind, dropping backlog",
                            slot.owner,
                            now - next,
                        );
                        next = now + period;
                    }

                    slot.target = next;
                    self.heap.push(Reverse(HeapEntry {
                        target: next,
                        slot: handle.0,
                        generation,
                    }));
                }
            }
            None => {
                debug_assert!(slot.transient);
                slot.enabled = false;
                slot.target = SimTime::NEVER;
                slot.period = None;
                slot.generation += 1;
                self.free.push(handle.0);
            }
        }
    }

    /// Whether a transient (synchronize) entry is still pending
    pub fn transient_pending(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.transient && slot.enabled)
    }

    /// Per-slot state of every persistent timer, in allocation order
    pub fn export_state(&self) -> Vec<TimerSlotState> {
        self.slots
            .iter()
            .filter(|slot| !slot.transient)
            .map(|slot| TimerSlotState {
                target: slot.target,
                period: slot.period,
                param: slot.param,
                enabled: slot.enabled,
            })
            .collect()
    }

    /// Overwrite persistent timer state, rebuilding pending heap entries
    ///
    /// The machine must have been configured identically to the one the
    /// state was exported from; the slot layout is positional.
    pub fn restore_state(&mut self, states: &[TimerSlotState]) -> Result<(), String> {
        let persistent: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.transient)
            .map(|(index, _)| index as u32)
            .collect();

        if persistent.len() != states.len() {
            return Err(format!(
                "snapshot has {} timers, machine has {}",
                states.len(),
                persistent.len()
            ));
        }

        for (index, state) in persistent.into_iter().zip(states) {
            let slot = &mut self.slots[index as usize];

            slot.generation += 1;
            slot.target = state.target;
            slot.period = state.period;
            slot.param = state.param;
            slot.enabled = state.enabled;

            if slot.enabled {
                self.heap.push(Reverse(HeapEntry {
                    target: slot.target,
                    slot: index,
                    generation: slot.generation,
                }));
            }
        }

        Ok(())
    }
}
