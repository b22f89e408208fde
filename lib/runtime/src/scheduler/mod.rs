use crate::device::{
    Device, DeviceHandle, DeviceRegistry, DeviceTag, LineId, LineState, RegistryError, WiringTable,
};
use emucore_time::{Frequency, SimTime};
use std::{
    any::Any,
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

pub use timer::{TimerError, TimerEvent, TimerHandle, TimerParam};
pub(crate) use timer::{TimerQueue, TimerSlotState, TimerWork};

mod timer;

#[cfg(test)]
mod tests;

/// Consecutive zero-progress polls tolerated before a device is declared
/// stalled
///
/// The count lives on the execution entry and survives step boundaries, so
/// a device that makes no progress while global time is pinned (yielding or
/// parking at an instant it has already reached, over and over) still trips
/// the limit instead of livelocking the run
const STALL_LIMIT: u32 = 8;

#[derive(thiserror::Error, Debug)]
pub enum ScheduleError {
    /// The device kept reporting zero consumed cycles without yielding or
    /// suspending; forward progress is the scheduler's core invariant so
    /// this is fatal, not recoverable
    #[error("device {tag} made no forward progress at {time}")]
    DeviceStalled { tag: DeviceTag, time: SimTime },
}

/// Per executable device bookkeeping
pub(crate) struct ExecEntry {
    pub tag: DeviceTag,
    pub handle: DeviceHandle,
    pub clock: Frequency,
    /// How far this device's own instruction stream has progressed;
    /// always at or ahead of global time, ahead by at most one quantum
    pub local_time: SimTime,
    pub suspended_until: Option<SimTime>,
    /// Consecutive polls without forward progress, reset whenever cycles
    /// are consumed or a suspension actually moves the device ahead
    pub stall_polls: u32,
    #[allow(clippy::type_complexity)]
    pub adapter: Arc<dyn Fn(&mut dyn Device, &mut ExecutionContext<'_>) -> u64 + Send + Sync>,
}

impl Debug for ExecEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEntry")
            .field("tag", &self.tag)
            .field("clock", &self.clock)
            .field("local_time", &self.local_time)
            .field("suspended_until", &self.suspended_until)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct ExecState {
    pub now: SimTime,
    pub entries: Vec<ExecEntry>,
}

/// The synchronization core
///
/// Single threaded and cooperative: one device executes at a time, and the
/// interleaving is fully determined by simulation time, which is what makes
/// save states and replays deterministic. Interior mutability so the owning
/// machine can expose `&self` methods, as device callbacks re-enter here.
#[derive(Debug)]
pub struct Scheduler {
    pub(crate) state: Mutex<ExecState>,
    pub(crate) timers: Mutex<TimerQueue>,
    pub(crate) registry: Arc<DeviceRegistry>,
    wiring: WiringTable,
    quantum: SimTime,
    /// Raised by synchronize requests so the in-flight device slice returns
    /// early and the step boundary can be lowered
    yield_flag: AtomicBool,
}

impl Scheduler {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        timers: TimerQueue,
        entries: Vec<ExecEntry>,
        wiring: WiringTable,
        quantum: SimTime,
    ) -> Self {
        Self {
            state: Mutex::new(ExecState {
                now: SimTime::ZERO,
                entries,
            }),
            timers: Mutex::new(timers),
            registry,
            wiring,
            quantum,
            yield_flag: AtomicBool::new(false),
        }
    }

    /// Global simulation time: the boundary of the last completed step
    pub fn now(&self) -> SimTime {
        self.state.lock().unwrap().now
    }

    pub fn quantum(&self) -> SimTime {
        self.quantum
    }

    /// Minimum target time among armed timers
    pub fn next_event_time(&self) -> SimTime {
        self.timers.lock().unwrap().next_event_time()
    }

    /// Run everything for `allotted` of simulation time
    pub fn run(&self, allotted: SimTime) -> Result<(), ScheduleError> {
        self.run_until(self.now() + allotted)
    }

    /// Run everything until global time reaches `target`
    pub fn run_until(&self, target: SimTime) -> Result<(), ScheduleError> {
        while self.now() < target {
            self.step(target)?;
        }

        Ok(())
    }

    /// One scheduling step: pick the next boundary, advance every
    /// executable device up to it, then fire every due timer
    fn step(&self, run_target: SimTime) -> Result<(), ScheduleError> {
        let now = self.now();
        let next_timer = self.timers.lock().unwrap().next_event_time();

        let mut boundary = (now + self.quantum)
            .min(next_timer)
            .min(run_target)
            .max(now);

        self.yield_flag.store(false, Ordering::Release);

        let device_count = self.state.lock().unwrap().entries.len();

        for index in 0..device_count {
            loop {
                // Snapshot what we need, then drop the lock: the device may
                // re-enter the scheduler while it runs
                let slice = {
                    let mut state = self.state.lock().unwrap();
                    let entry = &mut state.entries[index];

                    if let Some(wake) = entry.suspended_until {
                        if wake > boundary {
                            // Time passes while suspended
                            entry.local_time = entry.local_time.max(boundary);
                        } else {
                            entry.suspended_until = None;
                            entry.local_time = entry.local_time.max(wake);
                        }
                    }

                    if entry.local_time >= boundary {
                        None
                    } else {
                        Some((
                            entry.tag.clone(),
                            entry.handle.clone(),
                            entry.clock,
                            entry.local_time,
                            entry.adapter.clone(),
                        ))
                    }
                };

                let Some((tag, handle, clock, local_time, adapter)) = slice else {
                    break;
                };

                let budget = (boundary - local_time).to_ticks_ceil(clock);
                if budget == 0 {
                    // Sub-cycle remainder, absorb it
                    self.state.lock().unwrap().entries[index].local_time = boundary;
                    break;
                }

                let mut context = ExecutionContext {
                    context: SchedulerContext { scheduler: self },
                    tag: tag.clone(),
                    budget,
                    local_time,
                    suspend_request: None,
                };

                let consumed = handle
                    .interact_mut(|device| (adapter)(device, &mut context))
                    .min(budget);

                let suspend_request = context.suspend_request;
                let yielded = self.yield_flag.load(Ordering::Acquire);

                // Only a suspension that moves the device past its current
                // local time is progress; a yield or a wake time already
                // reached leaves the poll at zero progress and counts
                // toward the stall limit
                let parked = matches!(suspend_request, Some(wake) if wake > local_time);

                let stalled = {
                    let mut state = self.state.lock().unwrap();
                    let entry = &mut state.entries[index];

                    if consumed > 0 {
                        let advanced =
                            entry.local_time + SimTime::from_ticks(consumed, entry.clock);

                        // A full budget always reaches the boundary; the
                        // ceil conversion may land an attosecond short
                        entry.local_time = if consumed == budget {
                            advanced.max(boundary)
                        } else {
                            advanced
                        };
                    }

                    entry.suspended_until = suspend_request;

                    if consumed > 0 || parked {
                        entry.stall_polls = 0;
                        false
                    } else {
                        entry.stall_polls += 1;
                        entry.stall_polls >= STALL_LIMIT
                    }
                };

                if stalled {
                    tracing::error!("device {tag} is stalled, aborting the run");
                    return Err(ScheduleError::DeviceStalled {
                        tag,
                        time: local_time,
                    });
                }

                if yielded {
                    // A synchronize barrier was requested mid-slice: lower
                    // the boundary so the barrier fires before anyone moves
                    // past it
                    let next = self.timers.lock().unwrap().next_event_time();
                    boundary = boundary.min(next.max(now));
                    self.yield_flag.store(false, Ordering::Release);
                }
            }
        }

        self.state.lock().unwrap().now = boundary;

        self.fire_due(boundary);

        Ok(())
    }

    /// Fire every timer due at or before `now`, in deterministic order
    fn fire_due(&self, now: SimTime) {
        loop {
            let fired = self.timers.lock().unwrap().checkout_due(now);
            let Some(fired) = fired else {
                break;
            };

            let event = TimerEvent {
                now,
                param: fired.param,
            };
            let context = SchedulerContext { scheduler: self };

            let work = match fired.work {
                TimerWork::Recurring(mut callback) => {
                    let delivered = self
                        .registry
                        .interact_dyn_mut(&fired.owner, |device| {
                            callback(device, &context, event)
                        })
                        .is_ok();

                    if !delivered {
                        tracing::warn!("timer owner {} is gone, dropping callback", fired.owner);
                    }

                    Some(TimerWork::Recurring(callback))
                }
                TimerWork::Once(callback) => {
                    if self
                        .registry
                        .interact_dyn_mut(&fired.owner, |device| callback(device, &context, event))
                        .is_err()
                    {
                        tracing::warn!(
                            "synchronize owner {} is gone, dropping callback",
                            fired.owner
                        );
                    }

                    None
                }
            };

            self.timers.lock().unwrap().finish_fire(
                fired.handle,
                fired.generation,
                fired.target,
                work,
                now,
            );
        }
    }

    /// Allocate a persistent timer owned by `owner`
    ///
    /// The callback receives the owning device; do not reach back into the
    /// owner through the context, it is already borrowed.
    pub fn allocate_timer<D: Device>(
        &self,
        owner: &DeviceTag,
        mut callback: impl FnMut(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) -> TimerHandle {
        let work = TimerWork::Recurring(Box::new(move |device, context, event| {
            let device = (device as &mut dyn Any).downcast_mut().unwrap();

            callback(device, context, event);
        }));

        self.timers.lock().unwrap().allocate(owner.clone(), work)
    }

    /// Arm: fire once `delay` from now, then every `period` if given
    pub fn arm_timer(
        &self,
        handle: TimerHandle,
        delay: SimTime,
        period: Option<SimTime>,
        param: TimerParam,
    ) -> Result<(), TimerError> {
        let now = self.now();
        self.timers
            .lock()
            .unwrap()
            .arm(handle, now, delay, period, param)
    }

    pub fn disarm_timer(&self, handle: TimerHandle) -> Result<(), TimerError> {
        self.timers.lock().unwrap().disarm(handle)
    }

    pub fn timer_remaining(&self, handle: TimerHandle) -> Result<Option<SimTime>, TimerError> {
        let now = self.now();
        self.timers.lock().unwrap().remaining(handle, now)
    }

    /// Run `callback` against `owner` once every device has reached the
    /// current instant, before any of them advances past it
    ///
    /// The deterministic cross-device handoff primitive: a CPU writing a
    /// command latch for a companion MCU synchronizes so the latch is set
    /// at an exact instant both sides agree on, instead of racing ahead a
    /// quantum.
    pub fn synchronize<D: Device>(
        &self,
        owner: &DeviceTag,
        param: TimerParam,
        callback: impl FnOnce(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) {
        let work = TimerWork::Once(Box::new(move |device, context, event| {
            let device = (device as &mut dyn Any).downcast_mut().unwrap();

            callback(device, context, event);
        }));

        let now = self.now();

        {
            let mut timers = self.timers.lock().unwrap();
            let handle = timers.allocate_transient(owner.clone(), work);

            // Immediate target; cannot fail, the period is None
            timers
                .arm(handle, now, SimTime::ZERO, None, param)
                .unwrap();
        }

        self.yield_flag.store(true, Ordering::Release);
    }

    /// Force the state of an input line on a device
    pub fn set_input_line(
        &self,
        tag: &DeviceTag,
        line: LineId,
        state: LineState,
    ) -> Result<(), RegistryError> {
        self.registry
            .interact_dyn_mut(tag, |device| device.line_changed(line, state))
    }

    /// Propagate an output line change through the wiring table
    pub fn drive_line(
        &self,
        source: &DeviceTag,
        line: LineId,
        state: LineState,
    ) -> Result<(), RegistryError> {
        for (target, target_line) in self.wiring.targets(source, line) {
            self.set_input_line(target, *target_line, state)?;
        }

        Ok(())
    }
}

/// Borrowed scheduler access handed to timer callbacks
///
/// Devices never hold the scheduler; they get this context (or an
/// [ExecutionContext]) for the duration of a callback.
#[derive(Clone, Copy)]
pub struct SchedulerContext<'a> {
    scheduler: &'a Scheduler,
}

impl Debug for SchedulerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerContext").finish()
    }
}

impl<'a> SchedulerContext<'a> {
    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn arm_timer(
        &self,
        handle: TimerHandle,
        delay: SimTime,
        period: Option<SimTime>,
        param: TimerParam,
    ) -> Result<(), TimerError> {
        self.scheduler.arm_timer(handle, delay, period, param)
    }

    pub fn disarm_timer(&self, handle: TimerHandle) -> Result<(), TimerError> {
        self.scheduler.disarm_timer(handle)
    }

    pub fn timer_remaining(&self, handle: TimerHandle) -> Result<Option<SimTime>, TimerError> {
        self.scheduler.timer_remaining(handle)
    }

    pub fn synchronize<D: Device>(
        &self,
        owner: &DeviceTag,
        param: TimerParam,
        callback: impl FnOnce(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) {
        self.scheduler.synchronize(owner, param, callback)
    }

    /// See [Scheduler::set_input_line]; the device a callback is currently
    /// borrowing must be mutated through the callback argument, not here
    pub fn set_input_line(
        &self,
        tag: &DeviceTag,
        line: LineId,
        state: LineState,
    ) -> Result<(), RegistryError> {
        self.scheduler.set_input_line(tag, line, state)
    }

    pub fn drive_line(
        &self,
        source: &DeviceTag,
        line: LineId,
        state: LineState,
    ) -> Result<(), RegistryError> {
        self.scheduler.drive_line(source, line, state)
    }
}

/// What an executable device sees for the duration of one run slice
pub struct ExecutionContext<'a> {
    context: SchedulerContext<'a>,
    tag: DeviceTag,
    budget: u64,
    local_time: SimTime,
    suspend_request: Option<SimTime>,
}

impl Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tag", &self.tag)
            .field("budget", &self.budget)
            .field("local_time", &self.local_time)
            .finish()
    }
}

impl<'a> ExecutionContext<'a> {
    /// How many local clock cycles this slice may consume
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// This device's local time at the start of the slice
    pub fn local_time(&self) -> SimTime {
        self.local_time
    }

    pub fn tag(&self) -> &DeviceTag {
        &self.tag
    }

    /// Scheduler access for timers, synchronize and line control
    pub fn scheduler(&self) -> &SchedulerContext<'a> {
        &self.context
    }

    /// True once a synchronize barrier wants this slice to end; cooperative
    /// run loops should check this between instructions and return early
    pub fn yield_requested(&self) -> bool {
        self.context.scheduler.yield_flag.load(Ordering::Acquire)
    }

    /// Park this device until `wake`: its clock keeps advancing but no
    /// cycles execute, the command-handoff wait of protection MCUs
    pub fn suspend_until(&mut self, wake: SimTime) {
        self.suspend_request = Some(wake);
    }
}
