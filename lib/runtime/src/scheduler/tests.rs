use super::*;
use crate::{
    device::{Device, DeviceConfig, DeviceTag, Executable, LineId, LineState},
    machine::{DeviceBuilder, Machine},
};
use emucore_time::{Frequency, SimTime};
use std::error::Error;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Default)]
struct Counter {
    cycles: u64,
    budget_cap: Option<u64>,
}

impl Device for Counter {}

impl Executable for Counter {
    fn run(&mut self, context: &mut ExecutionContext<'_>) -> u64 {
        if let Some(cap) = self.budget_cap {
            assert!(context.budget() <= cap, "budget exceeded the quantum bound");
        }

        self.cycles += context.budget();
        context.budget()
    }
}

#[derive(Debug)]
struct CounterConfig {
    clock: Frequency,
    budget_cap: Option<u64>,
}

impl DeviceConfig for CounterConfig {
    type Device = Counter;

    fn build(
        self,
        builder: DeviceBuilder<'_, Counter>,
    ) -> Result<Counter, Box<dyn Error>> {
        builder.set_execution(self.clock);

        Ok(Counter {
            cycles: 0,
            budget_cap: self.budget_cap,
        })
    }
}

#[test]
fn counters_track_their_clocks_exactly() {
    init_tracing();

    let (builder, slow) = Machine::builder().insert_device(
        "slow",
        CounterConfig {
            clock: Frequency::from_integer(1_000),
            budget_cap: None,
        },
    );
    let (builder, fast) = builder.insert_device(
        "fast",
        CounterConfig {
            clock: Frequency::from_integer(10_000),
            budget_cap: None,
        },
    );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_secs(1)).unwrap();

    assert_eq!(machine.now(), SimTime::from_secs(1));
    assert_eq!(
        machine.interact(&slow, |c: &Counter| c.cycles).unwrap(),
        1_000
    );
    assert_eq!(
        machine.interact(&fast, |c: &Counter| c.cycles).unwrap(),
        10_000
    );
}

#[test]
fn budgets_stay_within_the_quantum() {
    // 1 MHz against a 100 microsecond quantum is at most 100 cycles a slice
    let (builder, _) = Machine::builder()
        .set_quantum(SimTime::from_micros(100))
        .insert_device(
            "cpu",
            CounterConfig {
                clock: Frequency::from_integer(1_000_000),
                budget_cap: Some(100),
            },
        );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(10)).unwrap();
}

#[test]
fn fractional_clocks_do_not_drift() {
    // An NTSC-ish ratio that never divides evenly into any quantum
    let clock = Frequency::new(60_000, 1_001);

    let (builder, tag) = Machine::builder().insert_device(
        "sync",
        CounterConfig {
            clock,
            budget_cap: None,
        },
    );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(1_001)).unwrap();

    assert_eq!(machine.interact(&tag, |c: &Counter| c.cycles).unwrap(), 60);
}

#[derive(Debug, Default)]
struct Recorder {
    fired_at: Vec<SimTime>,
    params: Vec<TimerParam>,
    order: Vec<&'static str>,
}

impl Device for Recorder {}

#[derive(Debug)]
struct OneShotConfig {
    delay: SimTime,
    param: TimerParam,
}

impl DeviceConfig for OneShotConfig {
    type Device = Recorder;

    fn build(
        self,
        builder: DeviceBuilder<'_, Recorder>,
    ) -> Result<Recorder, Box<dyn Error>> {
        let (builder, handle) = builder.allocate_timer(|recorder: &mut Recorder, _, event| {
            recorder.fired_at.push(event.now);
            recorder.params.push(event.param);
        });
        builder.arm_timer(handle, self.delay, None, self.param);

        Ok(Recorder::default())
    }
}

#[test]
fn one_shot_fires_once_at_the_exact_instant() {
    // 250 microseconds is not on any 100 microsecond quantum boundary
    let (builder, tag) = Machine::builder()
        .set_quantum(SimTime::from_micros(100))
        .insert_device(
            "recorder",
            OneShotConfig {
                delay: SimTime::from_micros(250),
                param: 0x2A,
            },
        );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(5)).unwrap();

    let (fired_at, params) = machine
        .interact(&tag, |r: &Recorder| (r.fired_at.clone(), r.params.clone()))
        .unwrap();

    assert_eq!(fired_at, vec![SimTime::from_micros(250)]);
    assert_eq!(params, vec![0x2A]);
}

#[derive(Debug)]
struct PeriodicConfig {
    period: SimTime,
}

impl DeviceConfig for PeriodicConfig {
    type Device = Recorder;

    fn build(
        self,
        builder: DeviceBuilder<'_, Recorder>,
    ) -> Result<Recorder, Box<dyn Error>> {
        builder.schedule_periodic(self.period, |recorder: &mut Recorder, _, event| {
            recorder.fired_at.push(event.now);
        });

        Ok(Recorder::default())
    }
}

#[test]
fn periodic_timer_fires_floor_of_elapsed_over_period() {
    let (builder, tag) = Machine::builder().insert_device(
        "recorder",
        PeriodicConfig {
            period: SimTime::from_millis(1),
        },
    );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_secs(1)).unwrap();

    let fired_at = machine
        .interact(&tag, |r: &Recorder| r.fired_at.clone())
        .unwrap();

    assert_eq!(fired_at.len(), 1_000);
    assert_eq!(fired_at[0], SimTime::from_millis(1));
    assert_eq!(fired_at[999], SimTime::from_secs(1));
}

#[derive(Debug)]
struct TieConfig;

impl DeviceConfig for TieConfig {
    type Device = Recorder;

    fn build(
        self,
        builder: DeviceBuilder<'_, Recorder>,
    ) -> Result<Recorder, Box<dyn Error>> {
        let (builder, first) =
            builder.allocate_timer(|recorder: &mut Recorder, _, _| recorder.order.push("first"));
        let (builder, second) =
            builder.allocate_timer(|recorder: &mut Recorder, _, _| recorder.order.push("second"));

        builder
            .arm_timer(second, SimTime::from_millis(1), None, 0)
            .arm_timer(first, SimTime::from_millis(1), None, 0);

        Ok(Recorder::default())
    }
}

#[test]
fn simultaneous_timers_fire_in_allocation_order() {
    // "second" was armed before "first", but allocation order wins
    let (builder, tag) = Machine::builder().insert_device("recorder", TieConfig);
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(2)).unwrap();

    let order = machine.interact(&tag, |r: &Recorder| r.order.clone()).unwrap();
    assert_eq!(order, vec!["first", "second"]);
}

#[test]
fn rearming_replaces_the_previous_schedule() {
    let (builder, tag) = Machine::builder().insert_device(
        "recorder",
        OneShotConfig {
            delay: SimTime::from_millis(5),
            param: 1,
        },
    );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(1)).unwrap();

    // Pull the firing in to 2 milliseconds with a different param
    let handle = TimerHandle(0);
    machine
        .arm_timer(handle, SimTime::from_millis(1), None, 2)
        .unwrap();

    assert_eq!(
        machine.timer_remaining(handle).unwrap(),
        Some(SimTime::from_millis(1))
    );

    machine.run(SimTime::from_millis(9)).unwrap();

    let (fired_at, params) = machine
        .interact(&tag, |r: &Recorder| (r.fired_at.clone(), r.params.clone()))
        .unwrap();

    assert_eq!(fired_at, vec![SimTime::from_millis(2)]);
    assert_eq!(params, vec![2]);
}

#[test]
fn disarmed_timer_never_fires() {
    let (builder, tag) = Machine::builder().insert_device(
        "recorder",
        OneShotConfig {
            delay: SimTime::from_millis(5),
            param: 1,
        },
    );
    let machine = builder.build().unwrap();

    machine.disarm_timer(TimerHandle(0)).unwrap();
    assert_eq!(machine.timer_remaining(TimerHandle(0)).unwrap(), None);

    machine.run(SimTime::from_millis(10)).unwrap();

    let fired = machine
        .interact(&tag, |r: &Recorder| r.fired_at.len())
        .unwrap();
    assert_eq!(fired, 0);
}

#[test]
fn zero_period_is_rejected() {
    let (builder, _) = Machine::builder().insert_device(
        "recorder",
        OneShotConfig {
            delay: SimTime::from_millis(1),
            param: 0,
        },
    );
    let machine = builder.build().unwrap();

    assert_eq!(
        machine.arm_timer(TimerHandle(0), SimTime::ZERO, Some(SimTime::ZERO), 0),
        Err(TimerError::InvalidPeriod)
    );
}

#[derive(Debug, Default)]
struct Latch {
    value: Option<TimerParam>,
    seen_at: Option<SimTime>,
    lines: Vec<(LineId, LineState)>,
}

impl Device for Latch {
    fn line_changed(&mut self, line: LineId, state: LineState) {
        self.lines.push((line, state));
    }
}

#[derive(Debug)]
struct LatchConfig;

impl DeviceConfig for LatchConfig {
    type Device = Latch;

    fn build(self, _: DeviceBuilder<'_, Latch>) -> Result<Latch, Box<dyn Error>> {
        Ok(Latch::default())
    }
}

#[derive(Debug)]
struct Poker {
    target: DeviceTag,
    sent: bool,
    cycles: u64,
}

impl Device for Poker {}

impl Executable for Poker {
    fn run(&mut self, context: &mut ExecutionContext<'_>) -> u64 {
        if !self.sent {
            self.sent = true;

            context
                .scheduler()
                .synchronize::<Latch>(&self.target, 0x55, |latch, _, event| {
                    latch.value = Some(event.param);
                    latch.seen_at = Some(event.now);
                });

            return 0;
        }

        self.cycles += context.budget();
        context.budget()
    }
}

#[derive(Debug)]
struct PokerConfig {
    target: DeviceTag,
}

impl DeviceConfig for PokerConfig {
    type Device = Poker;

    fn build(self, builder: DeviceBuilder<'_, Poker>) -> Result<Poker, Box<dyn Error>> {
        builder.set_execution(Frequency::from_integer(1_000_000));

        Ok(Poker {
            target: self.target,
            sent: false,
            cycles: 0,
        })
    }
}

#[test]
fn synchronize_delivers_before_anyone_moves_past_the_instant() {
    init_tracing();

    let (builder, latch) = Machine::builder().insert_device("latch", LatchConfig);
    let (builder, _) = builder.insert_device(
        "poker",
        PokerConfig {
            target: latch.clone(),
        },
    );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(1)).unwrap();

    let (value, seen_at) = machine
        .interact(&latch, |l: &Latch| (l.value, l.seen_at))
        .unwrap();

    assert_eq!(value, Some(0x55));
    assert_eq!(seen_at, Some(SimTime::ZERO));
}

#[derive(Debug, Default)]
struct Sleeper {
    cycles: u64,
    napped: bool,
    wake: SimTime,
}

impl Device for Sleeper {}

impl Executable for Sleeper {
    fn run(&mut self, context: &mut ExecutionContext<'_>) -> u64 {
        if !self.napped {
            self.napped = true;
            context.suspend_until(self.wake);
            return 0;
        }

        self.cycles += context.budget();
        context.budget()
    }
}

#[derive(Debug)]
struct SleeperConfig {
    wake: SimTime,
}

impl DeviceConfig for SleeperConfig {
    type Device = Sleeper;

    fn build(self, builder: DeviceBuilder<'_, Sleeper>) -> Result<Sleeper, Box<dyn Error>> {
        builder.set_execution(Frequency::from_integer(1_000_000));

        Ok(Sleeper {
            wake: self.wake,
            ..Sleeper::default()
        })
    }
}

#[test]
fn suspension_passes_time_without_consuming_cycles() {
    let (builder, tag) = Machine::builder()
        .set_quantum(SimTime::from_micros(100))
        .insert_device(
            "sleeper",
            SleeperConfig {
                wake: SimTime::from_micros(300),
            },
        );
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(1)).unwrap();

    let cycles = machine.interact(&tag, |s: &Sleeper| s.cycles).unwrap();

    // 700 microseconds awake at 1 MHz
    assert_eq!(cycles, 700);
}

#[derive(Debug)]
struct Jammed;

impl Device for Jammed {}

impl Executable for Jammed {
    fn run(&mut self, _: &mut ExecutionContext<'_>) -> u64 {
        0
    }
}

#[derive(Debug)]
struct JammedConfig;

impl DeviceConfig for JammedConfig {
    type Device = Jammed;

    fn build(self, builder: DeviceBuilder<'_, Jammed>) -> Result<Jammed, Box<dyn Error>> {
        builder.set_execution(Frequency::from_integer(1_000));

        Ok(Jammed)
    }
}

#[test]
fn zero_progress_without_yielding_is_fatal() {
    init_tracing();

    let (builder, tag) = Machine::builder().insert_device("jammed", JammedConfig);
    let machine = builder.build().unwrap();

    let error = machine.run(SimTime::from_millis(1)).unwrap_err();

    assert!(matches!(
        error,
        ScheduleError::DeviceStalled { tag: ref stalled, .. } if *stalled == tag
    ));
}

#[derive(Debug)]
struct PastSleeper;

impl Device for PastSleeper {}

impl Executable for PastSleeper {
    fn run(&mut self, context: &mut ExecutionContext<'_>) -> u64 {
        // A wake time the device has already passed cannot move it forward
        context.suspend_until(SimTime::ZERO);
        0
    }
}

#[derive(Debug)]
struct PastSleeperConfig;

impl DeviceConfig for PastSleeperConfig {
    type Device = PastSleeper;

    fn build(
        self,
        builder: DeviceBuilder<'_, PastSleeper>,
    ) -> Result<PastSleeper, Box<dyn Error>> {
        builder.set_execution(Frequency::from_integer(1_000));

        Ok(PastSleeper)
    }
}

#[test]
fn suspending_into_the_past_is_fatal() {
    init_tracing();

    let (builder, tag) = Machine::builder().insert_device("sleeper", PastSleeperConfig);
    let machine = builder.build().unwrap();

    let error = machine.run(SimTime::from_millis(1)).unwrap_err();

    assert!(matches!(
        error,
        ScheduleError::DeviceStalled { tag: ref stalled, .. } if *stalled == tag
    ));
}

#[derive(Debug)]
struct Respinner;

impl Device for Respinner {}

impl Executable for Respinner {
    fn run(&mut self, context: &mut ExecutionContext<'_>) -> u64 {
        let tag = context.tag().clone();

        context
            .scheduler()
            .synchronize::<Respinner>(&tag, 0, |_, _, _| {});

        0
    }
}

#[derive(Debug)]
struct RespinnerConfig;

impl DeviceConfig for RespinnerConfig {
    type Device = Respinner;

    fn build(
        self,
        builder: DeviceBuilder<'_, Respinner>,
    ) -> Result<Respinner, Box<dyn Error>> {
        builder.set_execution(Frequency::from_integer(1_000));

        Ok(Respinner)
    }
}

#[test]
fn synchronizing_forever_at_one_instant_is_fatal() {
    init_tracing();

    // Every slice yields a fresh barrier pinned to the same instant, so
    // global time never advances; that must end the run, not spin it
    let (builder, tag) = Machine::builder().insert_device("spinner", RespinnerConfig);
    let machine = builder.build().unwrap();

    let error = machine.run(SimTime::from_millis(1)).unwrap_err();

    assert!(matches!(
        error,
        ScheduleError::DeviceStalled { tag: ref stalled, .. } if *stalled == tag
    ));
}

#[derive(Debug)]
struct Armer {
    handle: TimerHandle,
    armed: bool,
    fired_at: Vec<SimTime>,
}

impl Device for Armer {}

impl Executable for Armer {
    fn run(&mut self, context: &mut ExecutionContext<'_>) -> u64 {
        if !self.armed {
            self.armed = true;

            context
                .scheduler()
                .arm_timer(
                    self.handle,
                    SimTime::from_micros(10),
                    Some(SimTime::from_micros(10)),
                    0,
                )
                .unwrap();
        }

        context.budget()
    }
}

#[derive(Debug)]
struct ArmerConfig;

impl DeviceConfig for ArmerConfig {
    type Device = Armer;

    fn build(self, builder: DeviceBuilder<'_, Armer>) -> Result<Armer, Box<dyn Error>> {
        let builder = builder.set_execution(Frequency::from_integer(1_000_000));
        let (_, handle) = builder.allocate_timer(|armer: &mut Armer, _, event| {
            armer.fired_at.push(event.now);
        });

        Ok(Armer {
            handle,
            armed: false,
            fired_at: Vec::new(),
        })
    }
}

#[test]
fn late_periodic_backlog_collapses_to_one_fire() {
    init_tracing();

    // The timer is armed mid-slice with a 10 microsecond period, so nine
    // periods have already elapsed when the 100 microsecond boundary fires
    // it for the first time
    let (builder, tag) = Machine::builder()
        .set_quantum(SimTime::from_micros(100))
        .insert_device("armer", ArmerConfig);
    let machine = builder.build().unwrap();

    machine.run(SimTime::from_millis(1)).unwrap();

    let fired_at = machine.interact(&tag, |a: &Armer| a.fired_at.clone()).unwrap();

    // One firing for the whole backlog, re-anchored one period past it
    assert_eq!(fired_at[0], SimTime::from_micros(100));
    assert_eq!(fired_at[1], SimTime::from_micros(110));
    assert!(fired_at.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(fired_at.len(), 91);
}

#[test]
fn degenerate_clock_fails_the_build() {
    let (builder, _) = Machine::builder().insert_device(
        "cpu",
        CounterConfig {
            clock: Frequency::new_raw(0, 1),
            budget_cap: None,
        },
    );

    assert!(matches!(
        builder.build(),
        Err(crate::machine::BuildError::ZeroClock { .. })
    ));
}

#[derive(Debug)]
struct WiredConfig {
    target: DeviceTag,
}

impl DeviceConfig for WiredConfig {
    type Device = Recorder;

    fn build(
        self,
        builder: DeviceBuilder<'_, Recorder>,
    ) -> Result<Recorder, Box<dyn Error>> {
        builder.wire_line(0, &self.target, 4);

        Ok(Recorder::default())
    }
}

#[test]
fn line_changes_route_through_the_wiring_table() {
    let (builder, latch) = Machine::builder().insert_device("latch", LatchConfig);
    let (builder, source) = builder.insert_device(
        "source",
        WiredConfig {
            target: latch.clone(),
        },
    );
    let machine = builder.build().unwrap();

    machine.drive_line(&source, 0, LineState::Assert).unwrap();
    machine.drive_line(&source, 0, LineState::Clear).unwrap();

    // An unwired line fans out to nothing
    machine.drive_line(&source, 9, LineState::Assert).unwrap();

    let lines = machine.interact(&latch, |l: &Latch| l.lines.clone()).unwrap();
    assert_eq!(
        lines,
        vec![(4, LineState::Assert), (4, LineState::Clear)]
    );
}
