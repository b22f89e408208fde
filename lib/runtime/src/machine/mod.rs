use crate::{
    device::{Device, DeviceRegistry, DeviceTag, LineId, LineState, RegistryError},
    memory::{AddressSpace, AddressSpaceId, MappingCommand},
    persistence::SnapshotError,
    scheduler::{
        ScheduleError, Scheduler, SchedulerContext, TimerError, TimerEvent, TimerHandle, TimerParam,
    },
};
use emucore_time::SimTime;
use nohash::BuildNoHashHasher;
use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::Arc,
};

pub use builder::{BuildError, DeviceBuilder, MachineBuilder};

pub mod builder;

/// An assembled set of devices sharing a timeline and buses
///
/// Construction goes through [MachineBuilder]; the device set, wiring and
/// execution roster are fixed once built, only mappings and timers change
/// at run time.
#[derive(Debug)]
pub struct Machine {
    pub(crate) scheduler: Scheduler,
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) address_spaces: HashMap<AddressSpaceId, Arc<AddressSpace>, BuildNoHashHasher<AddressSpaceId>>,
}

impl Machine {
    pub fn builder() -> MachineBuilder {
        MachineBuilder::new()
    }

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Advance the whole machine by `allotted` of simulation time
    pub fn run(&self, allotted: SimTime) -> Result<(), ScheduleError> {
        self.scheduler.run(allotted)
    }

    pub fn run_until(&self, target: SimTime) -> Result<(), ScheduleError> {
        self.scheduler.run_until(target)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn address_space(&self, id: AddressSpaceId) -> Option<&Arc<AddressSpace>> {
        self.address_spaces.get(&id)
    }

    /// Queue a mapping change on an address space, committed before its
    /// next access
    pub fn remap_address_space(&self, id: AddressSpaceId, command: MappingCommand) {
        if let Some(space) = self.address_spaces.get(&id) {
            space.remap(command);
        } else {
            tracing::error!("remap against unknown address space {id:?}");
        }
    }

    pub fn interact<D: Device, T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&D) -> T,
    ) -> Result<T, RegistryError> {
        self.registry.interact(tag, callback)
    }

    pub fn interact_mut<D: Device, T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&mut D) -> T,
    ) -> Result<T, RegistryError> {
        self.registry.interact_mut(tag, callback)
    }

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

    pub fn synchronize<D: Device>(
        &self,
        owner: &DeviceTag,
        param: TimerParam,
        callback: impl FnOnce(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) {
        self.scheduler.synchronize(owner, param, callback)
    }

    pub fn allocate_timer<D: Device>(
        &self,
        owner: &DeviceTag,
        callback: impl FnMut(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) -> TimerHandle {
        self.scheduler.allocate_timer(owner, callback)
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

    /// Serialize the whole machine state to `writer`
    pub fn store_snapshot(&self, writer: &mut dyn Write) -> Result<(), SnapshotError> {
        crate::persistence::store_snapshot(self, writer)
    }

    /// Restore machine state from `reader`
    ///
    /// The machine must have been built from the same configuration the
    /// snapshot was taken on.
    pub fn load_snapshot(&self, reader: &mut dyn Read) -> Result<(), SnapshotError> {
        crate::persistence::load_snapshot(self, reader)
    }
}
