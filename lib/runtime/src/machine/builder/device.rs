use super::{BuildError, MachineBuilder, StagedExecution};
use crate::{
    device::{Device, DeviceTag, Executable, LineId, RegistryError},
    memory::{Address, AddressSpace, AddressSpaceId, MappingCommand},
    scheduler::{SchedulerContext, TimerEvent, TimerHandle, TimerParam, TimerWork},
};
use emucore_time::{Frequency, SimTime};
use std::{any::Any, marker::PhantomData, ops::RangeInclusive, sync::Arc};

/// Configuration access a [crate::device::DeviceConfig] gets while its
/// device is being constructed
///
/// Everything registered here is keyed to the device under construction:
/// timers it owns, ranges it occupies, lines it drives.
pub struct DeviceBuilder<'a, D: Device> {
    machine: &'a mut MachineBuilder,
    tag: DeviceTag,
    _phantom: PhantomData<fn(D)>,
}

impl<'a, D: Device> DeviceBuilder<'a, D> {
    pub(super) fn new(machine: &'a mut MachineBuilder, tag: DeviceTag) -> Self {
        Self {
            machine,
            tag,
            _phantom: PhantomData,
        }
    }

    /// The tag this device will be registered under
    pub fn tag(&self) -> &DeviceTag {
        &self.tag
    }

    /// Put this device on the execution roster at `clock` cycles per second
    pub fn set_execution(self, clock: Frequency) -> Self
    where
        D: Executable,
    {
        if *clock.numer() == 0 || *clock.denom() == 0 {
            let tag = self.tag.clone();
            self.machine.record_error(BuildError::ZeroClock { tag });
            return self;
        }

        self.machine.stage_execution(StagedExecution {
            clock,
            adapter: Arc::new(|device, context| {
                let device: &mut D = (device as &mut dyn Any).downcast_mut().unwrap();

                Executable::run(device, context)
            }),
        });

        self
    }

    /// Allocate a timer owned by this device; arm it here or from any
    /// scheduler context later
    pub fn allocate_timer(
        self,
        mut callback: impl FnMut(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) -> (Self, TimerHandle) {
        let work = TimerWork::Recurring(Box::new(move |device, context, event| {
            let device = (device as &mut dyn Any).downcast_mut().unwrap();

            callback(device, context, event);
        }));

        let handle = self.machine.timers_mut().allocate(self.tag.clone(), work);

        (self, handle)
    }

    /// Arm a timer relative to machine start
    pub fn arm_timer(
        self,
        handle: TimerHandle,
        delay: SimTime,
        period: Option<SimTime>,
        param: TimerParam,
    ) -> Self {
        if let Err(error) =
            self.machine
                .timers_mut()
                .arm(handle, SimTime::ZERO, delay, period, param)
        {
            self.machine.record_error(error.into());
        }

        self
    }

    /// Allocate and arm a timer firing every `period` from machine start
    pub fn schedule_periodic(
        self,
        period: SimTime,
        callback: impl FnMut(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) -> Self {
        let (this, handle) = self.allocate_timer(callback);

        this.arm_timer(handle, period, Some(period), 0)
    }

    /// Allocate and arm a timer firing once, `delay` after machine start
    pub fn schedule_oneshot(
        self,
        delay: SimTime,
        callback: impl FnMut(&mut D, &SchedulerContext<'_>, TimerEvent) + Send + Sync + 'static,
    ) -> Self {
        let (this, handle) = self.allocate_timer(callback);

        this.arm_timer(handle, delay, None, 0)
    }

    fn map(self, space: AddressSpaceId, command: MappingCommand) -> Self {
        let Some(space) = self.machine.address_space(space).cloned() else {
            let tag = self.tag.clone();
            self.machine
                .record_error(BuildError::UnknownAddressSpace { tag, id: space });
            return self;
        };

        if let Err(error) = space.apply(command) {
            self.machine.record_error(error.into());
        }

        self
    }

    /// Map this device over `range`; overlapping an existing occupant is a
    /// configuration error
    pub fn memory_map(self, space: AddressSpaceId, range: RangeInclusive<Address>) -> Self {
        let device = self.tag.clone();

        self.map(
            space,
            MappingCommand::Map {
                range,
                device,
                shadow: false,
            },
        )
    }

    /// Map this device over `range`, replacing whatever it overlaps
    pub fn memory_map_shadow(self, space: AddressSpaceId, range: RangeInclusive<Address>) -> Self {
        let device = self.tag.clone();

        self.map(
            space,
            MappingCommand::Map {
                range,
                device,
                shadow: true,
            },
        )
    }

    /// Echo `source` at `destination_base` within the same space
    pub fn memory_mirror(
        self,
        space: AddressSpaceId,
        source: RangeInclusive<Address>,
        destination_base: Address,
    ) -> Self {
        self.map(
            space,
            MappingCommand::Mirror {
                source,
                destination_base,
                shadow: false,
            },
        )
    }

    /// Route this device's output `line` to `target_line` on `target`
    pub fn wire_line(self, line: LineId, target: &DeviceTag, target_line: LineId) -> Self {
        self.machine
            .wiring_mut()
            .connect(self.tag.clone(), line, target.clone(), target_line);

        self
    }

    pub fn address_space(&self, id: AddressSpaceId) -> Option<Arc<AddressSpace>> {
        self.machine.address_space(id).cloned()
    }

    /// Inspect an already inserted device
    pub fn interact<O: Device, T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&O) -> T,
    ) -> Result<T, RegistryError> {
        self.machine.registry().interact(tag, callback)
    }

    /// Mutate an already inserted device
    pub fn interact_mut<O: Device, T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&mut O) -> T,
    ) -> Result<T, RegistryError> {
        self.machine.registry().interact_mut(tag, callback)
    }
}
