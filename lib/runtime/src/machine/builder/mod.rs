use super::Machine;
use crate::{
    device::{Device, DeviceConfig, DeviceRegistry, DeviceTag, RegistryError, WiringTable},
    memory::{AddressSpace, AddressSpaceId, MappingError},
    scheduler::{ExecEntry, ExecutionContext, Scheduler, TimerError, TimerQueue},
};
use emucore_time::{Frequency, SimTime};
use nohash::BuildNoHashHasher;
use std::{collections::HashMap, error::Error, sync::Arc};

pub use device::DeviceBuilder;

mod device;

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("device {tag} was given a degenerate clock")]
    ZeroClock { tag: DeviceTag },
    #[error("device {tag} referenced unknown address space {id:?}")]
    UnknownAddressSpace { tag: DeviceTag, id: AddressSpaceId },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error("device {tag} failed to construct")]
    Device {
        tag: DeviceTag,
        #[source]
        source: Box<dyn Error>,
    },
}

/// Pending [crate::device::Executable] registration for the device being
/// configured
pub(super) struct StagedExecution {
    pub clock: Frequency,
    #[allow(clippy::type_complexity)]
    pub adapter: Arc<dyn Fn(&mut dyn Device, &mut ExecutionContext<'_>) -> u64 + Send + Sync>,
}

/// Assembles a [Machine] from device configs
///
/// Errors during assembly are collected rather than returned at each call,
/// so configuration code stays a linear chain; [Self::build] reports the
/// first one.
pub struct MachineBuilder {
    registry: Arc<DeviceRegistry>,
    timers: TimerQueue,
    exec_entries: Vec<ExecEntry>,
    wiring: WiringTable,
    quantum: SimTime,
    address_spaces: HashMap<AddressSpaceId, Arc<AddressSpace>, BuildNoHashHasher<AddressSpaceId>>,
    next_space: u16,
    staged_execution: Option<StagedExecution>,
    errors: Vec<BuildError>,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::default()),
            timers: TimerQueue::default(),
            exec_entries: Vec::new(),
            wiring: WiringTable::default(),
            quantum: SimTime::from_micros(100),
            address_spaces: HashMap::default(),
            next_space: 0,
            staged_execution: None,
            errors: Vec::new(),
        }
    }

    /// Upper bound on how far any device may run ahead of the rest
    pub fn set_quantum(mut self, quantum: SimTime) -> Self {
        assert!(
            !quantum.is_zero() && !quantum.is_never(),
            "the quantum must be a positive finite time"
        );

        self.quantum = quantum;
        self
    }

    /// Create an addressable bus of `width` bits; unmapped reads come back
    /// as `unmapped_fill`
    pub fn create_address_space(mut self, width: u8, unmapped_fill: u8) -> (Self, AddressSpaceId) {
        let id = AddressSpaceId(self.next_space);
        self.next_space += 1;

        let space = Arc::new(AddressSpace::new(
            id,
            width,
            unmapped_fill,
            self.registry.clone(),
        ));
        self.address_spaces.insert(id, space);

        (self, id)
    }

    /// Construct a device from its config and register it under `name`
    ///
    /// Devices execute in insertion order within a scheduling step, so the
    /// order of these calls is part of the machine's deterministic layout.
    pub fn insert_device<C: DeviceConfig>(mut self, name: &str, config: C) -> (Self, DeviceTag) {
        let tag = DeviceTag::new(name);

        self.staged_execution = None;

        let builder = DeviceBuilder::new(&mut self, tag.clone());
        let device = match config.build(builder) {
            Ok(device) => device,
            Err(source) => {
                self.errors.push(BuildError::Device {
                    tag: tag.clone(),
                    source,
                });
                return (self, tag);
            }
        };

        let handle = match self.registry.insert(tag.clone(), device) {
            Ok(handle) => handle,
            Err(error) => {
                self.errors.push(error.into());
                return (self, tag);
            }
        };

        if let Some(staged) = self.staged_execution.take() {
            self.exec_entries.push(ExecEntry {
                tag: tag.clone(),
                handle,
                clock: staged.clock,
                local_time: SimTime::ZERO,
                suspended_until: None,
                stall_polls: 0,
                adapter: staged.adapter,
            });
        }

        (self, tag)
    }

    pub fn build(mut self) -> Result<Arc<Machine>, BuildError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        let scheduler = Scheduler::new(
            self.registry.clone(),
            self.timers,
            self.exec_entries,
            self.wiring,
            self.quantum,
        );

        Ok(Arc::new(Machine {
            scheduler,
            registry: self.registry,
            address_spaces: self.address_spaces,
        }))
    }

    pub(super) fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub(super) fn address_space(&self, id: AddressSpaceId) -> Option<&Arc<AddressSpace>> {
        self.address_spaces.get(&id)
    }

    pub(super) fn timers_mut(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    pub(super) fn wiring_mut(&mut self) -> &mut WiringTable {
        &mut self.wiring
    }

    pub(super) fn stage_execution(&mut self, staged: StagedExecution) {
        self.staged_execution = Some(staged);
    }

    pub(super) fn record_error(&mut self, error: BuildError) {
        self.errors.push(error);
    }
}
