use crate::{
    memory::{AccessError, Address, AddressSpaceId},
    scheduler::ExecutionContext,
};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    error::Error,
    fmt::{Debug, Display},
    io::{Read, Write},
};

pub use handle::*;
pub use registry::*;
pub use wiring::*;

mod handle;
pub mod registry;
mod wiring;

/// Version stamp a device puts on its serialized state
pub type DeviceVersion = u64;

/// Unique identifier a device is registered and wired up under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceTag(String);

impl DeviceTag {
    pub const SEPARATOR: char = ':';

    pub fn new(name: &str) -> Self {
        assert!(
            !name.is_empty() && !name.contains(Self::SEPARATOR),
            "This function requires a plain device name"
        );

        Self(name.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[allow(unused)]
/// Basic supertrait for everything living in a machine
///
/// Every hook has a do-nothing default so passive devices only implement
/// what they react to. Execution is the separate [Executable] capability,
/// registered per device at configuration time.
pub trait Device: Debug + Any + Send + Sync {
    /// Version stamp for [Self::store_state], `None` means the device is
    /// stateless as far as snapshots are concerned
    fn state_version(&self) -> Option<DeviceVersion> {
        None
    }

    /// Serialize device-internal state into a snapshot payload
    fn store_state(&self, writer: &mut dyn Write) -> Result<(), Box<dyn Error>> {
        Ok(())
    }

    /// Restore device-internal state from a snapshot payload
    fn load_state(
        &mut self,
        version: DeviceVersion,
        reader: &mut dyn Read,
    ) -> Result<(), Box<dyn Error>> {
        Ok(())
    }

    /// Memory-mapped read against this device
    ///
    /// `address` is the absolute in-space address, mirror-translated to the
    /// range the device was originally mapped at
    fn read(
        &mut self,
        address: Address,
        address_space: AddressSpaceId,
        buffer: &mut [u8],
    ) -> Result<(), AccessError> {
        Err(AccessError::denied(address, buffer.len()))
    }

    /// Memory-mapped write against this device
    fn write(
        &mut self,
        address: Address,
        address_space: AddressSpaceId,
        buffer: &[u8],
    ) -> Result<(), AccessError> {
        Err(AccessError::denied(address, buffer.len()))
    }

    /// An interrupt or control line wired into this device changed state
    fn line_changed(&mut self, line: LineId, state: LineState) {}
}

/// The execution capability: a device that consumes clock cycles
pub trait Executable: Device {
    /// Consume up to `context.budget()` local clock cycles and report how
    /// many were actually consumed
    ///
    /// Consuming fewer than the budget is fine; the scheduler re-polls.
    /// Reporting zero progress without yielding or suspending is a device
    /// bug and will fail the run.
    fn run(&mut self, context: &mut ExecutionContext<'_>) -> u64;
}

#[allow(unused)]
/// Factory config to construct a device
pub trait DeviceConfig: Debug + Sized {
    /// The device that this config will create
    type Device: Device;

    /// Make a new device from the config, wiring its capabilities through
    /// the builder
    fn build(
        self,
        builder: crate::machine::builder::DeviceBuilder<'_, Self::Device>,
    ) -> Result<Self::Device, Box<dyn Error>>;
}
