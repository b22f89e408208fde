//! Device scheduling and interconnection core
//!
//! A machine is a set of devices sharing one deterministic timeline: a
//! cooperative scheduler advances every clocked device in bounded slices,
//! timers and synchronize barriers fire at exact instants, and address
//! spaces route memory traffic between devices without any device holding
//! a pointer to another.

pub mod device;
pub mod machine;
pub mod memory;
pub mod persistence;
pub mod scheduler;

pub use emucore_time as time;

pub use device::{Device, DeviceConfig, DeviceTag, Executable, LineId, LineState};
pub use machine::{Machine, MachineBuilder};
pub use memory::{Address, AddressSpace, AddressSpaceId};
pub use scheduler::{Scheduler, TimerEvent, TimerHandle};
