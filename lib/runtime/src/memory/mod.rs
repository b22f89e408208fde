use crate::device::DeviceTag;
use rangemap::RangeInclusiveMap;
use serde::{Deserialize, Serialize};
use std::{hash::Hash, ops::RangeInclusive};

pub use address_space::AddressSpace;

mod address_space;
mod read;
mod write;


/// An address in a device address space
pub type Address = usize;

/// Identity of an address space on a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressSpaceId(pub(crate) u16);

impl Hash for AddressSpaceId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u16(self.0);
    }
}

impl nohash::IsEnabled for AddressSpaceId {}

/// Why a region of an access could not be served by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// A device is mapped there but refuses this kind of access
    Denied,
    /// Nothing is mapped there
    Unmapped,
}

/// The regions of a failed access, and what went wrong in each
#[derive(thiserror::Error, Debug)]
#[error("memory access failed: {0:#x?}")]
pub struct AccessError(pub RangeInclusiveMap<Address, AccessFault>);

impl AccessError {
    pub fn denied(address: Address, len: usize) -> Self {
        Self::single(address, len, AccessFault::Denied)
    }

    pub fn unmapped(address: Address, len: usize) -> Self {
        Self::single(address, len, AccessFault::Unmapped)
    }

    fn single(address: Address, len: usize, fault: AccessFault) -> Self {
        let mut map = RangeInclusiveMap::new();
        map.insert(address..=address + len.saturating_sub(1), fault);

        Self(map)
    }
}

/// One mutation of an address space's mapping table
///
/// Banking hardware issues these mid-run; they are queued and committed
/// before the next access so a device never rewrites the table it is being
/// dispatched from.
#[derive(Debug, Clone)]
pub enum MappingCommand {
    Map {
        range: RangeInclusive<Address>,
        device: DeviceTag,
        /// Shadow mappings silently replace whatever they overlap
        shadow: bool,
    },
    Mirror {
        source: RangeInclusive<Address>,
        destination_base: Address,
        shadow: bool,
    },
    Unmap {
        range: RangeInclusive<Address>,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping {range:#x?} overlaps existing occupant at {occupant:#x?}")]
    Overlap {
        range: RangeInclusive<Address>,
        occupant: RangeInclusive<Address>,
    },
    #[error("mapping {0:#x?} does not fit a {1} bit bus")]
    OutOfBus(RangeInclusive<Address>, u8),
}
