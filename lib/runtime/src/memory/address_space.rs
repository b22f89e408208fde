use super::{Address, AddressSpaceId, MappingCommand, MappingError};
use crate::device::{DeviceRegistry, DeviceTag};
use rangemap::RangeInclusiveMap;
use std::sync::{
    Arc, Mutex, RwLock, RwLockReadGuard,
    atomic::{AtomicBool, Ordering},
};

/// Occupant of a mapped range
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum MapEntry {
    Device {
        tag: DeviceTag,
    },
    /// Echoes accesses into another region of the same space
    Mirror {
        source_base: Address,
        destination_base: Address,
    },
}

/// An addressable bus devices are mapped onto
///
/// Accesses are infallible at this level: faulted regions come back as the
/// unmapped fill on reads and are dropped on writes, matching how real
/// buses float rather than trap. Devices that need the fault see it through
/// their own return values.
#[derive(Debug)]
pub struct AddressSpace {
    pub(super) id: AddressSpaceId,
    width: u8,
    pub(super) width_mask: Address,
    pub(super) unmapped_fill: u8,
    pub(super) registry: Arc<DeviceRegistry>,
    members: RwLock<RangeInclusiveMap<Address, MapEntry>>,
    /// Remap commands queued mid-run, committed before the next access
    queue: Mutex<Vec<MappingCommand>>,
    queue_modified: AtomicBool,
}

impl AddressSpace {
    pub(crate) fn new(
        id: AddressSpaceId,
        width: u8,
        unmapped_fill: u8,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        assert!(
            width >= 1 && width as u32 <= Address::BITS,
            "address bus width out of range"
        );

        let width_mask = if width as u32 == Address::BITS {
            Address::MAX
        } else {
            (1 << width) - 1
        };

        Self {
            id,
            width,
            width_mask,
            unmapped_fill,
            registry,
            members: RwLock::new(RangeInclusiveMap::new()),
            queue: Mutex::new(Vec::new()),
            queue_modified: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn width_mask(&self) -> Address {
        self.width_mask
    }

    /// Apply a mapping command immediately; configuration-time path with
    /// overlap checking
    pub(crate) fn apply(&self, command: MappingCommand) -> Result<(), MappingError> {
        let mut members = self.members.write().unwrap();

        Self::apply_inner(&mut members, self.width, self.width_mask, command)
    }

    fn apply_inner(
        members: &mut RangeInclusiveMap<Address, MapEntry>,
        width: u8,
        width_mask: Address,
        command: MappingCommand,
    ) -> Result<(), MappingError> {
        match command {
            MappingCommand::Map {
                range,
                device,
                shadow,
            } => {
                if *range.end() > width_mask || range.is_empty() {
                    return Err(MappingError::OutOfBus(range, width));
                }

                if !shadow {
                    if let Some((occupant, _)) = members.overlapping(&range).next() {
                        return Err(MappingError::Overlap {
                            range,
                            occupant: occupant.clone(),
                        });
                    }
                }

                members.insert(range, MapEntry::Device { tag: device });
            }
            MappingCommand::Mirror {
                source,
                destination_base,
                shadow,
            } => {
                let length = source.end() - source.start();
                let destination_end = destination_base
                    .checked_add(length)
                    .filter(|end| *end <= width_mask)
                    .ok_or_else(|| {
                        MappingError::OutOfBus(destination_base..=destination_base, width)
                    })?;
                let destination = destination_base..=destination_end;

                if *source.end() > width_mask {
                    return Err(MappingError::OutOfBus(source, width));
                }

                if !shadow {
                    if let Some((occupant, _)) = members.overlapping(&destination).next() {
                        return Err(MappingError::Overlap {
                            range: destination,
                            occupant: occupant.clone(),
                        });
                    }
                }

                members.insert(
                    destination,
                    MapEntry::Mirror {
                        source_base: *source.start(),
                        destination_base,
                    },
                );
            }
            MappingCommand::Unmap { range } => {
                members.remove(range);
            }
        }

        Ok(())
    }

    /// Queue a mapping command to take effect before the next access
    ///
    /// The mid-run path for banking hardware; overlap conflicts resolve as
    /// shadow mappings do, last command wins.
    pub fn remap(&self, command: MappingCommand) {
        self.queue.lock().unwrap().push(command);
        self.queue_modified.store(true, Ordering::Release);
    }

    #[cold]
    fn commit_queue(&self, members: &mut RangeInclusiveMap<Address, MapEntry>) {
        let commands: Vec<_> = self.queue.lock().unwrap().drain(..).collect();

        for command in commands {
            let command_debug = format!("{command:?}");

            // Queued remaps always behave as shadow mappings
            let forced = match command {
                MappingCommand::Map { range, device, .. } => MappingCommand::Map {
                    range,
                    device,
                    shadow: true,
                },
                MappingCommand::Mirror {
                    source,
                    destination_base,
                    ..
                } => MappingCommand::Mirror {
                    source,
                    destination_base,
                    shadow: true,
                },
                unmap => unmap,
            };

            if let Err(error) = Self::apply_inner(members, self.width, self.width_mask, forced) {
                tracing::error!("dropping invalid remap command {command_debug}: {error}");
            }
        }

        self.queue_modified.store(false, Ordering::Release);
    }

    /// Mapping table with any queued remaps committed first
    pub(super) fn members(&self) -> RwLockReadGuard<'_, RangeInclusiveMap<Address, MapEntry>> {
        if self.queue_modified.load(Ordering::Acquire) {
            let mut members = self.members.write().unwrap();
            self.commit_queue(&mut members);
        }

        self.members.read().unwrap()
    }
}
