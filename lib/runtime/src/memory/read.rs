use super::{AccessError, Address, AddressSpace, address_space::MapEntry};
use crate::device::DeviceTag;
use num::traits::FromBytes;
use rangemap::RangeInclusiveMap;
use std::ops::RangeInclusive;

/// A resolved piece of an access, mirror translation already applied
#[derive(Debug)]
pub(super) enum Segment {
    Device {
        tag: DeviceTag,
        address: Address,
        offset: usize,
        len: usize,
    },
    Unmapped {
        offset: usize,
        len: usize,
    },
}

/// Split `range` into device and unmapped segments, resolving mirrors one
/// level deep; `offset` is where the range starts in the caller's buffer
pub(super) fn collect_segments(
    members: &RangeInclusiveMap<Address, MapEntry>,
    range: RangeInclusive<Address>,
    offset: usize,
    depth: u8,
    out: &mut Vec<Segment>,
) {
    let (start, end) = (*range.start(), *range.end());
    let mut at = start;

    for (member_range, entry) in members.overlapping(&range) {
        let segment_start = (*member_range.start()).max(start);
        if at < segment_start {
            out.push(Segment::Unmapped {
                offset: offset + (at - start),
                len: segment_start - at,
            });
        }

        let segment_end = (*member_range.end()).min(end);
        let segment_len = segment_end - segment_start + 1;
        let segment_offset = offset + (segment_start - start);

        match entry {
            MapEntry::Device { tag } => out.push(Segment::Device {
                tag: tag.clone(),
                address: segment_start,
                offset: segment_offset,
                len: segment_len,
            }),
            MapEntry::Mirror {
                source_base,
                destination_base,
            } => {
                if depth == 0 {
                    tracing::warn!(
                        "mirror at {segment_start:#x} resolves to another mirror, \
                         treating as unmapped"
                    );
                    out.push(Segment::Unmapped {
                        offset: segment_offset,
                        len: segment_len,
                    });
                } else {
                    let translated = source_base + (segment_start - destination_base);

                    collect_segments(
                        members,
                        translated..=translated + (segment_len - 1),
                        segment_offset,
                        depth - 1,
                        out,
                    );
                }
            }
        }

        at = match segment_end.checked_add(1) {
            Some(next) => next,
            None => return,
        };
    }

    if at <= end {
        out.push(Segment::Unmapped {
            offset: offset + (at - start),
            len: end - at + 1,
        });
    }
}

impl AddressSpace {
    /// Fill `buffer` from the bus starting at `address`
    ///
    /// The address is masked to the bus width and the access wraps around
    /// the top of the space. Unserviceable regions come back as the
    /// unmapped fill.
    pub fn read(&self, address: Address, buffer: &mut [u8]) {
        let mut cursor = address & self.width_mask;
        let mut offset = 0;

        while offset < buffer.len() {
            let span = (self.width_mask - cursor)
                .saturating_add(1)
                .min(buffer.len() - offset);
            self.read_span(cursor, &mut buffer[offset..offset + span]);

            offset += span;
            cursor = 0;
        }
    }

    fn read_span(&self, start: Address, buffer: &mut [u8]) {
        let end = start + (buffer.len() - 1);

        let mut segments = Vec::new();
        {
            let members = self.members();
            collect_segments(&members, start..=end, 0, 1, &mut segments);
        }

        for segment in segments {
            match segment {
                Segment::Device {
                    tag,
                    address,
                    offset,
                    len,
                } => {
                    let chunk = &mut buffer[offset..offset + len];
                    let result = self
                        .registry
                        .interact_dyn_mut(&tag, |device| device.read(address, self.id, chunk));

                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => {
                            tracing::debug!("read at {address:#x} refused by {tag}: {error}");
                            buffer[offset..offset + len].fill(self.unmapped_fill);
                        }
                        Err(error) => {
                            tracing::error!("read dispatch to {tag} failed: {error}");
                            buffer[offset..offset + len].fill(self.unmapped_fill);
                        }
                    }
                }
                Segment::Unmapped { offset, len } => {
                    tracing::trace!(
                        "read on space {:?} partially unserved: {}",
                        self.id,
                        AccessError::unmapped(start + offset, len),
                    );
                    buffer[offset..offset + len].fill(self.unmapped_fill);
                }
            }
        }
    }

    /// Read a little endian value off the bus
    pub fn read_le_value<T: FromBytes>(&self, address: Address) -> T
    where
        T::Bytes: Default,
    {
        let mut buffer = T::Bytes::default();
        self.read(address, buffer.as_mut());

        T::from_le_bytes(&buffer)
    }

    /// Read a big endian value off the bus
    pub fn read_be_value<T: FromBytes>(&self, address: Address) -> T
    where
        T::Bytes: Default,
    {
        let mut buffer = T::Bytes::default();
        self.read(address, buffer.as_mut());

        T::from_be_bytes(&buffer)
    }
}
