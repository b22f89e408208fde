use super::{
    AccessError, Address, AddressSpace,
    read::{Segment, collect_segments},
};
use num::traits::ToBytes;

impl AddressSpace {
    /// Put `buffer` onto the bus starting at `address`
    ///
    /// Same masking and wraparound as [Self::read]. Writes into
    /// unserviceable regions are dropped, as a bus with nothing listening
    /// would drop them.
    pub fn write(&self, address: Address, buffer: &[u8]) {
        let mut cursor = address & self.width_mask;
        let mut offset = 0;

        while offset < buffer.len() {
            let span = (self.width_mask - cursor)
                .saturating_add(1)
                .min(buffer.len() - offset);
            self.write_span(cursor, &buffer[offset..offset + span]);

            offset += span;
            cursor = 0;
        }
    }

    fn write_span(&self, start: Address, buffer: &[u8]) {
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
                    let chunk = &buffer[offset..offset + len];
                    let result = self
                        .registry
                        .interact_dyn_mut(&tag, |device| device.write(address, self.id, chunk));

                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => {
                            tracing::debug!("write at {address:#x} refused by {tag}: {error}");
                        }
                        Err(error) => {
                            tracing::error!("write dispatch to {tag} failed: {error}");
                        }
                    }
                }
                Segment::Unmapped { offset, len } => {
                    tracing::trace!(
                        "dropping write on space {:?}: {}",
                        self.id,
                        AccessError::unmapped(start + offset, len),
                    );
                }
            }
        }
    }

    /// Put a little endian value onto the bus
    pub fn write_le_value<T: ToBytes>(&self, address: Address, value: T) {
        self.write(address, value.to_le_bytes().as_ref());
    }

    /// Put a big endian value onto the bus
    pub fn write_be_value<T: ToBytes>(&self, address: Address, value: T) {
        self.write(address, value.to_be_bytes().as_ref());
    }
}
