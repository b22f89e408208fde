use super::DeviceTag;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Index of a named pin/line on a device
pub type LineId = u32;

/// State of an interrupt or control line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineState {
    Clear,
    Assert,
}

/// Configuration-time routing of device output lines to device input lines
///
/// Replaces direct device-to-device pointers: cyclically wired chips (a
/// protection MCU raising the main CPU's IRQ which in turn strobes the MCU)
/// resolve through the registry at delivery time, so there are no ownership
/// cycles.
#[derive(Debug, Default)]
pub struct WiringTable {
    routes: HashMap<(DeviceTag, LineId), Vec<(DeviceTag, LineId)>, FxBuildHasher>,
}

impl WiringTable {
    pub(crate) fn connect(
        &mut self,
        source: DeviceTag,
        source_line: LineId,
        target: DeviceTag,
        target_line: LineId,
    ) {
        self.routes
            .entry((source, source_line))
            .or_default()
            .push((target, target_line));
    }

    pub fn targets(&self, source: &DeviceTag, source_line: LineId) -> &[(DeviceTag, LineId)] {
        self.routes
            .get(&(source.clone(), source_line))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
