//! Whole-machine state persistence
//!
//! Snapshots are positional against the machine configuration: the device
//! set, insertion order and timer allocation order must match between the
//! storing and loading machine. Device internals travel as opaque versioned
//! payloads produced by [crate::device::Device::store_state].

use crate::{
    device::DeviceTag,
    machine::Machine,
    scheduler::TimerSlotState,
};
use emucore_time::SimTime;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};


#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    /// A synchronize barrier holds a callback that cannot be serialized;
    /// run the machine forward until it fires, then snapshot
    #[error("a synchronize barrier is pending, snapshot at a settled instant")]
    PendingSynchronize,
    #[error("snapshot does not match this machine: {0}")]
    LayoutMismatch(String),
    #[error("device {tag} rejected its snapshot payload")]
    DevicePayload {
        tag: DeviceTag,
        #[source]
        source: Box<dyn std::error::Error>,
    },
    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct ExecSnapshot {
    tag: DeviceTag,
    local_time: SimTime,
    suspended_until: Option<SimTime>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DevicePayload {
    tag: DeviceTag,
    version: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MachineSnapshot {
    now: SimTime,
    timers: Vec<TimerSlotState>,
    devices: Vec<ExecSnapshot>,
    payloads: Vec<DevicePayload>,
}

pub(crate) fn store_snapshot(
    machine: &Machine,
    writer: &mut dyn Write,
) -> Result<(), SnapshotError> {
    let scheduler = &machine.scheduler;

    let timers = {
        let timers = scheduler.timers.lock().unwrap();

        if timers.transient_pending() {
            return Err(SnapshotError::PendingSynchronize);
        }

        timers.export_state()
    };

    let (now, devices) = {
        let state = scheduler.state.lock().unwrap();

        let devices = state
            .entries
            .iter()
            .map(|entry| ExecSnapshot {
                tag: entry.tag.clone(),
                local_time: entry.local_time,
                suspended_until: entry.suspended_until,
            })
            .collect();

        (state.now, devices)
    };

    let mut payloads = Vec::new();
    let mut failure = None;
    machine.registry.interact_all(|tag, device| {
        if failure.is_some() {
            return;
        }

        let Some(version) = device.state_version() else {
            return;
        };

        let mut bytes = Vec::new();
        match device.store_state(&mut bytes) {
            Ok(()) => payloads.push(DevicePayload {
                tag: tag.clone(),
                version,
                bytes,
            }),
            Err(source) => {
                failure = Some(SnapshotError::DevicePayload {
                    tag: tag.clone(),
                    source,
                });
            }
        }
    });

    if let Some(failure) = failure {
        return Err(failure);
    }

    // Registry iteration order is unspecified, pin it down
    payloads.sort_by(|a, b| a.tag.cmp(&b.tag));

    let snapshot = MachineSnapshot {
        now,
        timers,
        devices,
        payloads,
    };

    rmp_serde::encode::write(writer, &snapshot)?;

    Ok(())
}

pub(crate) fn load_snapshot(
    machine: &Machine,
    reader: &mut dyn Read,
) -> Result<(), SnapshotError> {
    let snapshot: MachineSnapshot = rmp_serde::decode::from_read(reader)?;
    let scheduler = &machine.scheduler;

    {
        let mut state = scheduler.state.lock().unwrap();

        if state.entries.len() != snapshot.devices.len() {
            return Err(SnapshotError::LayoutMismatch(format!(
                "snapshot has {} executable devices, machine has {}",
                snapshot.devices.len(),
                state.entries.len()
            )));
        }

        for (entry, saved) in state.entries.iter().zip(&snapshot.devices) {
            if entry.tag != saved.tag {
                return Err(SnapshotError::LayoutMismatch(format!(
                    "execution roster mismatch, expected {}, snapshot has {}",
                    entry.tag, saved.tag
                )));
            }
        }

        scheduler
            .timers
            .lock()
            .unwrap()
            .restore_state(&snapshot.timers)
            .map_err(SnapshotError::LayoutMismatch)?;

        state.now = snapshot.now;
        for (entry, saved) in state.entries.iter_mut().zip(&snapshot.devices) {
            entry.local_time = saved.local_time;
            entry.suspended_until = saved.suspended_until;
            entry.stall_polls = 0;
        }
    }

    for payload in &snapshot.payloads {
        machine
            .registry
            .interact_dyn_mut(&payload.tag, |device| {
                device.load_state(payload.version, &mut payload.bytes.as_slice())
            })
            .map_err(|_| {
                SnapshotError::LayoutMismatch(format!(
                    "snapshot payload for unknown device {}",
                    payload.tag
                ))
            })?
            .map_err(|source| SnapshotError::DevicePayload {
                tag: payload.tag.clone(),
                source,
            })?;
    }

    Ok(())
}
