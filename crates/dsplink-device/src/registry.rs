//! Every device the host has attached, by id.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info};

use crate::channel::ChannelHandle;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::fault::FaultSeverity;
use crate::format::CodecFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<DeviceId, Arc<Device>>>,
    next_id: AtomicU32,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` under the next free id.
    pub fn add(&self, device: Device) -> DeviceId {
        let mut devices = self.write();
        let mut id = DeviceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        while devices.contains_key(&id) {
            id = DeviceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        }
        info!(%id, device = device.name(), "device registered");
        devices.insert(id, Arc::new(device));
        id
    }

    /// Register `device` under `id`.
    pub fn attach(&self, id: DeviceId, device: Device) -> Result<Arc<Device>> {
        let mut devices = self.write();
        if devices.contains_key(&id) {
            return Err(DeviceError::DuplicateDevice(id));
        }
        let device = Arc::new(device);
        devices.insert(id, device.clone());
        info!(%id, device = device.name(), "device registered");
        Ok(device)
    }

    /// Remove a device and stop its worker.
    pub fn detach(&self, id: DeviceId) -> Option<Arc<Device>> {
        let device = self.write().remove(&id)?;
        device.stop();
        info!(%id, device = device.name(), "device detached");
        Some(device)
    }

    pub fn get(&self, id: DeviceId) -> Result<Arc<Device>> {
        self.read().get(&id).cloned().ok_or(DeviceError::UnknownDevice(id))
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Open a channel on the first device that has one free.
    pub fn open(&self, src: CodecFormat, dst: CodecFormat) -> Result<(DeviceId, ChannelHandle)> {
        let devices: Vec<(DeviceId, Arc<Device>)> =
            self.read().iter().map(|(id, d)| (*id, d.clone())).collect();

        let mut worst: Option<DeviceError> = None;
        for (id, device) in devices {
            match device.open(src, dst) {
                Ok(handle) => return Ok((id, handle)),
                Err(err @ DeviceError::UnsupportedConversion { .. }) => return Err(err),
                Err(err) => {
                    debug!(%id, error = %err, "device cannot take channel");
                    if worst.as_ref().is_none_or(|w| open_error_rank(&err) > open_error_rank(w)) {
                        worst = Some(err);
                    }
                }
            }
        }
        Err(worst.unwrap_or(DeviceError::NoFreeChannel { src, dst }))
    }

    /// Stop every device worker.
    pub fn shutdown(&self) {
        for device in self.read().values() {
            device.stop();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<DeviceId, Arc<Device>>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<DeviceId, Arc<Device>>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.ids())
            .finish()
    }
}

/// Which failure `open` reports when no device could take the channel.
/// `NoFreeChannel` only wins when every device was merely full.
fn open_error_rank(err: &DeviceError) -> u8 {
    match err {
        DeviceError::NoFreeChannel { .. } => 0,
        DeviceError::DeviceFault(FaultSeverity::Fatal) => 3,
        DeviceError::DeviceFault(_)
        | DeviceError::CommandTimeout { .. }
        | DeviceError::Allocation { .. } => 2,
        _ => 1,
    }
}
