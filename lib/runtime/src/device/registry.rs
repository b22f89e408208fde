use super::{Device, DeviceHandle, DeviceTag, TypedDeviceHandle};
use rustc_hash::FxBuildHasher;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::Debug,
    sync::RwLock,
};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("no device registered under {0}")]
    NotFound(DeviceTag),
    #[error("device {0} is not of the requested type")]
    WrongType(DeviceTag),
    #[error("device tag {0} is already taken")]
    Duplicate(DeviceTag),
}

#[derive(Debug)]
struct DeviceInfo {
    handle: DeviceHandle,
    type_id: TypeId,
}

/// The store for devices
///
/// Populated during machine configuration, read-mostly afterwards. Devices
/// are never individually removed; they live for the whole session.
#[derive(Debug, Default)]
pub struct DeviceRegistry
// This absolutely has to be thread-safe
where
    Self: Send + Sync,
{
    devices: RwLock<HashMap<DeviceTag, DeviceInfo, FxBuildHasher>>,
}

impl DeviceRegistry {
    pub(crate) fn insert<D: Device>(
        &self,
        tag: DeviceTag,
        device: D,
    ) -> Result<DeviceHandle, RegistryError> {
        let mut devices = self.devices.write().unwrap();

        if devices.contains_key(&tag) {
            return Err(RegistryError::Duplicate(tag));
        }

        let handle = DeviceHandle::new(device);
        devices.insert(
            tag,
            DeviceInfo {
                handle: handle.clone(),
                type_id: TypeId::of::<D>(),
            },
        );

        Ok(handle)
    }

    pub fn handle(&self, tag: &DeviceTag) -> Option<DeviceHandle> {
        self.devices
            .read()
            .unwrap()
            .get(tag)
            .map(|info| info.handle.clone())
    }

    pub fn typed_handle<D: Device>(
        &self,
        tag: &DeviceTag,
    ) -> Result<TypedDeviceHandle<D>, RegistryError> {
        let devices = self.devices.read().unwrap();
        let info = devices
            .get(tag)
            .ok_or_else(|| RegistryError::NotFound(tag.clone()))?;

        if info.type_id != TypeId::of::<D>() {
            return Err(RegistryError::WrongType(tag.clone()));
        }

        Ok(TypedDeviceHandle::new(info.handle.clone()))
    }

    #[inline]
    pub fn interact_dyn<T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&dyn Device) -> T,
    ) -> Result<T, RegistryError> {
        let handle = self
            .handle(tag)
            .ok_or_else(|| RegistryError::NotFound(tag.clone()))?;

        Ok(handle.interact(callback))
    }

    #[inline]
    pub fn interact_dyn_mut<T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&mut dyn Device) -> T,
    ) -> Result<T, RegistryError> {
        let handle = self
            .handle(tag)
            .ok_or_else(|| RegistryError::NotFound(tag.clone()))?;

        Ok(handle.interact_mut(callback))
    }

    #[inline]
    pub fn interact<D: Device, T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&D) -> T,
    ) -> Result<T, RegistryError> {
        self.interact_dyn(tag, |device| {
            let device = (device as &dyn Any)
                .downcast_ref::<D>()
                .ok_or_else(|| RegistryError::WrongType(tag.clone()))?;
            Ok(callback(device))
        })?
    }

    #[inline]
    pub fn interact_mut<D: Device, T>(
        &self,
        tag: &DeviceTag,
        callback: impl FnOnce(&mut D) -> T,
    ) -> Result<T, RegistryError> {
        self.interact_dyn_mut(tag, |device| {
            let device = (device as &mut dyn Any)
                .downcast_mut::<D>()
                .ok_or_else(|| RegistryError::WrongType(tag.clone()))?;
            Ok(callback(device))
        })?
    }

    /// Visit every device in an unspecified order
    pub(crate) fn interact_all(&self, mut callback: impl FnMut(&DeviceTag, &dyn Device)) {
        for (tag, info) in self.devices.read().unwrap().iter() {
            info.handle.interact(|device| callback(tag, device));
        }
    }
}
