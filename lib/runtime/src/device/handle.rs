use super::Device;
use std::{
    any::{Any, TypeId},
    fmt::Debug,
    marker::PhantomData,
    sync::{Arc, RwLock},
};

/// Type-erased shared handle to a registered device
#[derive(Debug, Clone)]
pub struct DeviceHandle(Arc<RwLock<dyn Device>>);

impl DeviceHandle {
    pub(crate) fn new(device: impl Device) -> Self {
        Self(Arc::new(RwLock::new(device)))
    }

    #[inline]
    pub fn interact<T>(&self, callback: impl FnOnce(&dyn Device) -> T) -> T {
        callback(&*self.0.read().unwrap())
    }

    #[inline]
    pub fn interact_mut<T>(&self, callback: impl FnOnce(&mut dyn Device) -> T) -> T {
        callback(&mut *self.0.write().unwrap())
    }
}

/// [DeviceHandle] with the concrete device type remembered
#[derive(Debug)]
pub struct TypedDeviceHandle<D: Device> {
    inner: DeviceHandle,
    _phantom: PhantomData<fn(D)>,
}

impl<D: Device> Clone for TypedDeviceHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<D: Device> TypedDeviceHandle<D> {
    /// The caller (the registry) has already checked the [TypeId]
    pub(crate) fn new(inner: DeviceHandle) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    #[inline]
    pub fn interact<T>(&self, callback: impl FnOnce(&D) -> T) -> T {
        self.inner.interact(|device| {
            debug_assert_eq!(TypeId::of::<D>(), (device as &dyn Any).type_id());
            let device = (device as &dyn Any).downcast_ref::<D>().unwrap();

            callback(device)
        })
    }

    #[inline]
    pub fn interact_mut<T>(&self, callback: impl FnOnce(&mut D) -> T) -> T {
        self.inner.interact_mut(|device| {
            debug_assert_eq!(TypeId::of::<D>(), (device as &dyn Any).type_id());
            let device = (device as &mut dyn Any).downcast_mut::<D>().unwrap();

            callback(device)
        })
    }

    pub fn erase(&self) -> DeviceHandle {
        self.inner.clone()
    }
}
