// SPDX-License-Identifier: GPL-2.0 OR MIT

//! Generic devices.

use crate::sync::Arc;

/// A raw device, as seen by the printing macros.
pub trait RawDevice {
    /// Returns the name of the device.
    fn name(&self) -> &str;
}

impl<T: RawDevice + ?Sized> RawDevice for &T {
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: RawDevice + ?Sized> RawDevice for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// A reference-counted device.
#[derive(Clone, Debug)]
pub struct Device(Arc<DeviceInner>);

#[derive(Debug)]
struct DeviceInner {
    name: String,
}

impl Device {
    /// Creates a new device with the given name.
    pub fn new(name: &str) -> Device {
        Device(Arc::new(DeviceInner {
            name: name.to_owned(),
        }))
    }
}

impl RawDevice for Device {
    fn name(&self) -> &str {
        &self.0.name
    }
}
