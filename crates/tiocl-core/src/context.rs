use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::handle::DeviceHandle;

/// A fixed set of devices that objects are shared between.
pub struct Context {
    devices: Vec<(DeviceHandle, Arc<dyn Device>)>,
}

impl Context {
    pub(crate) fn new(devices: Vec<(DeviceHandle, Arc<dyn Device>)>) -> Self {
        Self { devices }
    }

    pub fn device_handles(&self) -> Vec<DeviceHandle> {
        self.devices.iter().map(|(h, _)| *h).collect()
    }

    pub(crate) fn devices(&self) -> &[(DeviceHandle, Arc<dyn Device>)] {
        &self.devices
    }

    pub(crate) fn device(&self, handle: DeviceHandle) -> Option<Arc<dyn Device>> {
        self.devices
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, d)| Arc::clone(d))
    }

    pub fn contains(&self, handle: DeviceHandle) -> bool {
        self.devices.iter().any(|(h, _)| *h == handle)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.device_handles())
            .finish()
    }
}
