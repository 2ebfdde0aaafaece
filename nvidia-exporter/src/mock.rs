//! In-memory device backend for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::{
    DeviceHandle, DeviceQuery, MemoryUsage, ProcessCategory, ProcessNames, ProcessUsage,
};
use crate::error::DeviceError;

/// Scripted responses for one device. Each field is returned as-is by the
/// matching [`DeviceHandle`] read.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub minor_number: Result<u32, DeviceError>,
    pub uuid: Result<String, DeviceError>,
    pub name: Result<String, DeviceError>,
    pub memory: Result<MemoryUsage, DeviceError>,
    pub utilization: Result<u32, DeviceError>,
    pub power_usage: Result<u32, DeviceError>,
    pub temperature: Result<u32, DeviceError>,
    pub fan_speed: Result<u32, DeviceError>,
    /// Missing categories report no running processes.
    pub processes: HashMap<ProcessCategory, Result<Vec<ProcessUsage>, DeviceError>>,
}

impl MockDevice {
    /// A device with the given identity and zeroed readings.
    pub fn new(minor_number: u32, uuid: &str, name: &str) -> Self {
        Self {
            minor_number: Ok(minor_number),
            uuid: Ok(uuid.to_string()),
            name: Ok(name.to_string()),
            memory: Ok(MemoryUsage::default()),
            utilization: Ok(0),
            power_usage: Ok(0),
            temperature: Ok(0),
            fan_speed: Ok(0),
            processes: HashMap::new(),
        }
    }

    pub fn with_memory(mut self, memory: MemoryUsage) -> Self {
        self.memory = Ok(memory);
        self
    }

    pub fn with_utilization(mut self, percent: u32) -> Self {
        self.utilization = Ok(percent);
        self
    }

    pub fn with_power_usage(mut self, milliwatts: u32) -> Self {
        self.power_usage = Ok(milliwatts);
        self
    }

    pub fn with_temperature(mut self, celsius: u32) -> Self {
        self.temperature = Ok(celsius);
        self
    }

    pub fn with_fan_speed(mut self, percent: u32) -> Self {
        self.fan_speed = Ok(percent);
        self
    }

    pub fn with_processes(mut self, category: ProcessCategory, processes: Vec<ProcessUsage>) -> Self {
        self.processes.insert(category, Ok(processes));
        self
    }

    pub fn fail_processes(&mut self, category: ProcessCategory, error: DeviceError) {
        self.processes.insert(category, Err(error));
    }
}

impl DeviceHandle for MockDevice {
    fn name(&self) -> Result<String, DeviceError> {
        self.name.clone()
    }

    fn minor_number(&self) -> Result<u32, DeviceError> {
        self.minor_number.clone()
    }

    fn uuid(&self) -> Result<String, DeviceError> {
        self.uuid.clone()
    }

    fn memory_info(&self) -> Result<MemoryUsage, DeviceError> {
        self.memory.clone()
    }

    fn utilization(&self) -> Result<u32, DeviceError> {
        self.utilization.clone()
    }

    fn power_usage(&self) -> Result<u32, DeviceError> {
        self.power_usage.clone()
    }

    fn temperature(&self) -> Result<u32, DeviceError> {
        self.temperature.clone()
    }

    fn fan_speed(&self) -> Result<u32, DeviceError> {
        self.fan_speed.clone()
    }

    fn running_processes(
        &self,
        category: ProcessCategory,
    ) -> Result<Vec<ProcessUsage>, DeviceError> {
        self.processes
            .get(&category)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    initialized: bool,
    init_error: Option<DeviceError>,
    count_error: Option<DeviceError>,
    delay: Option<Duration>,
    panic_on_count: bool,
    init_calls: usize,
}

/// Shared, scriptable [`DeviceQuery`]. Clones observe and control the same
/// state, so a test can keep one clone while the collector owns another.
#[derive(Debug, Clone, Default)]
pub struct MockDeviceQuery {
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceQuery {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                devices,
                ..Default::default()
            })),
        }
    }

    /// Replace all devices.
    pub fn set_devices(&self, devices: Vec<MockDevice>) {
        self.state.lock().devices = devices;
    }

    /// Modify the device at `index` in place.
    pub fn update<F>(&self, index: usize, f: F)
    where
        F: FnOnce(&mut MockDevice),
    {
        if let Some(device) = self.state.lock().devices.get_mut(index) {
            f(device);
        }
    }

    /// Make `init()` fail with `error` until cleared with `None`.
    pub fn fail_init(&self, error: Option<DeviceError>) {
        self.state.lock().init_error = error;
    }

    /// Make `device_count()` fail with `error` until cleared with `None`.
    pub fn fail_device_count(&self, error: Option<DeviceError>) {
        self.state.lock().count_error = error;
    }

    /// Block every `init()` call for `delay`, simulating a hung driver.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Make `device_count()` panic, simulating a crash inside the driver.
    pub fn set_panic(&self, panic: bool) {
        self.state.lock().panic_on_count = panic;
    }

    /// Number of times `init()` has been called.
    pub fn init_calls(&self) -> usize {
        self.state.lock().init_calls
    }
}

impl DeviceQuery for MockDeviceQuery {
    type Handle<'a> = MockDevice;

    fn init(&mut self) -> Result<(), DeviceError> {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        state.init_calls += 1;
        if let Some(error) = state.init_error.clone() {
            return Err(error);
        }
        state.initialized = true;
        Ok(())
    }

    fn device_count(&self) -> Result<u32, DeviceError> {
        let state = self.state.lock();
        if state.panic_on_count {
            panic!("simulated driver crash");
        }
        if !state.initialized {
            return Err(DeviceError::NotInitialized);
        }
        if let Some(error) = state.count_error.clone() {
            return Err(error);
        }
        Ok(state.devices.len() as u32)
    }

    fn device_by_index(&self, index: u32) -> Result<MockDevice, DeviceError> {
        self.state
            .lock()
            .devices
            .get(index as usize)
            .cloned()
            .ok_or(DeviceError::NotFound(index))
    }
}

/// [`ProcessNames`] from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticProcessNames {
    names: HashMap<u32, String>,
}

impl StaticProcessNames {
    pub fn with(mut self, pid: u32, name: &str) -> Self {
        self.names.insert(pid, name.to_string());
        self
    }
}

impl ProcessNames for StaticProcessNames {
    fn resolve(&mut self, pid: u32) -> Option<String> {
        self.names.get(&pid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_init() {
        let mut query = MockDeviceQuery::new(vec![MockDevice::new(0, "GPU-0", "Mock")]);
        assert_eq!(query.device_count(), Err(DeviceError::NotInitialized));

        query.init().unwrap();
        query.init().unwrap();
        assert_eq!(query.device_count(), Ok(1));
        assert_eq!(query.init_calls(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let mut query = MockDeviceQuery::new(Vec::new());
        let control = query.clone();
        query.init().unwrap();

        control.set_devices(vec![
            MockDevice::new(0, "GPU-0", "Mock"),
            MockDevice::new(1, "GPU-1", "Mock"),
        ]);
        assert_eq!(query.device_count(), Ok(2));
        assert!(matches!(
            query.device_by_index(2),
            Err(DeviceError::NotFound(2))
        ));
    }

    #[test]
    fn test_identity_read() {
        let device = MockDevice::new(3, "GPU-xyz", "Mock");
        let identity = device.identity().unwrap();
        assert_eq!(identity.minor_number, 3);
        assert_eq!(identity.uuid, "GPU-xyz");
        assert_eq!(identity.name, "Mock");
    }
}
