//! Hardware query interface consumed by the collector.
//!
//! [`DeviceQuery`] enumerates devices and hands out per-index handles;
//! [`DeviceHandle`] reads individual telemetry fields. Every read is a
//! separate fallible call so that one unsupported field does not hide the
//! others.

use std::fmt;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::error::DeviceError;

/// Stable identity of a device, used as the label key for its metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub minor_number: u32,
    pub uuid: String,
    pub name: String,
}

/// Memory usage in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
}

/// Device memory held by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessUsage {
    pub pid: u32,
    /// Bytes of device memory; 0 when the driver does not report it.
    pub used_memory: u64,
}

/// Kind of workload a process runs on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessCategory {
    Compute,
    Graphics,
    MpsCompute,
}

impl ProcessCategory {
    pub const ALL: [ProcessCategory; 3] = [
        ProcessCategory::Compute,
        ProcessCategory::Graphics,
        ProcessCategory::MpsCompute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessCategory::Compute => "compute",
            ProcessCategory::Graphics => "graphics",
            ProcessCategory::MpsCompute => "mps_compute",
        }
    }
}

impl fmt::Display for ProcessCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handle to a single device, valid for the lifetime of its query.
pub trait DeviceHandle {
    fn name(&self) -> Result<String, DeviceError>;

    fn minor_number(&self) -> Result<u32, DeviceError>;

    fn uuid(&self) -> Result<String, DeviceError>;

    fn memory_info(&self) -> Result<MemoryUsage, DeviceError>;

    /// GPU utilization percent (0-100) over the last sample period.
    fn utilization(&self) -> Result<u32, DeviceError>;

    /// Power draw in milliwatts.
    fn power_usage(&self) -> Result<u32, DeviceError>;

    /// GPU core temperature in degrees Celsius.
    fn temperature(&self) -> Result<u32, DeviceError>;

    /// Fan speed as a percent of maximum.
    fn fan_speed(&self) -> Result<u32, DeviceError>;

    fn running_processes(
        &self,
        category: ProcessCategory,
    ) -> Result<Vec<ProcessUsage>, DeviceError>;

    /// Read the identity tuple in one go.
    fn identity(&self) -> Result<DeviceIdentity, DeviceError> {
        Ok(DeviceIdentity {
            minor_number: self.minor_number()?,
            uuid: self.uuid()?,
            name: self.name()?,
        })
    }
}

/// Capability interface over the device library.
pub trait DeviceQuery: Send {
    type Handle<'a>: DeviceHandle
    where
        Self: 'a;

    /// Initialize the library. Calling it again after success is a no-op.
    fn init(&mut self) -> Result<(), DeviceError>;

    fn device_count(&self) -> Result<u32, DeviceError>;

    fn device_by_index(&self, index: u32) -> Result<Self::Handle<'_>, DeviceError>;
}

/// Resolves process IDs to human-readable names.
pub trait ProcessNames: Send {
    fn resolve(&mut self, pid: u32) -> Option<String>;
}

/// [`ProcessNames`] backed by the operating system's process table.
pub struct SystemProcessNames {
    system: System,
}

impl SystemProcessNames {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProcessNames {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNames for SystemProcessNames {
    fn resolve(&mut self, pid: u32) -> Option<String> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );

        self.system
            .process(pid)
            .map(|process| process.name().to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
    }
}
