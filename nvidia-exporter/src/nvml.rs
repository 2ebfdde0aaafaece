//! NVML (NVIDIA Management Library) backend.

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::struct_wrappers::device::ProcessInfo;
use nvml_wrapper::{Device, Nvml};
use tracing::{info, warn};

use crate::device::{DeviceHandle, DeviceQuery, MemoryUsage, ProcessCategory, ProcessUsage};
use crate::error::DeviceError;

/// [`DeviceQuery`] backed by the NVIDIA driver.
#[derive(Default)]
pub struct NvmlQuery {
    nvml: Option<Nvml>,
}

impl NvmlQuery {
    /// Create an uninitialized query. Call [`DeviceQuery::init`] before use.
    pub fn new() -> Self {
        Self::default()
    }

    fn nvml(&self) -> Result<&Nvml, DeviceError> {
        self.nvml.as_ref().ok_or(DeviceError::NotInitialized)
    }
}

/// `Nvml::init` with an explicit `libnvidia-ml.so.1` fallback on Linux, where
/// distributions often ship only the versioned soname.
fn init_nvml() -> Result<Nvml, NvmlError> {
    #[cfg(not(target_os = "linux"))]
    {
        Nvml::init()
    }
    #[cfg(target_os = "linux")]
    {
        match Nvml::init() {
            Ok(nvml) => Ok(nvml),
            Err(e) => {
                warn!(error = %e, "NVML init failed, retrying with libnvidia-ml.so.1");
                Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
            }
        }
    }
}

impl DeviceQuery for NvmlQuery {
    type Handle<'a> = NvmlDevice<'a>;

    fn init(&mut self) -> Result<(), DeviceError> {
        if self.nvml.is_some() {
            return Ok(());
        }

        let nvml = init_nvml().map_err(|e| DeviceError::Init(e.to_string()))?;
        info!(
            driver = %nvml.sys_driver_version().unwrap_or_default(),
            nvml = %nvml.sys_nvml_version().unwrap_or_default(),
            "NVML initialized"
        );
        self.nvml = Some(nvml);
        Ok(())
    }

    fn device_count(&self) -> Result<u32, DeviceError> {
        Ok(self.nvml()?.device_count()?)
    }

    fn device_by_index(&self, index: u32) -> Result<NvmlDevice<'_>, DeviceError> {
        let device = self.nvml()?.device_by_index(index).map_err(|e| match e {
            NvmlError::InvalidArg => DeviceError::NotFound(index),
            other => other.into(),
        })?;
        Ok(NvmlDevice { device })
    }
}

/// A single NVML device handle.
pub struct NvmlDevice<'nvml> {
    device: Device<'nvml>,
}

fn used_bytes(memory: UsedGpuMemory) -> u64 {
    match memory {
        UsedGpuMemory::Used(bytes) => bytes,
        UsedGpuMemory::Unavailable => 0,
    }
}

fn to_usage(info: ProcessInfo) -> ProcessUsage {
    ProcessUsage {
        pid: info.pid,
        used_memory: used_bytes(info.used_gpu_memory),
    }
}

impl DeviceHandle for NvmlDevice<'_> {
    fn name(&self) -> Result<String, DeviceError> {
        Ok(self.device.name()?)
    }

    fn minor_number(&self) -> Result<u32, DeviceError> {
        Ok(self.device.minor_number()?)
    }

    fn uuid(&self) -> Result<String, DeviceError> {
        Ok(self.device.uuid()?)
    }

    fn memory_info(&self) -> Result<MemoryUsage, DeviceError> {
        let info = self.device.memory_info()?;
        Ok(MemoryUsage {
            used: info.used,
            total: info.total,
        })
    }

    fn utilization(&self) -> Result<u32, DeviceError> {
        Ok(self.device.utilization_rates()?.gpu)
    }

    fn power_usage(&self) -> Result<u32, DeviceError> {
        Ok(self.device.power_usage()?)
    }

    fn temperature(&self) -> Result<u32, DeviceError> {
        Ok(self.device.temperature(TemperatureSensor::Gpu)?)
    }

    fn fan_speed(&self) -> Result<u32, DeviceError> {
        Ok(self.device.fan_speed(0)?)
    }

    fn running_processes(
        &self,
        category: ProcessCategory,
    ) -> Result<Vec<ProcessUsage>, DeviceError> {
        let processes = match category {
            ProcessCategory::Compute => self.device.running_compute_processes()?,
            ProcessCategory::Graphics => self.device.running_graphics_processes()?,
            ProcessCategory::MpsCompute => self.device.mps_running_compute_processes()?,
        };
        Ok(processes.into_iter().map(to_usage).collect())
    }
}
