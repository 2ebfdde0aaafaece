//! Gauge definitions and the Prometheus registry that holds them.
//!
//! [`GpuMetrics`] is created once at startup and shared through an `Arc`
//! between the sampling loop (sole writer) and the HTTP handler (reader).
//! Every data point is an atomic, so a scrape racing a cycle sees each value
//! either before or after its update, never torn.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::warn;

use crate::device::{DeviceIdentity, MemoryUsage, ProcessCategory};

/// Content type of [`GpuMetrics::render`] output.
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Label set shared by all per-device gauges.
///
/// String values are stored escaped, since the encoder writes them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct DeviceLabels {
    pub minor_number: u32,
    pub uuid: String,
    pub name: String,
}

impl From<&DeviceIdentity> for DeviceLabels {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            minor_number: identity.minor_number,
            uuid: escape_label_value(&identity.uuid),
            name: escape_label_value(&identity.name),
        }
    }
}

/// Label set for per-process gauges: the device labels plus the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ProcessLabels {
    pub minor_number: u32,
    pub uuid: String,
    pub name: String,
    pub process_id: u32,
    pub process_name: String,
}

impl ProcessLabels {
    pub fn new(device: &DeviceLabels, process_id: u32, process_name: String) -> Self {
        Self {
            minor_number: device.minor_number,
            uuid: device.uuid.clone(),
            name: device.name.clone(),
            process_id,
            process_name: escape_label_value(&process_name),
        }
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct FieldLabels {
    field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

/// How a sampling cycle ended, as reported in the cycle counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Aborted,
    Skipped,
    TimedOut,
    Panicked,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::TimedOut => "timed_out",
            CycleOutcome::Panicked => "panicked",
        }
    }
}

/// The exporter's fixed set of metrics.
pub struct GpuMetrics {
    registry: Registry,

    num_devices: Gauge,
    used_memory: Family<DeviceLabels, Gauge>,
    total_memory: Family<DeviceLabels, Gauge>,
    duty_cycle: Family<DeviceLabels, Gauge>,
    power_usage: Family<DeviceLabels, Gauge>,
    temperature: Family<DeviceLabels, Gauge>,
    fan_speed: Family<DeviceLabels, Gauge>,

    compute_process_memory: Family<ProcessLabels, Gauge>,
    graphics_process_memory: Family<ProcessLabels, Gauge>,
    mps_compute_process_memory: Family<ProcessLabels, Gauge>,

    sample_cycles: Family<OutcomeLabels, Counter>,
    read_errors: Family<FieldLabels, Counter>,
    last_cycle_duration: Gauge<f64, AtomicU64>,
}

/// Shareable handle to the metrics.
pub type SharedMetrics = Arc<GpuMetrics>;

/// Saturating conversion for byte counts; gauges are signed 64-bit.
fn to_gauge(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl GpuMetrics {
    /// Create and register all metrics under `prefix` (empty for none).
    pub fn new(prefix: &str) -> Self {
        let mut registry = if prefix.is_empty() {
            Registry::default()
        } else {
            Registry::with_prefix(prefix)
        };

        let metrics = Self {
            registry: Registry::default(),
            num_devices: Gauge::default(),
            used_memory: Family::default(),
            total_memory: Family::default(),
            duty_cycle: Family::default(),
            power_usage: Family::default(),
            temperature: Family::default(),
            fan_speed: Family::default(),
            compute_process_memory: Family::default(),
            graphics_process_memory: Family::default(),
            mps_compute_process_memory: Family::default(),
            sample_cycles: Family::default(),
            read_errors: Family::default(),
            last_cycle_duration: Gauge::default(),
        };

        registry.register(
            "num_devices",
            "Number of GPU devices",
            metrics.num_devices.clone(),
        );
        registry.register(
            "memory_used_bytes",
            "Memory used by the GPU device in bytes",
            metrics.used_memory.clone(),
        );
        registry.register(
            "memory_total_bytes",
            "Total memory of the GPU device in bytes",
            metrics.total_memory.clone(),
        );
        registry.register(
            "duty_cycle",
            "Percent of time over the past sample period during which one or more kernels were executing on the GPU device",
            metrics.duty_cycle.clone(),
        );
        registry.register(
            "power_usage_milliwatts",
            "Power usage of the GPU device in milliwatts",
            metrics.power_usage.clone(),
        );
        registry.register(
            "temperature_celsius",
            "Temperature of the GPU device in celsius",
            metrics.temperature.clone(),
        );
        registry.register(
            "fanspeed_percent",
            "Fanspeed of the GPU device as a percent of its maximum",
            metrics.fan_speed.clone(),
        );
        registry.register(
            "compute_process_memory_used_bytes",
            "GPU memory used by a compute process in bytes",
            metrics.compute_process_memory.clone(),
        );
        registry.register(
            "graphics_process_memory_used_bytes",
            "GPU memory used by a graphics process in bytes",
            metrics.graphics_process_memory.clone(),
        );
        registry.register(
            "mps_compute_process_memory_used_bytes",
            "GPU memory used by an MPS compute process in bytes",
            metrics.mps_compute_process_memory.clone(),
        );

        let exporter = registry.sub_registry_with_prefix("exporter");
        exporter.register(
            "sample_cycles",
            "Sampling cycles by outcome",
            metrics.sample_cycles.clone(),
        );
        exporter.register(
            "read_errors",
            "Failed device field reads",
            metrics.read_errors.clone(),
        );
        exporter.register(
            "last_cycle_duration_seconds",
            "Wall-clock duration of the last completed sampling cycle",
            metrics.last_cycle_duration.clone(),
        );

        Self {
            registry,
            ..metrics
        }
    }

    pub fn set_num_devices(&self, count: u32) {
        self.num_devices.set(i64::from(count));
    }

    pub fn set_memory(&self, labels: &DeviceLabels, memory: MemoryUsage) {
        self.used_memory
            .get_or_create(labels)
            .set(to_gauge(memory.used));
        self.total_memory
            .get_or_create(labels)
            .set(to_gauge(memory.total));
    }

    pub fn set_duty_cycle(&self, labels: &DeviceLabels, percent: u32) {
        self.duty_cycle
            .get_or_create(labels)
            .set(i64::from(percent));
    }

    pub fn set_power_usage(&self, labels: &DeviceLabels, milliwatts: u32) {
        self.power_usage
            .get_or_create(labels)
            .set(i64::from(milliwatts));
    }

    pub fn set_temperature(&self, labels: &DeviceLabels, celsius: u32) {
        self.temperature
            .get_or_create(labels)
            .set(i64::from(celsius));
    }

    pub fn set_fan_speed(&self, labels: &DeviceLabels, percent: u32) {
        self.fan_speed.get_or_create(labels).set(i64::from(percent));
    }

    fn process_family(&self, category: ProcessCategory) -> &Family<ProcessLabels, Gauge> {
        match category {
            ProcessCategory::Compute => &self.compute_process_memory,
            ProcessCategory::Graphics => &self.graphics_process_memory,
            ProcessCategory::MpsCompute => &self.mps_compute_process_memory,
        }
    }

    pub fn set_process_memory(
        &self,
        category: ProcessCategory,
        labels: &ProcessLabels,
        used_memory: u64,
    ) {
        self.process_family(category)
            .get_or_create(labels)
            .set(to_gauge(used_memory));
    }

    /// Remove every series from the three per-process gauges.
    pub fn clear_processes(&self) {
        for category in ProcessCategory::ALL {
            self.process_family(category).clear();
        }
    }

    pub fn record_read_error(&self, field: &str) {
        self.read_errors
            .get_or_create(&FieldLabels {
                field: field.to_string(),
            })
            .inc();
    }

    pub fn record_cycle(&self, outcome: CycleOutcome) {
        self.sample_cycles
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str().to_string(),
            })
            .inc();
    }

    pub fn set_last_cycle_duration(&self, duration: Duration) {
        self.last_cycle_duration.set(duration.as_secs_f64());
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        if let Err(e) = encode(&mut output, &self.registry) {
            warn!(error = %e, "Failed to encode metrics");
        }
        output
    }
}

impl Default for GpuMetrics {
    fn default() -> Self {
        Self::new("nvidia")
    }
}
