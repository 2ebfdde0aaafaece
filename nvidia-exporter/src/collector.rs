//! Device collector: one sampling cycle from hardware reads to gauge state.
//!
//! Each cycle enumerates devices, reads every field independently and writes
//! the result into [`GpuMetrics`]. Per-device gauges are overwritten in place,
//! so a field that fails to read keeps its last good value. Per-process gauges
//! are cleared before any are written, so a process that exited since the last
//! cycle disappears from the feed.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::device::{DeviceHandle, DeviceQuery, ProcessCategory, ProcessNames};
use crate::error::{DeviceError, SampleError};
use crate::metrics::{DeviceLabels, ProcessLabels, SharedMetrics};

/// Summary of a completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Devices reported by the library.
    pub devices: u32,
    /// Devices skipped because no handle or identity could be read.
    pub devices_skipped: u32,
    /// Individual field reads that failed.
    pub read_errors: u32,
    /// Process series written across all categories.
    pub processes: u32,
}

/// Samples devices into the shared metrics.
pub struct DeviceCollector<Q, N> {
    query: Q,
    names: N,
    metrics: SharedMetrics,
}

impl<Q, N> DeviceCollector<Q, N>
where
    Q: DeviceQuery,
    N: ProcessNames,
{
    pub fn new(query: Q, names: N, metrics: SharedMetrics) -> Self {
        Self {
            query,
            names,
            metrics,
        }
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Initialize the device library. Failure is fatal for the service.
    pub fn init(&mut self) -> Result<(), SampleError> {
        self.query.init().map_err(SampleError::Init)
    }

    /// Run one sampling cycle.
    pub fn sample_once(&mut self) -> Result<CycleReport, SampleError> {
        let started = Instant::now();

        self.init()?;

        let count = self
            .query
            .device_count()
            .map_err(SampleError::DeviceCount)?;
        self.metrics.set_num_devices(count);

        self.metrics.clear_processes();

        let mut report = CycleReport {
            devices: count,
            ..Default::default()
        };

        for index in 0..count {
            let handle = match self.query.device_by_index(index) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(index, error = %e, "Failed to get device handle, skipping device");
                    self.metrics.record_read_error("handle");
                    report.devices_skipped += 1;
                    continue;
                }
            };

            let identity = match handle.identity() {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(index, error = %e, "Failed to read device identity, skipping device");
                    self.metrics.record_read_error("identity");
                    report.devices_skipped += 1;
                    continue;
                }
            };

            let labels = DeviceLabels::from(&identity);
            trace!(index, uuid = %labels.uuid, name = %labels.name, "Sampling device");

            record_device(&handle, &labels, &self.metrics, &mut self.names, &mut report);
        }

        let elapsed = started.elapsed();
        self.metrics.set_last_cycle_duration(elapsed);

        debug!(
            devices = report.devices,
            skipped = report.devices_skipped,
            read_errors = report.read_errors,
            processes = report.processes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Sampling cycle complete"
        );

        Ok(report)
    }
}

/// Read every field of one device and write it under `labels`.
///
/// Free function so that the handle's borrow of the query does not overlap
/// the mutable borrow of the name resolver.
fn record_device<H, N>(
    handle: &H,
    labels: &DeviceLabels,
    metrics: &SharedMetrics,
    names: &mut N,
    report: &mut CycleReport,
) where
    H: DeviceHandle,
    N: ProcessNames,
{
    let mut failed = |field: &str, error: DeviceError| {
        debug!(uuid = %labels.uuid, field, error = %error, "Device read failed");
        metrics.record_read_error(field);
        report.read_errors += 1;
    };

    match handle.memory_info() {
        Ok(memory) => metrics.set_memory(labels, memory),
        Err(e) => failed("memory", e),
    }

    match handle.utilization() {
        Ok(percent) => metrics.set_duty_cycle(labels, percent),
        Err(e) => failed("utilization", e),
    }

    match handle.power_usage() {
        Ok(milliwatts) => metrics.set_power_usage(labels, milliwatts),
        Err(e) => failed("power_usage", e),
    }

    match handle.temperature() {
        Ok(celsius) => metrics.set_temperature(labels, celsius),
        Err(e) => failed("temperature", e),
    }

    match handle.fan_speed() {
        Ok(percent) => metrics.set_fan_speed(labels, percent),
        Err(e) => failed("fan_speed", e),
    }

    let mut written = 0;
    for category in ProcessCategory::ALL {
        let processes = match handle.running_processes(category) {
            Ok(processes) => processes,
            Err(e) => {
                failed(process_field(category), e);
                continue;
            }
        };

        for process in processes {
            let process_name = names
                .resolve(process.pid)
                .unwrap_or_else(|| process.pid.to_string());
            let process_labels = ProcessLabels::new(labels, process.pid, process_name);
            metrics.set_process_memory(category, &process_labels, process.used_memory);
            written += 1;
        }
    }
    report.processes += written;
}

fn process_field(category: ProcessCategory) -> &'static str {
    match category {
        ProcessCategory::Compute => "compute_processes",
        ProcessCategory::Graphics => "graphics_processes",
        ProcessCategory::MpsCompute => "mps_compute_processes",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryUsage, ProcessUsage};
    use crate::metrics::GpuMetrics;
    use crate::mock::{MockDevice, MockDeviceQuery, StaticProcessNames};
    use std::sync::Arc;

    fn test_device() -> MockDevice {
        MockDevice::new(0, "GPU-abc", "TestGPU")
            .with_memory(MemoryUsage {
                used: 1024,
                total: 8192,
            })
            .with_utilization(37)
            .with_power_usage(50_000)
            .with_temperature(65)
            .with_fan_speed(80)
            .with_processes(
                ProcessCategory::Compute,
                vec![ProcessUsage {
                    pid: 100,
                    used_memory: 512,
                }],
            )
    }

    const DEVICE: &str = "minor_number=\"0\",uuid=\"GPU-abc\",name=\"TestGPU\"";

    fn make_collector(
        query: MockDeviceQuery,
    ) -> DeviceCollector<MockDeviceQuery, StaticProcessNames> {
        let names = StaticProcessNames::default().with(100, "proc1");
        DeviceCollector::new(query, names, Arc::new(GpuMetrics::default()))
    }

    /// Data lines of the rendered output, without comments.
    fn samples(metrics: &GpuMetrics) -> Vec<String> {
        metrics
            .render()
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter(|line| !line.contains("nvidia_exporter_"))
            .map(str::to_string)
            .collect()
    }

    fn has_line(metrics: &GpuMetrics, line: &str) -> bool {
        samples(metrics).iter().any(|l| l == line)
    }

    #[test]
    fn test_full_cycle() {
        let query = MockDeviceQuery::new(vec![test_device()]);
        let mut collector = make_collector(query);

        let report = collector.sample_once().unwrap();
        assert_eq!(
            report,
            CycleReport {
                devices: 1,
                devices_skipped: 0,
                read_errors: 0,
                processes: 1,
            }
        );

        let metrics = collector.metrics();
        assert!(has_line(metrics, "nvidia_num_devices 1"));
        assert!(has_line(
            metrics,
            &format!("nvidia_memory_used_bytes{{{DEVICE}}} 1024")
        ));
        assert!(has_line(
            metrics,
            &format!("nvidia_memory_total_bytes{{{DEVICE}}} 8192")
        ));
        assert!(has_line(metrics, &format!("nvidia_duty_cycle{{{DEVICE}}} 37")));
        assert!(has_line(
            metrics,
            &format!("nvidia_power_usage_milliwatts{{{DEVICE}}} 50000")
        ));
        assert!(has_line(
            metrics,
            &format!("nvidia_temperature_celsius{{{DEVICE}}} 65")
        ));
        assert!(has_line(
            metrics,
            &format!("nvidia_fanspeed_percent{{{DEVICE}}} 80")
        ));
        assert!(has_line(
            metrics,
            &format!(
                "nvidia_compute_process_memory_used_bytes{{{DEVICE},process_id=\"100\",process_name=\"proc1\"}} 512"
            )
        ));
    }

    #[test]
    fn test_num_devices_matches_count() {
        for n in [0u32, 1, 4] {
            let devices = (0..n)
                .map(|i| MockDevice::new(i, &format!("GPU-{i}"), "TestGPU"))
                .collect();
            let mut collector = make_collector(MockDeviceQuery::new(devices));
            let report = collector.sample_once().unwrap();

            assert_eq!(report.devices, n);
            assert!(has_line(
                collector.metrics(),
                &format!("nvidia_num_devices {n}")
            ));
        }
    }

    #[test]
    fn test_exited_process_is_cleared() {
        let query = MockDeviceQuery::new(vec![test_device()]);
        let control = query.clone();
        let mut collector = make_collector(query);

        collector.sample_once().unwrap();
        assert!(
            samples(collector.metrics())
                .iter()
                .any(|l| l.contains("process_id=\"100\""))
        );

        control.update(0, |device| {
            device.processes.clear();
        });
        collector.sample_once().unwrap();

        assert!(
            !samples(collector.metrics())
                .iter()
                .any(|l| l.contains("process_id=\"100\""))
        );
    }

    #[test]
    fn test_failed_fan_read_keeps_previous_value() {
        let query = MockDeviceQuery::new(vec![test_device()]);
        let control = query.clone();
        let mut collector = make_collector(query);

        collector.sample_once().unwrap();

        control.update(0, |device| {
            device.fan_speed = Err(DeviceError::NotSupported);
            device.temperature = Ok(70);
        });
        let report = collector.sample_once().unwrap();

        assert_eq!(report.read_errors, 1);
        let metrics = collector.metrics();
        assert!(has_line(
            metrics,
            &format!("nvidia_fanspeed_percent{{{DEVICE}}} 80")
        ));
        // Other fields of the same device are still refreshed.
        assert!(has_line(
            metrics,
            &format!("nvidia_temperature_celsius{{{DEVICE}}} 70")
        ));
        assert!(
            metrics
                .render()
                .contains("nvidia_exporter_read_errors_total{field=\"fan_speed\"} 1")
        );
    }

    #[test]
    fn test_repeated_cycles_are_idempotent() {
        let query = MockDeviceQuery::new(vec![test_device()]);
        let mut collector = make_collector(query);

        collector.sample_once().unwrap();
        let first = samples(collector.metrics());
        collector.sample_once().unwrap();
        let second = samples(collector.metrics());

        assert_eq!(first, second);
    }

    #[test]
    fn test_device_count_failure_keeps_gauges() {
        let query = MockDeviceQuery::new(vec![test_device()]);
        let control = query.clone();
        let mut collector = make_collector(query);

        collector.sample_once().unwrap();
        let before = samples(collector.metrics());

        control.fail_device_count(Some(DeviceError::Driver("busy".into())));
        let err = collector.sample_once().unwrap_err();
        assert!(matches!(err, SampleError::DeviceCount(_)));
        assert!(!err.is_fatal());

        // Process series are untouched too: the cycle ended before clearing.
        assert_eq!(samples(collector.metrics()), before);
    }

    #[test]
    fn test_init_failure_is_fatal() {
        let query = MockDeviceQuery::new(vec![test_device()]);
        query.fail_init(Some(DeviceError::Init("driver not loaded".into())));
        let mut collector = make_collector(query);

        let err = collector.sample_once().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_identity_failure_skips_only_that_device() {
        let mut broken = MockDevice::new(1, "GPU-def", "Other");
        broken.uuid = Err(DeviceError::Driver("lost".into()));
        let query = MockDeviceQuery::new(vec![test_device(), broken]);
        let mut collector = make_collector(query);

        let report = collector.sample_once().unwrap();
        assert_eq!(report.devices, 2);
        assert_eq!(report.devices_skipped, 1);
        assert!(has_line(collector.metrics(), "nvidia_num_devices 2"));
        assert!(has_line(
            collector.metrics(),
            &format!("nvidia_duty_cycle{{{DEVICE}}} 37")
        ));
        assert!(
            !samples(collector.metrics())
                .iter()
                .any(|l| l.contains("minor_number=\"1\""))
        );
    }

    #[test]
    fn test_unresolved_process_name_falls_back_to_pid() {
        let device = test_device().with_processes(
            ProcessCategory::Graphics,
            vec![ProcessUsage {
                pid: 4242,
                used_memory: 2048,
            }],
        );
        let mut collector = make_collector(MockDeviceQuery::new(vec![device]));
        collector.sample_once().unwrap();

        assert!(has_line(
            collector.metrics(),
            &format!(
                "nvidia_graphics_process_memory_used_bytes{{{DEVICE},process_id=\"4242\",process_name=\"4242\"}} 2048"
            )
        ));
    }

    #[test]
    fn test_process_rows_carry_all_labels() {
        let device = test_device().with_processes(
            ProcessCategory::MpsCompute,
            vec![
                ProcessUsage {
                    pid: 7,
                    used_memory: 1,
                },
                ProcessUsage {
                    pid: 100,
                    used_memory: 2,
                },
            ],
        );
        let mut collector = make_collector(MockDeviceQuery::new(vec![device]));
        let report = collector.sample_once().unwrap();
        assert_eq!(report.processes, 3);

        let rows: Vec<_> = samples(collector.metrics())
            .into_iter()
            .filter(|l| l.contains("process_memory_used_bytes"))
            .collect();
        assert_eq!(rows.len(), 3);
        for row in rows {
            for label in ["minor_number=\"", "uuid=\"", "name=\"", "process_id=\"", "process_name=\""] {
                assert!(row.contains(label), "{row} missing {label}");
            }
            assert!(!row.contains("=\"\""), "{row} has an empty label");
        }
    }

    #[test]
    fn test_process_list_failure_drops_only_that_category() {
        let mut device = test_device().with_processes(
            ProcessCategory::Graphics,
            vec![ProcessUsage {
                pid: 9,
                used_memory: 64,
            }],
        );
        device.fail_processes(ProcessCategory::Compute, DeviceError::NotSupported);
        let mut collector = make_collector(MockDeviceQuery::new(vec![device]));

        let report = collector.sample_once().unwrap();
        assert_eq!(report.read_errors, 1);
        assert_eq!(report.processes, 1);

        let output = collector.metrics().render();
        assert!(!output.contains("nvidia_compute_process_memory_used_bytes{"));
        assert!(output.contains("nvidia_graphics_process_memory_used_bytes{"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let device = MockDevice::new(0, "GPU-abc", "Test\"GPU")
            .with_utilization(5)
            .with_processes(
                ProcessCategory::Compute,
                vec![ProcessUsage {
                    pid: 100,
                    used_memory: 512,
                }],
            );
        let names = StaticProcessNames::default().with(100, "a\"b\\c\nd");
        let mut collector = DeviceCollector::new(
            MockDeviceQuery::new(vec![device]),
            names,
            Arc::new(GpuMetrics::default()),
        );
        collector.sample_once().unwrap();

        let rows = samples(collector.metrics());
        assert!(rows.contains(
            &"nvidia_duty_cycle{minor_number=\"0\",uuid=\"GPU-abc\",name=\"Test\\\"GPU\"} 5"
                .to_string()
        ));
        assert!(rows.contains(
            &"nvidia_compute_process_memory_used_bytes{minor_number=\"0\",uuid=\"GPU-abc\",name=\"Test\\\"GPU\",process_id=\"100\",process_name=\"a\\\"b\\\\c\\nd\"} 512"
                .to_string()
        ));
        for row in rows {
            assert!(row.starts_with("nvidia_"), "broken line {row:?}");
        }
    }
}
