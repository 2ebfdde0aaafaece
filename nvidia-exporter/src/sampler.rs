//! Fixed-interval sampling loop.
//!
//! NVML calls block, so every cycle runs on the blocking thread pool. A cycle
//! that outlives its deadline keeps running in the background while holding
//! the collector; ticks that find it still busy are skipped. Its result is
//! logged when it finally returns, and a fatal one ends the loop on the next
//! tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::collector::{CycleReport, DeviceCollector};
use crate::config::SamplingConfig;
use crate::device::{DeviceQuery, ProcessNames};
use crate::error::{ExporterError, SampleError};
use crate::metrics::{CycleOutcome, SharedMetrics};

/// What happened on one tick of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(CycleReport),
    Aborted(SampleError),
    /// The previous cycle still holds the collector.
    Skipped,
    /// The cycle did not finish before the deadline.
    TimedOut,
    /// The cycle's worker thread panicked.
    Panicked,
}

/// Drives a [`DeviceCollector`] on a fixed interval.
pub struct Sampler<Q, N> {
    collector: Arc<Mutex<DeviceCollector<Q, N>>>,
    metrics: SharedMetrics,
    interval: Duration,
    cycle_timeout: Duration,
    /// Fatal error from a cycle that finished after its deadline.
    late_failure: Arc<Mutex<Option<SampleError>>>,
}

impl<Q, N> Sampler<Q, N>
where
    Q: DeviceQuery + 'static,
    N: ProcessNames + 'static,
{
    pub fn new(collector: DeviceCollector<Q, N>, config: &SamplingConfig) -> Self {
        Self {
            metrics: collector.metrics().clone(),
            collector: Arc::new(Mutex::new(collector)),
            interval: config.interval(),
            cycle_timeout: config.cycle_timeout(),
            late_failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Sample, sleep for the interval, repeat.
    ///
    /// Returns `Ok(())` when `shutdown` fires and an error only if sampling
    /// can no longer continue.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ExporterError> {
        info!(
            interval_secs = self.interval.as_secs(),
            cycle_timeout_secs = self.cycle_timeout.as_secs(),
            "Starting sampling loop"
        );

        loop {
            if let TickOutcome::Aborted(e) = self.tick().await
                && e.is_fatal()
            {
                error!(error = %e, "Sampling cannot continue");
                return Err(e.into());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Sampling loop stopped");
        Ok(())
    }

    /// Run one cycle on the blocking pool and wait up to the deadline.
    pub async fn tick(&self) -> TickOutcome {
        let late_failure = self.late_failure.lock().take();
        if let Some(e) = late_failure {
            error!(error = %e, "Overrunning sampling cycle failed");
            self.metrics.record_cycle(CycleOutcome::Aborted);
            return TickOutcome::Aborted(e);
        }

        let collector = self.collector.clone();
        let late_failure = self.late_failure.clone();
        let deadline = self.cycle_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let mut collector = collector.try_lock()?;
            let started = Instant::now();
            let result = collector.sample_once();

            let elapsed = started.elapsed();
            if elapsed > deadline {
                let elapsed_ms = elapsed.as_millis() as u64;
                match &result {
                    Ok(report) => info!(
                        elapsed_ms,
                        devices = report.devices,
                        "Overrunning sampling cycle completed"
                    ),
                    Err(e) if e.is_fatal() => {
                        error!(elapsed_ms, error = %e, "Overrunning sampling cycle failed");
                        *late_failure.lock() = Some(e.clone());
                    }
                    Err(e) => warn!(elapsed_ms, error = %e, "Overrunning sampling cycle abandoned"),
                }
            }
            Some(result)
        });

        let outcome = match tokio::time::timeout(self.cycle_timeout, task).await {
            Ok(Ok(Some(Ok(report)))) => TickOutcome::Completed(report),
            Ok(Ok(Some(Err(e)))) => {
                if !e.is_fatal() {
                    warn!(error = %e, "Sampling cycle abandoned, retrying next tick");
                }
                TickOutcome::Aborted(e)
            }
            Ok(Ok(None)) => {
                warn!("Previous sampling cycle still running, skipping tick");
                TickOutcome::Skipped
            }
            Ok(Err(e)) => {
                error!(error = %e, "Sampling cycle panicked");
                TickOutcome::Panicked
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.cycle_timeout.as_secs(),
                    "Sampling cycle exceeded its deadline"
                );
                TickOutcome::TimedOut
            }
        };

        match &outcome {
            TickOutcome::Completed(report) => {
                debug!(devices = report.devices, "Tick complete");
                self.metrics.record_cycle(CycleOutcome::Completed);
            }
            TickOutcome::Aborted(_) => self.metrics.record_cycle(CycleOutcome::Aborted),
            TickOutcome::Panicked => self.metrics.record_cycle(CycleOutcome::Panicked),
            TickOutcome::Skipped => self.metrics.record_cycle(CycleOutcome::Skipped),
            TickOutcome::TimedOut => self.metrics.record_cycle(CycleOutcome::TimedOut),
        }

        outcome
    }
}
