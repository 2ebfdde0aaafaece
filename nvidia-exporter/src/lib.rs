//! Prometheus metrics exporter for NVIDIA GPUs.
//!
//! This crate samples GPU telemetry through NVML on a fixed interval and
//! exposes it as Prometheus gauges via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   DeviceQuery   │────>│ DeviceCollector │────>│   GpuMetrics    │<────│   HTTP Server   │
//! │     (NVML)      │     │ (Sampler loop)  │     │   (registry)    │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! POLLING_INTERVAL_SECONDS=10 EXPORTER_PORT=9102 nvidia-exporter
//! nvidia-exporter --config exporter.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod device;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod mock;
pub mod nvml;
pub mod sampler;

pub use collector::{CycleReport, DeviceCollector};
pub use config::ExporterConfig;
pub use device::{DeviceHandle, DeviceQuery, ProcessNames, SystemProcessNames};
pub use error::{DeviceError, ExporterError, SampleError};
pub use http::HttpServer;
pub use metrics::{GpuMetrics, SharedMetrics};
pub use nvml::NvmlQuery;
pub use sampler::Sampler;
