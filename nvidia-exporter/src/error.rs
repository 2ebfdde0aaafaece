//! Error types for the exporter.

use thiserror::Error;

/// Result type alias using [`ExporterError`].
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Errors returned by a [`DeviceQuery`](crate::device::DeviceQuery) backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The hardware interface could not be initialized.
    #[error("Failed to initialize device library: {0}")]
    Init(String),

    /// A query was issued before a successful `init()`.
    #[error("Device library is not initialized")]
    NotInitialized,

    /// No device exists at the given index.
    #[error("No device at index {0}")]
    NotFound(u32),

    /// The device does not support the requested field.
    #[error("Not supported by this device")]
    NotSupported,

    /// Any other driver-level failure.
    #[error("Driver error: {0}")]
    Driver(String),
}

impl From<nvml_wrapper::error::NvmlError> for DeviceError {
    fn from(err: nvml_wrapper::error::NvmlError) -> Self {
        use nvml_wrapper::error::NvmlError;

        match err {
            NvmlError::NotSupported => Self::NotSupported,
            NvmlError::Uninitialized => Self::NotInitialized,
            other => Self::Driver(other.to_string()),
        }
    }
}

/// Outcome of a sampling cycle that did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// Initialization failed. Not recoverable in-process.
    #[error("Device initialization failed: {0}")]
    Init(#[source] DeviceError),

    /// The device count could not be read; the cycle was abandoned.
    #[error("Failed to query device count: {0}")]
    DeviceCount(#[source] DeviceError),
}

impl SampleError {
    /// Whether the service must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Init(_))
    }
}

/// Fatal errors that stop the exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Sampling can no longer continue.
    #[error("Sampling stopped: {0}")]
    Sample(#[from] SampleError),

    /// The HTTP listener could not be bound.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server failed while running.
    #[error("HTTP server error: {0}")]
    Http(#[source] std::io::Error),

    /// Logging could not be initialized.
    #[error("Failed to initialize tracing: {0}")]
    Tracing(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_init_is_fatal() {
        assert!(SampleError::Init(DeviceError::Init("no driver".into())).is_fatal());
        assert!(!SampleError::DeviceCount(DeviceError::Driver("busy".into())).is_fatal());
    }

    #[test]
    fn test_nvml_error_mapping() {
        use nvml_wrapper::error::NvmlError;

        assert_eq!(
            DeviceError::from(NvmlError::NotSupported),
            DeviceError::NotSupported
        );
        assert_eq!(
            DeviceError::from(NvmlError::Uninitialized),
            DeviceError::NotInitialized
        );
        assert!(matches!(
            DeviceError::from(NvmlError::GpuLost),
            DeviceError::Driver(_)
        ));
    }

    #[test]
    fn test_error_messages() {
        let err = SampleError::DeviceCount(DeviceError::NotInitialized);
        assert_eq!(
            err.to_string(),
            "Failed to query device count: Device library is not initialized"
        );
        assert_eq!(DeviceError::NotFound(3).to_string(), "No device at index 3");
    }
}
