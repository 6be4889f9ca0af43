//! Error types for the audio device layer

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("HAL error: {0}")]
    Hal(#[from] HalError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by device and manager operations.
///
/// This is the fixed vocabulary every fallible device operation reports.
/// Nothing in this crate panics or unwinds across the audio-thread boundary;
/// failures are always returned as one of these values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Parameter not supported: {0}")]
    NotSupported(String),

    #[error("Native audio subsystem error: {0}")]
    Native(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Wrong object state: {0}")]
    WrongState(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

/// Errors raised by a native HAL binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Unsupported buffer size: {0} frames")]
    UnsupportedBufferSize(u32),

    #[error("Failed to open stream: {0}")]
    Stream(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Not supported by this HAL: {0}")]
    NotSupported(String),

    #[error("cpal error: {0}")]
    Cpal(String),
}

impl From<HalError> for DeviceError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::DeviceNotFound(name) => DeviceError::DeviceNotFound(name),
            HalError::UnsupportedSampleRate(rate) => {
                DeviceError::NotSupported(format!("sample rate {} Hz", rate))
            }
            HalError::UnsupportedBufferSize(size) => {
                DeviceError::NotSupported(format!("buffer size {} frames", size))
            }
            HalError::NotSupported(what) => DeviceError::NotSupported(what),
            other => DeviceError::Native(other.to_string()),
        }
    }
}

/// Result type alias for device operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Result type alias for HAL calls
pub type HalResult<T> = std::result::Result<T, HalError>;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hal_error_maps_to_domain_vocabulary() {
        assert_eq!(
            DeviceError::from(HalError::DeviceNotFound("Mic".into())),
            DeviceError::DeviceNotFound("Mic".into())
        );
        assert!(matches!(
            DeviceError::from(HalError::UnsupportedBufferSize(100)),
            DeviceError::NotSupported(_)
        ));
        assert!(matches!(
            DeviceError::from(HalError::Stream("boom".into())),
            DeviceError::Native(_)
        ));
    }
}
