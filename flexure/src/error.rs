use crate::equipment::DeviceError;
use thiserror::Error;

/// Errors that prevent a measurement cycle from completing.
///
/// Recoverable conditions (deadband, outliers, stale filter or focus, failed
/// plate solves) are absorbed by the compensator and never surface here.
#[derive(Error, Debug)]
pub enum FlexureError {
    /// The imaging camera is not connected.
    #[error("camera not connected")]
    CameraNotConnected,

    /// The camera dropped its connection during a capture.
    #[error("camera connection lost")]
    CameraConnectionLost,

    /// The camera reported a failed exposure.
    #[error("exposure failed: {0}")]
    ExposureFailed(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other collaborator failure.
    #[error("device error: {0}")]
    Device(String),

    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read or written.
    #[error("configuration I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl FlexureError {
    /// True if this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlexureError::Cancelled)
    }
}

impl From<DeviceError> for FlexureError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NotConnected => FlexureError::CameraNotConnected,
            DeviceError::ConnectionLost => FlexureError::CameraConnectionLost,
            DeviceError::ExposureFailed(msg) => FlexureError::ExposureFailed(msg),
            DeviceError::Cancelled => FlexureError::Cancelled,
            DeviceError::Other(msg) => FlexureError::Device(msg),
        }
    }
}

/// Result alias for compensator operations
pub type FlexureResult<T> = Result<T, FlexureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_cancellation_maps_to_cancelled() {
        let err: FlexureError = DeviceError::Cancelled.into();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_device_errors_keep_their_message() {
        let err: FlexureError = DeviceError::ExposureFailed("shutter stuck".into()).into();
        assert_eq!(err.to_string(), "exposure failed: shutter stuck");

        let err: FlexureError = DeviceError::Other("usb reset".into()).into();
        assert_eq!(err.to_string(), "device error: usb reset");
    }
}
