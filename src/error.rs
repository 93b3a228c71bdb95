use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Video device lost [{device}]: {reason}")]
    DeviceLost { device: String, reason: String },

    #[error("Device granted {granted} buffers, {requested} required")]
    BufferShortfall { requested: u32, granted: u32 },

    #[error("Poll error: {0}")]
    Poll(String),

    #[error("Consumer setup failed [{unit}]: {reason}")]
    ConsumerSetup { unit: String, reason: String },

    #[error("No encode channel available")]
    NoChannelAvailable,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Request queue full")]
    QueueFull,

    #[error("Unit not found: {0}")]
    UnitNotFound(u32),

    #[error("Capture {0} not initialized")]
    NotInitialized(i32),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaptureError {
    /// Signed status for the control surface (negative errno, never 0)
    pub fn status(&self) -> i32 {
        match self {
            CaptureError::Io(e) => e.raw_os_error().map(|errno| -errno).unwrap_or(-libc::EIO),
            CaptureError::NotInitialized(_) => -1,
            CaptureError::Device(_) | CaptureError::Poll(_) => -libc::EIO,
            CaptureError::DeviceLost { .. } => -libc::ENODEV,
            CaptureError::BufferShortfall { .. } => -libc::ENOMEM,
            CaptureError::NoChannelAvailable | CaptureError::QueueFull => -libc::EBUSY,
            CaptureError::UnitNotFound(_) => -libc::ENOENT,
            CaptureError::InvalidState(_) => -libc::EPERM,
            CaptureError::Config(_)
            | CaptureError::Conversion(_)
            | CaptureError::Serialization(_) => -libc::EINVAL,
            CaptureError::ConsumerSetup { .. } | CaptureError::Encoder(_) => -libc::ENODEV,
            CaptureError::ProtocolViolation(_) => -libc::EFAULT,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Convert a result into the control surface's signed status
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_negative() {
        let errors = [
            CaptureError::Device("x".into()),
            CaptureError::NoChannelAvailable,
            CaptureError::NotInitialized(3),
            CaptureError::Config("bad".into()),
            CaptureError::Io(std::io::Error::from_raw_os_error(libc::EAGAIN)),
        ];
        for e in &errors {
            assert!(e.status() < 0, "{} mapped to {}", e, e.status());
        }
        assert_eq!(CaptureError::NotInitialized(7).status(), -1);
        assert_eq!(
            CaptureError::Io(std::io::Error::from_raw_os_error(libc::EAGAIN)).status(),
            -libc::EAGAIN
        );
    }

    #[test]
    fn test_status_of() {
        let ok: Result<()> = Ok(());
        assert_eq!(status_of(&ok), 0);
        let err: Result<()> = Err(CaptureError::QueueFull);
        assert_eq!(status_of(&err), -libc::EBUSY);
    }
}
