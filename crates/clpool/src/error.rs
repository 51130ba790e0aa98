//! Unified error types for clpool.

use std::fmt;

use crate::handle::HandleKind;

/// Result type for compute operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Unified error type for all compute operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    /// The catalog has no device with this handle.
    #[error("Device not found: {0:#x}")]
    DeviceNotFound(u64),

    /// Handle value is zero, out of range, or was never issued.
    #[error("Unknown {kind} handle: {raw:#x}")]
    UnknownHandle {
        /// Kind of handle the caller claimed to pass.
        kind: HandleKind,
        /// Raw handle value.
        raw: u64,
    },

    /// Handle was issued for a different kind of object.
    #[error("Handle {raw:#x} is not a {expected} handle")]
    WrongHandleKind {
        /// Kind of handle the operation expected.
        expected: HandleKind,
        /// Raw handle value.
        raw: u64,
    },

    /// Object behind the handle has already been released.
    #[error("{kind} handle {raw:#x} has already been released")]
    AlreadyReleased {
        /// Kind of the released object.
        kind: HandleKind,
        /// Raw handle value.
        raw: u64,
    },

    /// Device is not owned by any context of the session.
    #[error("No context owns device {0:#x} in this session")]
    NoContextForDevice(u64),

    /// Element type tag is not recognized.
    #[error("Unsupported element type tag: {0}")]
    UnsupportedElementType(u64),

    /// Element type of a transfer does not match the allocation.
    #[error("Element type mismatch: memory holds {expected}, transfer uses {found}")]
    TypeMismatch {
        /// Element type the memory object was created with.
        expected: crate::memory::ElementType,
        /// Element type of the transfer.
        found: crate::memory::ElementType,
    },

    /// Invalid shape or dimensions.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Host value does not fit the device element.
    #[error("Value {value} does not fit in a {target} element")]
    ValueOutOfRange {
        /// Offending host value.
        value: u64,
        /// Name of the target element type.
        target: &'static str,
    },

    /// Two objects used together belong to different contexts.
    #[error("Context mismatch: {0}")]
    ContextMismatch(String),

    /// Program build failed on a context.
    #[error("Program build failed: {message}")]
    BuildFailed {
        /// Driver error message.
        message: String,
        /// Build log reported by the driver.
        log: String,
    },

    /// Kernel creation, argument binding or execution error.
    #[error("Kernel error: {0}")]
    KernelError(String),

    /// Backend-specific error.
    #[error("{backend} error: {message}")]
    BackendError {
        /// Which backend produced the error.
        backend: BackendKind,
        /// Error message from the backend.
        message: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Backend identifier for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-memory simulated driver.
    Simulated,
    /// OpenCL driver.
    OpenCl,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Simulated => write!(f, "Simulated"),
            BackendKind::OpenCl => write!(f, "OpenCL"),
        }
    }
}

impl ComputeError {
    /// Create a backend-specific error.
    pub fn backend(backend: BackendKind, message: impl Into<String>) -> Self {
        ComputeError::BackendError {
            backend,
            message: message.into(),
        }
    }

    /// Create a build failure carrying the driver's build log.
    pub fn build(message: impl Into<String>, log: impl Into<String>) -> Self {
        ComputeError::BuildFailed {
            message: message.into(),
            log: log.into(),
        }
    }

    /// Check whether the error came from a released handle.
    pub fn is_released(&self) -> bool {
        matches!(self, ComputeError::AlreadyReleased { .. })
    }
}

#[cfg(feature = "opencl")]
impl From<opencl3::error_codes::ClError> for ComputeError {
    fn from(err: opencl3::error_codes::ClError) -> Self {
        ComputeError::backend(BackendKind::OpenCl, format!("{:?}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ComputeError::DeviceNotFound(0x10);
        assert!(err.to_string().contains("0x10"));

        let err = ComputeError::backend(BackendKind::OpenCl, "CL_INVALID_CONTEXT");
        assert!(err.to_string().contains("OpenCL"));

        let err = ComputeError::AlreadyReleased {
            kind: HandleKind::Memory,
            raw: 0x0500_0000_0000_0001,
        };
        assert!(err.to_string().contains("memory"));
        assert!(err.is_released());
    }

    #[test]
    fn test_build_error_keeps_log() {
        let err = ComputeError::build("CL_BUILD_PROGRAM_FAILURE", "error: expected ';'");
        match err {
            ComputeError::BuildFailed { message, log } => {
                assert!(message.contains("BUILD"));
                assert!(log.contains("expected"));
            }
            _ => panic!("Wrong error type"),
        }
    }
}
