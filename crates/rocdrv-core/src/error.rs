use crate::native::HipStatus;

/// Coarse classification of a [`DriverError`], convenient for matching in tests
/// and for mapping onto caller-facing status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InitFailed,
    InvalidHandle,
    ResourceExhausted,
    InvalidArgument,
    Native,
    CallbackReentrancy,
    ContextInUse,
}

/// Every failure the driver layer reports. Native codes never escape unconverted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("driver initialization failed: {0}")]
    InitFailed(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} failed: {status}: {} ({message})", .status.description())]
    Native {
        operation: &'static str,
        status: HipStatus,
        message: String,
    },

    #[error("driver called from a stream callback: {0}")]
    CallbackReentrancy(String),

    #[error("context {id} still owns {live} live handle(s)")]
    ContextInUse { id: i64, live: usize },
}

impl DriverError {
    /// Classifies a failed native call. `detail` carries the arguments worth
    /// reporting (context id, sizes, names).
    pub fn from_native(operation: &'static str, status: HipStatus, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let message = format!("{operation}: {status}: {}; {detail}", status.description());
        match status {
            HipStatus::ERROR_OUT_OF_MEMORY => Self::ResourceExhausted(message),
            HipStatus::ERROR_INVALID_HANDLE
            | HipStatus::ERROR_INVALID_CONTEXT
            | HipStatus::ERROR_CONTEXT_IS_DESTROYED => Self::InvalidHandle(message),
            HipStatus::ERROR_INVALID_VALUE
            | HipStatus::ERROR_NOT_FOUND
            | HipStatus::ERROR_INVALID_DEVICE => Self::InvalidArgument(message),
            HipStatus::ERROR_NOT_INITIALIZED
            | HipStatus::ERROR_NO_DEVICE
            | HipStatus::ERROR_INSUFFICIENT_DRIVER => Self::InitFailed(message),
            _ => Self::Native {
                operation,
                status,
                message: detail,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InitFailed(_) => ErrorKind::InitFailed,
            Self::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Native { .. } => ErrorKind::Native,
            Self::CallbackReentrancy(_) => ErrorKind::CallbackReentrancy,
            Self::ContextInUse { .. } => ErrorKind::ContextInUse,
        }
    }

    /// The native code behind a `Native` error, if any.
    pub fn native_status(&self) -> Option<HipStatus> {
        match self {
            Self::Native { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Status = Result<(), DriverError>;
pub type StatusOr<T> = Result<T, DriverError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_codes_map_to_kinds() {
        let oom = DriverError::from_native("hipMalloc", HipStatus::ERROR_OUT_OF_MEMORY, "bytes=1");
        assert_eq!(oom.kind(), ErrorKind::ResourceExhausted);

        let bad = DriverError::from_native("hipModuleGetFunction", HipStatus::ERROR_NOT_FOUND, "name=x");
        assert_eq!(bad.kind(), ErrorKind::InvalidArgument);

        let launch = DriverError::from_native("hipModuleLaunchKernel", HipStatus::ERROR_LAUNCH_FAILURE, "ctx=1");
        assert_eq!(launch.native_status(), Some(HipStatus::ERROR_LAUNCH_FAILURE));
        assert!(launch.to_string().contains("unspecified launch failure"));
    }
}
