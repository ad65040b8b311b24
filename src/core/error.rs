//! Error taxonomy shared by the registry, dispatch layer, IPC manager and loader.

use std::fmt;

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

/// Stable numeric result codes.
///
/// These are the values exchanged with adapter plugins over the C ABI, so
/// the discriminants must never change.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    InvalidArgument = 1,
    OutOfHostMemory = 2,
    BackendSpecific = 3,
    Unsupported = 4,
    NoCapableBackend = 5,
    ContractVersionMismatch = 6,
    RegistryUninitialized = 7,
    InvalidState = 8,
}

impl ResultCode {
    /// Decode a raw code returned by a plugin.
    ///
    /// Unknown values are treated as backend-specific failures.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ResultCode::Success,
            1 => ResultCode::InvalidArgument,
            2 => ResultCode::OutOfHostMemory,
            4 => ResultCode::Unsupported,
            5 => ResultCode::NoCapableBackend,
            6 => ResultCode::ContractVersionMismatch,
            7 => ResultCode::RegistryUninitialized,
            8 => ResultCode::InvalidState,
            _ => ResultCode::BackendSpecific,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::InvalidArgument => "invalid argument",
            ResultCode::OutOfHostMemory => "out of host memory",
            ResultCode::BackendSpecific => "backend specific error",
            ResultCode::Unsupported => "unsupported",
            ResultCode::NoCapableBackend => "no capable backend",
            ResultCode::ContractVersionMismatch => "contract version mismatch",
            ResultCode::RegistryUninitialized => "registry uninitialized",
            ResultCode::InvalidState => "invalid state",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by every framework operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of host memory")]
    OutOfHostMemory,

    /// Opaque backend failure. The native message and code are available
    /// through the failing provider's last-native-error query.
    #[error("provider `{provider}` failed: {message}")]
    BackendSpecific { provider: String, message: String },

    #[error("operation `{operation}` is not supported by provider `{provider}`")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("no capable backend for `{tag}`")]
    NoCapableBackend { tag: String },

    #[error("provider `{name}` implements contract {found}, expected {expected}")]
    ContractVersionMismatch {
        name: String,
        expected: semver::Version,
        found: semver::Version,
    },

    #[error("provider registry is not initialized")]
    RegistryUninitialized,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ProviderError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ProviderError::InvalidArgument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProviderError::InvalidState(msg.into())
    }

    pub fn backend(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::BackendSpecific {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(provider: impl Into<String>, operation: &'static str) -> Self {
        ProviderError::Unsupported {
            provider: provider.into(),
            operation,
        }
    }

    /// The stable result code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            ProviderError::InvalidArgument(_) => ResultCode::InvalidArgument,
            ProviderError::OutOfHostMemory => ResultCode::OutOfHostMemory,
            ProviderError::BackendSpecific { .. } => ResultCode::BackendSpecific,
            ProviderError::Unsupported { .. } => ResultCode::Unsupported,
            ProviderError::NoCapableBackend { .. } => ResultCode::NoCapableBackend,
            ProviderError::ContractVersionMismatch { .. } => ResultCode::ContractVersionMismatch,
            ProviderError::RegistryUninitialized => ResultCode::RegistryUninitialized,
            ProviderError::InvalidState(_) => ResultCode::InvalidState,
        }
    }
}

/// A backend's own description of its most recent failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeError {
    /// Human-readable message
    pub message: String,

    /// Backend-defined error code (e.g. errno)
    pub code: i32,
}

impl NativeError {
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        NativeError {
            message: message.into(),
            code,
        }
    }

    /// Capture the calling thread's last OS error.
    pub fn last_os_error() -> Self {
        let err = std::io::Error::last_os_error();
        NativeError {
            message: err.to_string(),
            code: err.raw_os_error().unwrap_or(-1),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}
