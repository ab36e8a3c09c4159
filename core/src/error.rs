//! Error types for mnn-bridge.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for mnn-bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Status codes reported by the native engine (`MNN_ErrorCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    OutOfMemory,
    NotSupport,
    ComputeSizeError,
    NoExecution,
    InvalidValue,
    InputDataError,
    CallBackStop,
    TensorNotSupport,
    TensorNeedDivide,
    FileCreateFailed,
    FileRemoveFailed,
    FileOpenFailed,
    FileCloseFailed,
    FileResizeFailed,
    FileSeekFailed,
    FileNotExist,
    FileUnmapFailed,
    Unknown(i32),
}

impl ErrorCode {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::OutOfMemory,
            2 => Self::NotSupport,
            3 => Self::ComputeSizeError,
            4 => Self::NoExecution,
            5 => Self::InvalidValue,
            10 => Self::InputDataError,
            11 => Self::CallBackStop,
            20 => Self::TensorNotSupport,
            21 => Self::TensorNeedDivide,
            30 => Self::FileCreateFailed,
            31 => Self::FileRemoveFailed,
            32 => Self::FileOpenFailed,
            33 => Self::FileCloseFailed,
            34 => Self::FileResizeFailed,
            35 => Self::FileSeekFailed,
            36 => Self::FileNotExist,
            37 => Self::FileUnmapFailed,
            other => Self::Unknown(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::NoError => 0,
            Self::OutOfMemory => 1,
            Self::NotSupport => 2,
            Self::ComputeSizeError => 3,
            Self::NoExecution => 4,
            Self::InvalidValue => 5,
            Self::InputDataError => 10,
            Self::CallBackStop => 11,
            Self::TensorNotSupport => 20,
            Self::TensorNeedDivide => 21,
            Self::FileCreateFailed => 30,
            Self::FileRemoveFailed => 31,
            Self::FileOpenFailed => 32,
            Self::FileCloseFailed => 33,
            Self::FileResizeFailed => 34,
            Self::FileSeekFailed => 35,
            Self::FileNotExist => 36,
            Self::FileUnmapFailed => 37,
            Self::Unknown(code) => code,
        }
    }

    /// Turn a native status into `Ok(())` or an [`BridgeError::EngineRun`].
    pub fn check(code: i32, op: &'static str) -> Result<()> {
        match Self::from_raw(code) {
            Self::NoError => Ok(()),
            code => Err(BridgeError::EngineRun { op, code }),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown status {}", code),
            other => write!(f, "{:?} ({})", other, other.as_raw()),
        }
    }
}

/// Errors that can occur while bridging into the native engine.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A native constructor returned null.
    #[error("Native creation failed: {0}")]
    NativeCreation(String),

    /// An operation was attempted on a released or null handle.
    #[error("Invalid handle: {0} was already released")]
    InvalidHandle(&'static str),

    /// Arguments rejected before any native call was made.
    #[error("Argument mismatch: {0}")]
    ArgumentMismatch(String),

    /// Allocation failed.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// The native engine reported a non-success status.
    #[error("{op} failed: {code}")]
    EngineRun { op: &'static str, code: ErrorCode },

    /// A requested matrix inverse does not exist.
    #[error("Matrix is not invertible")]
    NotInvertible,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Shared library could not be opened.
    #[cfg(feature = "dynamic")]
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    /// Shared library lacks a required symbol.
    #[cfg(feature = "dynamic")]
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),
}

impl BridgeError {
    /// Create a native creation error.
    pub fn native_creation(msg: impl Into<String>) -> Self {
        Self::NativeCreation(msg.into())
    }

    /// Create an argument mismatch error.
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::ArgumentMismatch(msg.into())
    }

    /// Create an allocation error.
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::native_creation("interpreter from buffer");
        assert_eq!(
            format!("{}", err),
            "Native creation failed: interpreter from buffer"
        );

        let err = BridgeError::InvalidHandle("tensor");
        assert_eq!(
            format!("{}", err),
            "Invalid handle: tensor was already released"
        );

        let err = BridgeError::FileNotFound(PathBuf::from("/path/to/model.mnn"));
        assert_eq!(format!("{}", err), "File not found: /path/to/model.mnn");

        let err = BridgeError::EngineRun {
            op: "run_session",
            code: ErrorCode::CallBackStop,
        };
        assert_eq!(format!("{}", err), "run_session failed: CallBackStop (11)");
    }

    #[test]
    fn test_error_code_mapping() {
        for raw in [0, 1, 2, 3, 4, 5, 10, 11, 20, 21, 30, 31, 32, 33, 34, 35, 36, 37] {
            let code = ErrorCode::from_raw(raw);
            assert!(!matches!(code, ErrorCode::Unknown(_)), "{} unmapped", raw);
            assert_eq!(code.as_raw(), raw);
        }
        assert_eq!(ErrorCode::from_raw(99), ErrorCode::Unknown(99));
        assert!(ErrorCode::check(0, "run").is_ok());
        assert!(matches!(
            ErrorCode::check(3, "run"),
            Err(BridgeError::EngineRun {
                code: ErrorCode::ComputeSizeError,
                ..
            })
        ));
    }
}
