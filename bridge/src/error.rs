//! Bridge error types.

use std::fmt;

use keystone_hostapi::{HostError, HostValue};

/// Top-level error type for the bridge crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Wasmtime engine, compilation, instantiation or call error.
    #[error("wasmtime error: {0}")]
    Wasmtime(#[from] anyhow::Error),

    /// Module validation failed (missing exports, bad imports, etc.).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A named export is missing or has an unusable type.
    #[error("missing export: {0}")]
    MissingExport(String),

    /// Arguments do not match the export's parameter list.
    #[error("export '{name}' takes {expected} params, {given} supplied")]
    Signature {
        name: String,
        expected: usize,
        given: usize,
    },

    /// Host value or host capability error.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Bytes in guest memory were not valid UTF-8.
    #[error("invalid UTF-8 in guest memory: {0}")]
    Decode(#[from] std::str::Utf8Error),

    /// Memory operation failed (out-of-bounds, grow failure).
    #[error("memory error: {0}")]
    MemoryError(String),

    /// The guest raised an error: a value it returned as its failure
    /// result, or one it threw through the `throw`/`rethrow` imports.
    #[error("{message}")]
    Thrown {
        message: String,
        /// Backtrace captured when the error object was created.
        stack: Option<String>,
    },

    /// The call succeeded but produced a value of the wrong shape.
    #[error("unexpected result: {0}")]
    Unexpected(String),

    /// Fuel exhausted during execution.
    #[error("fuel exhausted (instruction limit)")]
    FuelExhausted,

    /// WASM guest trapped.
    #[error("guest trapped: {0}")]
    GuestTrapped(String),

    /// Configuration could not be read.
    #[error("config error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Reconstruct a host error from a value the guest raised.
    pub fn from_thrown(value: HostValue) -> Self {
        match value {
            HostValue::Error(e) => Self::Thrown {
                message: e.message,
                stack: Some(e.stack),
            },
            HostValue::String(message) => Self::Thrown {
                message,
                stack: None,
            },
            other => Self::Thrown {
                message: match other.to_json() {
                    Some(json) => json.to_string(),
                    None => other.kind().to_owned(),
                },
                stack: None,
            },
        }
    }

    /// Message text of a thrown error, if this is one.
    pub fn thrown_message(&self) -> Option<&str> {
        match self {
            Self::Thrown { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Payload of a trap raised by the `throw` and `rethrow` imports.
///
/// Travels through Wasmtime inside the trap's `anyhow::Error` and is
/// recovered by downcasting when the outermost call returns.
#[derive(Debug)]
pub struct GuestThrow(pub HostValue);

impl fmt::Display for GuestThrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            HostValue::Error(e) => write!(f, "guest threw: {}", e.message),
            HostValue::String(s) => write!(f, "guest threw: {}", s),
            other => write!(f, "guest threw a {}", other.kind()),
        }
    }
}

impl std::error::Error for GuestThrow {}
