//! Host-side error types for the Keystone bridge.
//!
//! `HostError` is returned by capability adapters and by the typed accessors
//! on [`HostValue`](crate::HostValue). When one of these errors happens while
//! the guest is calling a host import, the bridge converts it into an error
//! object via [`HostError::into_value`] and hands the guest a handle to it.

use crate::value::{ErrorValue, HostValue};

/// Failure raised by a host capability or a host value accessor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    /// The random source could not produce bytes.
    #[error("random source failed: {0}")]
    Random(String),

    /// A capability was requested but not configured on this bridge.
    #[error("capability unavailable: {0}")]
    Unavailable(&'static str),

    /// The module loader has no module registered under this name.
    #[error("cannot find module '{0}'")]
    ModuleNotFound(String),

    /// Text handed to `json_parse` was not a JSON document.
    #[error("invalid JSON: {0}")]
    Json(String),

    /// A value of the wrong kind was passed where another was expected.
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        /// Kind the operation needs.
        expected: &'static str,
        /// Kind that was actually supplied.
        found: &'static str,
    },

    /// A byte range fell outside the array it was applied to.
    #[error("range {start}..{end} out of bounds for length {len}")]
    OutOfBounds {
        /// First byte of the range.
        start: usize,
        /// One past the last byte of the range.
        end: usize,
        /// Length of the array.
        len: usize,
    },

    /// The guest presented a handle that is not live in the table.
    #[error("stale or unknown handle {0}")]
    StaleHandle(u32),
}

impl HostError {
    /// Build a type-mismatch error against the kind of `found`.
    pub fn type_mismatch(expected: &'static str, found: &HostValue) -> Self {
        Self::TypeMismatch {
            expected,
            found: found.kind(),
        }
    }

    /// Convert into the error object the guest receives a handle to.
    ///
    /// The message is the `Display` text of this error, unchanged.
    pub fn into_value(self) -> HostValue {
        HostValue::Error(ErrorValue::new(self.to_string()))
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
