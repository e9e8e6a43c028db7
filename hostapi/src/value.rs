//! Host values addressable from the guest through handles.
//!
//! Byte arrays come in two flavours. An *owned* array is backed by a shared
//! host-side buffer, so `subarray` windows alias their parent the same way a
//! typed-array view does. A *linear* array is a window onto the guest's own
//! linear memory; the bridge resolves it against the live memory on every
//! access instead of holding a pointer into it.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::HostError;
use crate::traits::{ModuleLoader, RandomSource};

/// An error object: message plus the backtrace captured at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub message: String,
    pub stack: String,
}

impl ErrorValue {
    /// Create an error object, capturing the current host backtrace as its stack.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Backtrace::force_capture().to_string(),
        }
    }

    /// Create an error object with an explicit stack string.
    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Storage behind a byte array or array buffer.
#[derive(Clone)]
pub enum Backing {
    /// Host-owned bytes shared by every window onto them.
    Owned(Arc<Mutex<Vec<u8>>>),
    /// The guest's linear memory.
    Linear,
}

impl Backing {
    /// Whether two backings refer to the same storage.
    pub fn same_as(&self, other: &Backing) -> bool {
        match (self, other) {
            (Self::Owned(a), Self::Owned(b)) => Arc::ptr_eq(a, b),
            (Self::Linear, Self::Linear) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(bytes) => {
                let len = bytes.lock().unwrap_or_else(PoisonError::into_inner).len();
                write!(f, "Owned({} bytes)", len)
            }
            Self::Linear => f.write_str("Linear"),
        }
    }
}

/// A raw buffer object (the result of asking a byte array for its buffer).
#[derive(Debug, Clone)]
pub struct ArrayBuffer {
    pub backing: Backing,
    pub byte_length: usize,
}

impl ArrayBuffer {
    /// The buffer object for the guest's linear memory at its current size.
    pub fn linear(byte_length: usize) -> Self {
        Self {
            backing: Backing::Linear,
            byte_length,
        }
    }
}

/// A window of `len` bytes at `offset` into some backing storage.
#[derive(Debug, Clone)]
pub struct ByteArray {
    backing: Backing,
    offset: usize,
    len: usize,
}

impl ByteArray {
    /// A zero-filled owned array of `len` bytes.
    pub fn with_length(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// An owned array holding `bytes`.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            backing: Backing::Owned(Arc::new(Mutex::new(bytes))),
            offset: 0,
            len,
        }
    }

    /// A window onto linear memory.
    pub fn linear(offset: usize, len: usize) -> Self {
        Self {
            backing: Backing::Linear,
            offset,
            len,
        }
    }

    /// A view spanning a whole buffer.
    pub fn over(buffer: &ArrayBuffer) -> Self {
        Self {
            backing: buffer.backing.clone(),
            offset: 0,
            len: buffer.byte_length,
        }
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.backing, Backing::Linear)
    }

    /// The buffer this array is a window onto.
    pub fn buffer(&self) -> ArrayBuffer {
        let byte_length = match &self.backing {
            Backing::Owned(bytes) => bytes.lock().unwrap_or_else(PoisonError::into_inner).len(),
            Backing::Linear => self.offset + self.len,
        };
        ArrayBuffer {
            backing: self.backing.clone(),
            byte_length,
        }
    }

    /// A window sharing this array's storage.
    ///
    /// Bounds are clamped to the array and `end` never precedes `start`,
    /// so the result is always a valid (possibly empty) window.
    pub fn subarray(&self, start: usize, end: usize) -> ByteArray {
        let start = start.min(self.len);
        let end = end.clamp(start, self.len);
        Self {
            backing: self.backing.clone(),
            offset: self.offset + start,
            len: end - start,
        }
    }

    /// Copy out the bytes of an owned array. `None` for linear windows.
    pub fn to_vec(&self) -> Option<Vec<u8>> {
        self.with_owned(|bytes| bytes.to_vec())
    }

    /// Run `f` over the owned bytes of this window. `None` for linear windows.
    pub fn with_owned<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        match &self.backing {
            Backing::Owned(bytes) => {
                let guard = bytes.lock().unwrap_or_else(PoisonError::into_inner);
                Some(f(&guard[self.offset..self.offset + self.len]))
            }
            Backing::Linear => None,
        }
    }

    /// Run `f` over the owned bytes of this window, mutably. `None` for linear windows.
    pub fn with_owned_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        match &self.backing {
            Backing::Owned(bytes) => {
                let mut guard = bytes.lock().unwrap_or_else(PoisonError::into_inner);
                Some(f(&mut guard[self.offset..self.offset + self.len]))
            }
            Backing::Linear => None,
        }
    }

    /// Check that `len` bytes at `at` fit inside this window.
    pub fn check_range(&self, at: usize, len: usize) -> Result<(), HostError> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(HostError::OutOfBounds {
                start: at,
                end: at.saturating_add(len),
                len: self.len,
            }),
        }
    }
}

/// Every kind of value the guest can hold a handle to.
#[derive(Debug, Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(serde_json::Value),
    Bytes(ByteArray),
    Buffer(ArrayBuffer),
    /// The guest's linear memory object.
    Memory,
    Error(ErrorValue),
    Random(Arc<dyn RandomSource>),
    Loader(Arc<dyn ModuleLoader>),
}

impl HostValue {
    /// Short kind name used in type-mismatch messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Json(_) => "json",
            Self::Bytes(_) => "bytes",
            Self::Buffer(_) => "buffer",
            Self::Memory => "memory",
            Self::Error(_) => "error",
            Self::Random(_) => "random source",
            Self::Loader(_) => "module loader",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn as_str(&self) -> Result<&str, HostError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(HostError::type_mismatch("string", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&ByteArray, HostError> {
        match self {
            Self::Bytes(b) => Ok(b),
            other => Err(HostError::type_mismatch("bytes", other)),
        }
    }

    pub fn as_random(&self) -> Result<&Arc<dyn RandomSource>, HostError> {
        match self {
            Self::Random(r) => Ok(r),
            other => Err(HostError::type_mismatch("random source", other)),
        }
    }

    pub fn as_loader(&self) -> Result<&Arc<dyn ModuleLoader>, HostError> {
        match self {
            Self::Loader(l) => Ok(l),
            other => Err(HostError::type_mismatch("module loader", other)),
        }
    }

    /// The JSON form of plain data values; `None` for objects without one.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
            Self::String(s) => Some(serde_json::Value::String(s.clone())),
            Self::Json(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<ErrorValue> for HostValue {
    fn from(e: ErrorValue) -> Self {
        Self::Error(e)
    }
}
