//! `keystone-hostapi`: host-side values, handle table and capability traits
//! for the Keystone WASM bridge.
//!
//! The guest module has no object model of its own. Everything it needs to
//! refer to on the host side (strings, JSON documents, byte arrays, error
//! objects, capability objects) lives in a [`HandleTable`] and is passed
//! across the boundary as a small integer [`Handle`].
//!
//! This crate provides:
//!
//! - `HostValue`: the closed set of values a handle can refer to
//! - `HandleTable`: array-plus-free-list slot allocator with reserved sentinels
//! - `RandomSource` / `ModuleLoader` / `ByteSink`: host capability traits
//! - `Capabilities`: the capability set chosen at bridge construction
//! - `OsRandom`, `NoLoader`, `TracingSink`: production adapters
//! - `SeededRandom`, `FailingRandom`, `StaticLoader`, `MemSink`: in-memory
//!   adapters for tests
//! - `HostError`: failures raised by host capabilities and value accessors

pub mod error;
pub mod value;
pub mod handle;
pub mod traits;
pub mod os_caps;
pub mod mem_caps;

// Re-export commonly used types at the crate root.
pub use error::HostError;
pub use value::{ArrayBuffer, Backing, ByteArray, ErrorValue, HostValue};
pub use handle::{Handle, HandleTable, RESERVED_HANDLES};
pub use traits::{ByteSink, Capabilities, ModuleLoader, RandomSource};
pub use os_caps::{NoLoader, OsRandom, TracingSink};
pub use mem_caps::{FailingRandom, MemSink, SeededRandom, StaticLoader};
