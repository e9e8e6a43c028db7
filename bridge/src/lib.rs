//! `keystone-bridge`: Wasmtime-based marshalling bridge between host values
//! and a guest module's linear memory.
//!
//! The guest sees a flat byte array and integers. This crate gives it
//! access to host values anyway:
//!
//! - **Handles:** host values live in a per-instance table, the guest holds indices
//! - **Views:** bounds-checked byte/word views revalidated after every memory growth
//! - **Transcoding:** UTF-8 strings and byte buffers copied in and out of guest allocations
//! - **Scratch frames:** multi-word results returned through a reserved stack region
//! - **Error bridge:** host import failures captured as guest-visible exceptions, and
//!   guest failures reconstructed as typed host errors
//! - **ABI validation:** allocator and stack exports checked before instantiation
//!
//! The primary entry point is [`Bridge::call`], with typed wrappers for the
//! wallet exports in [`catalog`].

pub mod error;
pub mod config;
pub mod memory;
pub mod exports;
pub mod host_impl;
pub mod transcode;
pub mod scratch;
pub mod validation;
pub mod linker;
pub mod runtime;
pub mod catalog;

pub use catalog::AddressRequest;
pub use config::BridgeConfig;
pub use error::{BridgeError, GuestThrow};
pub use runtime::{Arg, Bridge, ReturnKind, Returned};
pub use transcode::TransferDescriptor;
