//! Per-instance mutable state held in the Wasmtime `Store`.
//!
//! `HostState` is the bridge context: the handle table, the memory view
//! cache, the exception slot, the capability set and the resolved guest
//! exports. One exists per guest instance, so independent bridges in the
//! same process never share any of it.

use keystone_hostapi::{Capabilities, Handle, HandleTable, HostError, HostValue};
use tracing::trace;
use wasmtime::StoreLimits;

use crate::error::BridgeError;
use crate::exports::GuestExports;
use crate::memory::ViewCache;

/// Per-instance state held in the Wasmtime `Store`.
pub struct HostState {
    /// Host values referenced by the guest.
    pub table: HandleTable,
    /// Buffer identity of the last byte/word views.
    pub views: ViewCache,
    /// Handle of the most recent error raised by a host import during the
    /// current call, if any.
    pub exception: Option<Handle>,
    /// Capabilities the guest may request.
    pub caps: Capabilities,
    /// Guest exports; `None` until instantiation completes.
    pub exports: Option<GuestExports>,
    /// Memory ceiling enforced through the store limiter.
    pub limits: StoreLimits,
}

impl HostState {
    pub fn new(caps: Capabilities, limits: StoreLimits) -> Self {
        Self {
            table: HandleTable::new(),
            views: ViewCache::new(),
            exception: None,
            caps,
            exports: None,
            limits,
        }
    }

    /// The resolved guest exports.
    pub fn exports(&self) -> Result<GuestExports, BridgeError> {
        self.exports
            .clone()
            .ok_or_else(|| BridgeError::MissingExport("guest exports not resolved yet".into()))
    }

    /// Resolve a raw handle from the guest.
    pub fn value(&self, raw: i32) -> Result<&HostValue, HostError> {
        let handle = Handle::from_raw(raw);
        self.table
            .get(handle)
            .ok_or(HostError::StaleHandle(handle.index()))
    }

    /// Store a new value and return the raw handle for the guest.
    pub fn add(&mut self, value: HostValue) -> i32 {
        self.table.add(value).as_raw()
    }

    /// Capture an error raised while servicing an import and record it in
    /// the exception slot.
    ///
    /// An overwritten handle is released when the guest has no `exn_store`,
    /// since it was never told about it.
    pub fn capture(&mut self, value: HostValue) -> Handle {
        let handle = self.table.add(value);
        if let Some(previous) = self.exception.replace(handle) {
            trace!(previous = previous.index(), "exception slot overwritten");
            if !self.guest_owns_exceptions() {
                self.table.drop(previous);
            }
        }
        handle
    }

    /// Whether captured handles are handed to the guest through `exn_store`.
    pub fn guest_owns_exceptions(&self) -> bool {
        self.exports.as_ref().is_some_and(|e| e.exn_store.is_some())
    }

    /// Read and clear the exception slot.
    pub fn take_exception(&mut self) -> Option<Handle> {
        self.exception.take()
    }
}
