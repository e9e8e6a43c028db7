//! Scratch frames: call-scoped stack reservations for multi-word results.
//!
//! Exports that return more than one value write them into a frame the host
//! reserved on the guest's shadow stack and pass in as the first argument.
//! A [`ScratchFrame`] is the guard for such a reservation; the stack pointer
//! is restored by [`ScratchFrame::release`] or, failing that, on drop.

use tracing::warn;
use wasmtime::AsContextMut;

use crate::error::BridgeError;
use crate::exports::GuestExports;
use crate::host_impl::HostState;
use crate::memory::addr;

/// Bytes reserved per frame: four result words.
pub const SCRATCH_FRAME_SIZE: i32 = 16;

/// A reserved region of the guest stack.
pub struct ScratchFrame<'s, S: AsContextMut<Data = HostState>> {
    store: &'s mut S,
    exports: GuestExports,
    base: i32,
    released: bool,
}

impl<'s, S: AsContextMut<Data = HostState>> ScratchFrame<'s, S> {
    /// Move the stack pointer down by one frame and zero the frame.
    pub fn reserve(store: &'s mut S, exports: &GuestExports) -> Result<Self, BridgeError> {
        let base = exports.stack_pointer.call(&mut *store, -SCRATCH_FRAME_SIZE)?;
        let mut frame = Self {
            store,
            exports: exports.clone(),
            base,
            released: false,
        };
        if base % 4 != 0 {
            return Err(BridgeError::MemoryError(format!("scratch frame at {} is not word aligned", base)));
        }
        let (data, state) = frame.exports.memory.data_and_store_mut(frame.store.as_context_mut());
        state
            .views
            .byte_view_mut(data)
            .fill_zero(addr(base), SCRATCH_FRAME_SIZE as usize)?;
        Ok(frame)
    }

    /// Guest address of the frame.
    pub fn base(&self) -> i32 {
        self.base
    }

    /// The store the frame was reserved in, for the call that fills it.
    pub fn store(&mut self) -> &mut S {
        self.store
    }

    /// Read the first `N` result words.
    pub fn read_words<const N: usize>(&mut self) -> Result<[i32; N], BridgeError> {
        let (data, state) = self.exports.memory.data_and_store_mut(self.store.as_context_mut());
        let words = state.views.word_view(data);
        let first = addr(self.base) / 4;
        let mut out = [0i32; N];
        for (k, slot) in out.iter_mut().enumerate() {
            *slot = words.get(first + k)?;
        }
        Ok(out)
    }

    /// Restore the stack pointer, reporting failure.
    pub fn release(mut self) -> Result<(), BridgeError> {
        self.released = true;
        self.exports
            .stack_pointer
            .call(&mut *self.store, SCRATCH_FRAME_SIZE)?;
        Ok(())
    }
}

impl<S: AsContextMut<Data = HostState>> Drop for ScratchFrame<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.exports.stack_pointer.call(&mut *self.store, SCRATCH_FRAME_SIZE) {
            warn!(base = self.base, "failed to restore stack pointer: {:#}", e);
        }
    }
}
