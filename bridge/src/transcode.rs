//! String and byte transcoding between host values and guest linear memory.
//!
//! Every routine here may call back into the guest allocator, which may grow
//! memory. Views are therefore fetched through the [`ViewCache`] immediately
//! before each read or write and never held across an allocator call.
//!
//! [`ViewCache`]: crate::memory::ViewCache

use tracing::{debug, trace};
use wasmtime::AsContextMut;

use crate::error::BridgeError;
use crate::exports::GuestExports;
use crate::host_impl::HostState;
use crate::memory::addr;

/// A region of linear memory owned by whoever holds the descriptor.
///
/// `capacity` is the size the region was allocated with and is what gets
/// passed back to `free`; `len` is how many of those bytes are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub ptr: i32,
    pub len: usize,
    pub capacity: usize,
}

impl TransferDescriptor {
    /// A descriptor whose length and capacity coincide, as returned by the guest.
    pub fn exact(ptr: i32, len: usize) -> Self {
        Self {
            ptr,
            len,
            capacity: len,
        }
    }

    /// The `(ptr, len)` pair handed to the guest.
    pub fn abi(&self) -> (i32, i32) {
        (self.ptr, self.len as i32)
    }
}

fn abi_len(len: usize) -> Result<i32, BridgeError> {
    i32::try_from(len).map_err(|_| BridgeError::MemoryError(format!("length {} exceeds the guest address space", len)))
}

/// Allocate `len` bytes in the guest.
pub fn alloc<S>(store: &mut S, exports: &GuestExports, len: usize) -> Result<i32, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    Ok(exports.malloc.call(&mut *store, abi_len(len)?)?)
}

/// Return a region to the guest allocator.
pub fn free<S>(store: &mut S, exports: &GuestExports, desc: TransferDescriptor) -> Result<(), BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    trace!(ptr = desc.ptr, size = desc.capacity, "free");
    exports.free.call(&mut *store, (desc.ptr, abi_len(desc.capacity)?))?;
    Ok(())
}

/// Strict UTF-8 decode of `len` bytes at `ptr`.
pub fn decode_str<S>(store: &mut S, exports: &GuestExports, ptr: i32, len: usize) -> Result<String, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    let (data, state) = exports.memory.data_and_store_mut(store.as_context_mut());
    let bytes = state.views.byte_view(data).subarray(addr(ptr), len)?;
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

/// Encode `text` as UTF-8 into a fresh guest allocation.
///
/// The first allocation is sized to the UTF-16 length of `text`, which is
/// exact for ASCII. The first non-ASCII character triggers one `realloc` to
/// the bytes written so far plus three bytes per remaining UTF-16 unit, the
/// worst case for UTF-8, and the tail is encoded into it. The descriptor's
/// `len` is the number of bytes actually written.
pub fn pass_str<S>(store: &mut S, exports: &GuestExports, text: &str) -> Result<TransferDescriptor, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    let units = text.encode_utf16().count();
    let mut capacity = units;
    let mut ptr = alloc(store, exports, capacity)?;

    let ascii = text.bytes().take_while(u8::is_ascii).count();
    let written = write_bytes(store, exports, addr(ptr), &text.as_bytes()[..ascii]);
    free_on_err(store, exports, TransferDescriptor { ptr, len: 0, capacity }, written)?;

    let mut len = ascii;
    if ascii < text.len() {
        let tail = &text[ascii..];
        let new_capacity = ascii + tail.encode_utf16().count() * 3;
        trace!(ascii, tail_units = new_capacity - ascii, "string has non-ASCII tail, reallocating");
        ptr = exports
            .realloc
            .call(&mut *store, (ptr, abi_len(capacity)?, abi_len(new_capacity)?))?;
        capacity = new_capacity;

        let written = write_bytes(store, exports, addr(ptr) + ascii, tail.as_bytes());
        free_on_err(store, exports, TransferDescriptor { ptr, len: ascii, capacity }, written)?;
        len += tail.len();
    }

    trace!(ptr, len, capacity, "passed string");
    Ok(TransferDescriptor { ptr, len, capacity })
}

/// Decode a guest-owned string and free it, even when decoding fails.
pub fn take_string<S>(store: &mut S, exports: &GuestExports, desc: TransferDescriptor) -> Result<String, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    let decoded = decode_str(store, exports, desc.ptr, desc.len);
    free(store, exports, desc)?;
    decoded
}

/// Copy `bytes` into a fresh guest allocation.
pub fn pass_bytes<S>(store: &mut S, exports: &GuestExports, bytes: &[u8]) -> Result<TransferDescriptor, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    let desc = TransferDescriptor::exact(alloc(store, exports, bytes.len())?, bytes.len());
    let written = write_at(store, exports, desc.ptr, bytes);
    free_on_err(store, exports, desc, written)?;
    Ok(desc)
}

/// Copy `bytes` into guest memory at `ptr`.
pub fn write_at<S>(store: &mut S, exports: &GuestExports, ptr: i32, bytes: &[u8]) -> Result<(), BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    write_bytes(store, exports, addr(ptr), bytes)
}

fn write_bytes<S>(store: &mut S, exports: &GuestExports, at: usize, bytes: &[u8]) -> Result<(), BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    let (data, state) = exports.memory.data_and_store_mut(store.as_context_mut());
    state.views.byte_view_mut(data).write(at, bytes)?;
    Ok(())
}

/// Free `desc` when `result` failed, then pass `result` through.
///
/// A failure to free is logged; the original error wins.
pub(crate) fn free_on_err<S, T>(
    store: &mut S,
    exports: &GuestExports,
    desc: TransferDescriptor,
    result: Result<T, BridgeError>,
) -> Result<T, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    if result.is_err() {
        if let Err(e) = free(store, exports, desc) {
            debug!(ptr = desc.ptr, "failed to free region after error: {}", e);
        }
    }
    result
}

/// Copy `len` bytes at `ptr` out into a new host vector.
pub fn copy_from_guest<S>(store: &mut S, exports: &GuestExports, ptr: i32, len: usize) -> Result<Vec<u8>, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    with_guest_bytes(store, exports, ptr, len, |bytes| bytes.to_vec())
}

/// Run `f` over `len` bytes at `ptr` without copying them out.
pub fn with_guest_bytes<S, R>(
    store: &mut S,
    exports: &GuestExports,
    ptr: i32,
    len: usize,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    let (data, state) = exports.memory.data_and_store_mut(store.as_context_mut());
    let bytes = state.views.byte_view(data).subarray(addr(ptr), len)?;
    Ok(f(bytes))
}

/// Copy a guest-owned byte region out and free it.
pub fn take_bytes<S>(store: &mut S, exports: &GuestExports, desc: TransferDescriptor) -> Result<Vec<u8>, BridgeError>
where
    S: AsContextMut<Data = HostState>,
{
    let copied = copy_from_guest(store, exports, desc.ptr, desc.len);
    free(store, exports, desc)?;
    copied
}
