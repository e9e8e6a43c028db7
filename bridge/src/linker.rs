//! Host function registration via Wasmtime linker.
//!
//! Registers the `keystone_host` import surface. All parameters and results
//! are i32. Imports that can raise on the host side go through
//! [`handle_error`]: a [`HostError`] is captured into the handle table, the
//! guest's `exn_store` export is notified and the import returns 0. Anything
//! else (bad UTF-8, stale handles outside the error bridge, allocator
//! traps) propagates as a trap.

use std::sync::Arc;

use keystone_hostapi::{ArrayBuffer, ByteArray, ErrorValue, Handle, HostError, HostValue, RandomSource};
use tracing::debug;
use wasmtime::{Caller, Linker};

use crate::error::{BridgeError, GuestThrow};
use crate::exports::GuestExports;
use crate::host_impl::HostState;
use crate::memory::addr;
use crate::transcode::{self, TransferDescriptor};

/// Module name every guest import must come from.
pub const IMPORT_MODULE: &str = "keystone_host";

/// Every import this linker provides.
pub const IMPORT_NAMES: &[&str] = &[
    "string_new",
    "json_parse",
    "object_drop_ref",
    "object_clone_ref",
    "is_undefined",
    "random_source",
    "random_fill",
    "random_fill_array",
    "module_loader",
    "require",
    "memory",
    "buffer",
    "length",
    "bytes_new",
    "bytes_new_with_length",
    "bytes_set",
    "bytes_subarray",
    "error_new",
    "error_stack",
    "console_error",
    "throw",
    "rethrow",
];

/// Register all `keystone_host` functions with the linker.
pub fn register_host_functions(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    register_values(linker)?;
    register_random(linker)?;
    register_loader(linker)?;
    register_bytes(linker)?;
    register_errors(linker)?;
    Ok(())
}

/// Run a fallible import body through the error bridge.
///
/// Host errors become a captured exception and the sentinel `R::default()`;
/// every other error traps.
fn handle_error<R: Default>(
    caller: &mut Caller<'_, HostState>,
    import: &'static str,
    result: Result<R, BridgeError>,
) -> anyhow::Result<R> {
    let err = match result {
        Ok(value) => return Ok(value),
        Err(BridgeError::Host(err)) => err,
        Err(fatal) => return Err(fatal.into()),
    };
    debug!(import, error = %err, "host import raised");
    let handle = caller.data_mut().capture(err.into_value());
    if let Some(exn_store) = caller.data().exports()?.exn_store {
        exn_store.call(&mut *caller, handle.as_raw())?;
    }
    Ok(R::default())
}

fn len_arg(len: i32) -> usize {
    addr(len)
}

/// Resolve a raw handle to a byte array.
fn byte_array(state: &HostState, raw: i32) -> Result<ByteArray, HostError> {
    state.value(raw)?.as_bytes().cloned()
}

fn random_source(state: &HostState, raw: i32) -> Result<Arc<dyn RandomSource>, HostError> {
    state.value(raw)?.as_random().cloned()
}

/// Size of the guest's linear memory in bytes.
fn memory_len(caller: &Caller<'_, HostState>) -> Result<usize, BridgeError> {
    let memory = caller.data().exports()?.memory;
    Ok(memory.data_size(caller))
}

/// Copy the contents of a byte array, reading linear windows from memory.
fn array_contents(caller: &mut Caller<'_, HostState>, array: &ByteArray) -> Result<Vec<u8>, BridgeError> {
    match array.to_vec() {
        Some(bytes) => Ok(bytes),
        None => {
            let exports = caller.data().exports()?;
            transcode::copy_from_guest(caller, &exports, array.offset() as i32, array.len())
        }
    }
}

// ── Values and handles ──

fn register_values(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        IMPORT_MODULE,
        "string_new",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let exports = caller.data().exports()?;
            let text = transcode::decode_str(&mut caller, &exports, ptr, len_arg(len))?;
            Ok(caller.data_mut().add(HostValue::String(text)))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "json_parse",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let exports = caller.data().exports()?;
            let text = transcode::decode_str(&mut caller, &exports, ptr, len_arg(len))?;
            let parsed = serde_json::from_str::<serde_json::Value>(&text)
                .map_err(HostError::from)
                .map_err(BridgeError::from)
                .map(|json| caller.data_mut().add(HostValue::Json(json)));
            handle_error(&mut caller, "json_parse", parsed)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "object_drop_ref",
        |mut caller: Caller<'_, HostState>, handle: i32| {
            caller.data_mut().table.drop(Handle::from_raw(handle));
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "object_clone_ref",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<i32> {
            let value = caller.data().value(handle)?.clone();
            Ok(caller.data_mut().add(value))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "is_undefined",
        |caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<i32> {
            Ok(caller.data().value(handle)?.is_undefined() as i32)
        },
    )?;

    Ok(())
}

// ── Randomness ──

fn register_random(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        IMPORT_MODULE,
        "random_source",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<i32> {
            let source = match caller.data().caps.random.clone() {
                Some(random) => Ok(caller.data_mut().add(HostValue::Random(random))),
                None => Err(HostError::Unavailable("random source").into()),
            };
            handle_error(&mut caller, "random_source", source)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "random_fill",
        |mut caller: Caller<'_, HostState>, source: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
            let filled = fill_linear(&mut caller, source, addr(ptr), len_arg(len));
            handle_error(&mut caller, "random_fill", filled)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "random_fill_array",
        |mut caller: Caller<'_, HostState>, source: i32, array: i32| -> anyhow::Result<()> {
            let filled = fill_array(&mut caller, source, array);
            handle_error(&mut caller, "random_fill_array", filled)
        },
    )?;

    Ok(())
}

/// Fill `len` bytes of linear memory at `at` in place.
fn fill_linear(caller: &mut Caller<'_, HostState>, source: i32, at: usize, len: usize) -> Result<(), BridgeError> {
    let random = random_source(caller.data(), source)?;
    let memory = caller.data().exports()?.memory;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    let mut view = state.views.byte_view_mut(data);
    random.fill(view.subarray_mut(at, len)?)?;
    Ok(())
}

fn fill_array(caller: &mut Caller<'_, HostState>, source: i32, array: i32) -> Result<(), BridgeError> {
    let random = random_source(caller.data(), source)?;
    let target = byte_array(caller.data(), array)?;
    match target.with_owned_mut(|bytes| random.fill(bytes)) {
        Some(filled) => Ok(filled?),
        None => fill_linear(caller, source, target.offset(), target.len()),
    }
}

// ── Module loading ──

fn register_loader(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        IMPORT_MODULE,
        "module_loader",
        |mut caller: Caller<'_, HostState>| -> i32 {
            match caller.data().caps.loader.clone() {
                Some(loader) => caller.data_mut().add(HostValue::Loader(loader)),
                None => Handle::UNDEFINED.as_raw(),
            }
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "require",
        |mut caller: Caller<'_, HostState>, loader: i32, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let exports = caller.data().exports()?;
            let name = transcode::decode_str(&mut caller, &exports, ptr, len_arg(len))?;
            let loaded = caller
                .data()
                .value(loader)
                .and_then(HostValue::as_loader)
                .cloned()
                .and_then(|loader| loader.require(&name))
                .map(|module| caller.data_mut().add(module))
                .map_err(BridgeError::from);
            handle_error(&mut caller, "require", loaded)
        },
    )?;

    Ok(())
}

// ── Memory and byte arrays ──

fn register_bytes(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        IMPORT_MODULE,
        "memory",
        |mut caller: Caller<'_, HostState>| -> i32 { caller.data_mut().add(HostValue::Memory) },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "buffer",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<i32> {
            let buffer = match caller.data().value(handle)? {
                HostValue::Memory => ArrayBuffer::linear(memory_len(&caller)?),
                HostValue::Bytes(array) => array.buffer(),
                HostValue::Buffer(buffer) => buffer.clone(),
                other => return Err(HostError::type_mismatch("memory or byte array", other).into()),
            };
            Ok(caller.data_mut().add(HostValue::Buffer(buffer)))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "length",
        |caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<i32> {
            let len = match caller.data().value(handle)? {
                HostValue::Bytes(array) => array.len(),
                HostValue::Buffer(buffer) => buffer.byte_length,
                other => return Err(HostError::type_mismatch("byte array", other).into()),
            };
            Ok(len as i32)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "bytes_new",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<i32> {
            let array = match caller.data().value(handle)? {
                HostValue::Buffer(buffer) => ByteArray::over(buffer),
                HostValue::Memory => ByteArray::linear(0, memory_len(&caller)?),
                other => return Err(HostError::type_mismatch("buffer", other).into()),
            };
            Ok(caller.data_mut().add(HostValue::Bytes(array)))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "bytes_new_with_length",
        |mut caller: Caller<'_, HostState>, len: i32| -> i32 {
            caller
                .data_mut()
                .add(HostValue::Bytes(ByteArray::with_length(len_arg(len))))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "bytes_set",
        |mut caller: Caller<'_, HostState>, target: i32, source: i32, offset: i32| -> anyhow::Result<()> {
            let target = byte_array(caller.data(), target)?;
            let source = byte_array(caller.data(), source)?;
            let bytes = array_contents(&mut caller, &source)?;
            let offset = addr(offset);
            target.check_range(offset, bytes.len())?;
            let written = target.with_owned_mut(|dst| dst[offset..offset + bytes.len()].copy_from_slice(&bytes));
            if written.is_none() {
                let exports = caller.data().exports()?;
                let at = target.offset() + offset;
                transcode::write_at(&mut caller, &exports, at as i32, &bytes)?;
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "bytes_subarray",
        |mut caller: Caller<'_, HostState>, handle: i32, start: i32, end: i32| -> anyhow::Result<i32> {
            let array = byte_array(caller.data(), handle)?.subarray(addr(start), addr(end));
            Ok(caller.data_mut().add(HostValue::Bytes(array)))
        },
    )?;

    Ok(())
}

// ── Errors and console ──

/// Write a `(ptr, len)` pair into the two words at `retptr`.
fn store_slice(
    caller: &mut Caller<'_, HostState>,
    exports: &GuestExports,
    retptr: i32,
    desc: TransferDescriptor,
) -> Result<(), BridgeError> {
    let (data, state) = exports.memory.data_and_store_mut(caller);
    let mut words = state.views.word_view_mut(data);
    let base = addr(retptr) / 4;
    let (ptr, len) = desc.abi();
    words.set(base + 1, len)?;
    words.set(base, ptr)?;
    Ok(())
}

fn register_errors(linker: &mut Linker<HostState>) -> Result<(), BridgeError> {
    linker.func_wrap(
        IMPORT_MODULE,
        "error_new",
        |mut caller: Caller<'_, HostState>| -> i32 {
            caller
                .data_mut()
                .add(HostValue::Error(ErrorValue::new(String::new())))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "error_stack",
        |mut caller: Caller<'_, HostState>, retptr: i32, handle: i32| -> anyhow::Result<()> {
            let stack = match caller.data().value(handle)? {
                HostValue::Error(e) => e.stack.clone(),
                other => return Err(HostError::type_mismatch("error", other).into()),
            };
            let exports = caller.data().exports()?;
            let desc = transcode::pass_str(&mut caller, &exports, &stack)?;
            let stored = store_slice(&mut caller, &exports, retptr, desc);
            transcode::free_on_err(&mut caller, &exports, desc, stored)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "console_error",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let exports = caller.data().exports()?;
            let message = transcode::take_string(&mut caller, &exports, TransferDescriptor::exact(ptr, len_arg(len)))?;
            caller.data().caps.sink.write_line(&message);
            Ok(())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "throw",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let exports = caller.data().exports()?;
            let message = transcode::decode_str(&mut caller, &exports, ptr, len_arg(len))?;
            Err(GuestThrow(HostValue::Error(ErrorValue::new(message))).into())
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "rethrow",
        |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<()> {
            let handle = Handle::from_raw(handle);
            let value = caller
                .data_mut()
                .table
                .take(handle)
                .ok_or(HostError::StaleHandle(handle.index()))?;
            Err(GuestThrow(value).into())
        },
    )?;

    Ok(())
}
