//! The guest's allocator, stack and exception exports, resolved once per
//! instance.

use wasmtime::{AsContextMut, Instance, Memory, TypedFunc};

use crate::error::BridgeError;

pub const MEMORY: &str = "memory";
pub const MALLOC: &str = "malloc";
pub const REALLOC: &str = "realloc";
pub const FREE: &str = "free";
pub const ADD_TO_STACK_POINTER: &str = "add_to_stack_pointer";
pub const EXN_STORE: &str = "exn_store";
pub const START: &str = "start";

/// Typed handles to the guest exports every marshalling routine needs.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    /// `(size) -> ptr`
    pub malloc: TypedFunc<i32, i32>,
    /// `(ptr, old_size, new_size) -> ptr`
    pub realloc: TypedFunc<(i32, i32, i32), i32>,
    /// `(ptr, size)`
    pub free: TypedFunc<(i32, i32), ()>,
    /// `(delta) -> new stack pointer`
    pub stack_pointer: TypedFunc<i32, i32>,
    /// `(handle)`; optional, notified when a host import raises.
    pub exn_store: Option<TypedFunc<i32, ()>>,
}

impl GuestExports {
    /// Look up every export on a fresh instance.
    pub fn resolve(mut store: impl AsContextMut, instance: &Instance) -> Result<Self, BridgeError> {
        let memory = instance
            .get_memory(&mut store, MEMORY)
            .ok_or_else(|| BridgeError::MissingExport(MEMORY.into()))?;
        let malloc = instance.get_typed_func::<i32, i32>(&mut store, MALLOC)?;
        let realloc = instance.get_typed_func::<(i32, i32, i32), i32>(&mut store, REALLOC)?;
        let free = instance.get_typed_func::<(i32, i32), ()>(&mut store, FREE)?;
        let stack_pointer = instance.get_typed_func::<i32, i32>(&mut store, ADD_TO_STACK_POINTER)?;
        let exn_store = match instance.get_func(&mut store, EXN_STORE) {
            Some(func) => Some(func.typed::<i32, ()>(&store)?),
            None => None,
        };
        Ok(Self {
            memory,
            malloc,
            realloc,
            free,
            stack_pointer,
            exn_store,
        })
    }
}
