//! Bridge runtime: Wasmtime engine, module loading, and export calls.
//!
//! The `Bridge` struct is the main entry point. It loads a guest module,
//! validates its ABI, instantiates it once, and then drives every export
//! call through the same store, so host values and guest allocations live
//! as long as the bridge does.

use std::path::Path;

use blake3::Hash;
use keystone_hostapi::{Capabilities, Handle, HandleTable, HostError, HostValue};
use tracing::{debug, info};
use wasmtime::{Config, Engine, Instance, Linker, Module, Store, StoreLimitsBuilder, Trap, Val};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, GuestThrow};
use crate::exports::{GuestExports, START};
use crate::host_impl::HostState;
use crate::linker::register_host_functions;
use crate::memory::ViewCache;
use crate::scratch::ScratchFrame;
use crate::transcode::{self, TransferDescriptor};
use crate::validation::validate_module;

/// An argument to a guest export.
///
/// Strings and byte slices are copied into fresh guest allocations whose
/// ownership passes to the guest. Host values are added to the handle table
/// and the guest takes ownership of the handle.
#[derive(Debug, Clone)]
pub enum Arg<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
    I32(i32),
    U32(u32),
    Bool(bool),
    Value(HostValue),
}

impl Arg<'_> {
    /// Number of i32 parameters this argument flattens to.
    pub(crate) fn width(&self) -> usize {
        match self {
            Arg::Str(_) | Arg::Bytes(_) => 2,
            _ => 1,
        }
    }
}

/// How an export returns its result through the scratch frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Words `[ptr, len, err_handle, is_err]`, decoded as UTF-8.
    String,
    /// Words `[ptr, len, err_handle, is_err]`, copied out.
    Bytes,
    /// Words `[handle, err_handle, is_err]`.
    Value,
}

/// A successfully decoded export result.
#[derive(Debug, Clone)]
pub enum Returned {
    String(String),
    Bytes(Vec<u8>),
    Value(HostValue),
}

impl Returned {
    pub fn into_string(self) -> Result<String, BridgeError> {
        match self {
            Returned::String(s) => Ok(s),
            other => Err(BridgeError::Unexpected(format!("expected a string, got {:?}", other))),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, BridgeError> {
        match self {
            Returned::Bytes(b) => Ok(b),
            other => Err(BridgeError::Unexpected(format!("expected bytes, got {:?}", other))),
        }
    }

    pub fn into_value(self) -> Result<HostValue, BridgeError> {
        match self {
            Returned::Value(v) => Ok(v),
            other => Err(BridgeError::Unexpected(format!("expected a host value, got {:?}", other))),
        }
    }
}

/// Resources handed to the guest as arguments, reclaimed if marshalling
/// fails before the call is made.
enum Passed {
    Region(TransferDescriptor),
    Value(Handle),
}

/// One guest instance and everything needed to call into it.
pub struct Bridge {
    store: Store<HostState>,
    instance: Instance,
    exports: GuestExports,
    config: BridgeConfig,
    digest: Hash,
}

impl Bridge {
    /// Compile, validate and instantiate a guest module.
    ///
    /// Accepts a binary module or its text format.
    pub fn new(wasm: &[u8], config: BridgeConfig, caps: Capabilities) -> Result<Self, BridgeError> {
        let digest = blake3::hash(wasm);
        let engine = create_engine(&config)?;
        let module = Module::new(&engine, wasm)?;
        info!(digest = %digest.to_hex(), size = wasm.len(), "guest module compiled");
        Self::instantiate(&engine, &module, config, caps, digest)
    }

    /// Load from a `.wasm` file path.
    pub fn from_file(path: &Path, config: BridgeConfig, caps: Capabilities) -> Result<Self, BridgeError> {
        let wasm = std::fs::read(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::new(&wasm, config, caps)
    }

    fn instantiate(
        engine: &Engine,
        module: &Module,
        config: BridgeConfig,
        caps: Capabilities,
        digest: Hash,
    ) -> Result<Self, BridgeError> {
        validate_module(module)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .instances(1)
            .build();
        let mut store = Store::new(engine, HostState::new(caps, limits));
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = config.fuel_limit {
            store.set_fuel(fuel)?;
        }

        let mut linker = Linker::new(engine);
        register_host_functions(&mut linker)?;
        let instance = linker.instantiate(&mut store, module).map_err(classify_trap)?;

        let exports = GuestExports::resolve(&mut store, &instance)?;
        store.data_mut().exports = Some(exports.clone());
        info!(
            digest = %digest.to_hex(),
            memory_bytes = exports.memory.data_size(&store),
            exn_store = exports.exn_store.is_some(),
            "guest instantiated"
        );

        let mut bridge = Self {
            store,
            instance,
            exports,
            config,
            digest,
        };

        if bridge.config.run_start {
            if let Some(start) = bridge.instance.get_func(&mut bridge.store, START) {
                let start = start.typed::<(), ()>(&bridge.store)?;
                debug!("running guest start export");
                bridge.refuel()?;
                let outcome = start.call(&mut bridge.store, ());
                bridge.settle_exception(None);
                outcome.map_err(classify_trap)?;
            }
        }

        Ok(bridge)
    }

    /// Reset the fuel budget for the next call.
    fn refuel(&mut self) -> Result<(), BridgeError> {
        if let Some(fuel) = self.config.fuel_limit {
            self.store.set_fuel(fuel)?;
        }
        Ok(())
    }

    /// Call an export that returns its result through a scratch frame.
    ///
    /// The export receives the frame base as its first parameter, followed
    /// by the flattened `args`. The stack pointer is restored on every exit
    /// path and every descriptor the guest returns is freed exactly once.
    pub fn call(&mut self, name: &str, args: &[Arg<'_>], ret: ReturnKind) -> Result<Returned, BridgeError> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| BridgeError::MissingExport(name.into()))?;
        let ty = func.ty(&self.store);
        let given = 1 + args.iter().map(Arg::width).sum::<usize>();
        if ty.params().len() != given {
            return Err(BridgeError::Signature {
                name: name.into(),
                expected: ty.params().len(),
                given,
            });
        }
        if ty.results().len() != 0 {
            return Err(BridgeError::Unexpected(format!(
                "export '{}' returns values directly; expected results through the scratch frame",
                name
            )));
        }

        debug!(export = name, args = args.len(), "calling guest export");
        self.settle_exception(None);
        self.refuel()?;

        let exports = self.exports.clone();
        let mut frame = ScratchFrame::reserve(&mut self.store, &exports)?;
        let mut params = vec![Val::I32(frame.base())];
        let mut passed = Vec::new();
        for arg in args {
            if let Err(e) = marshal(frame.store(), &exports, arg, &mut params, &mut passed) {
                reclaim(frame.store(), &exports, passed);
                return Err(match e {
                    BridgeError::Wasmtime(trap) => classify_trap(trap),
                    other => other,
                });
            }
        }

        let outcome = func.call(frame.store(), &params, &mut []);
        if let Some(fuel) = self.config.fuel_limit {
            // Top up so the frame can be restored even after fuel ran out.
            frame.store().set_fuel(fuel)?;
        }
        if let Err(trap) = outcome {
            drop(frame);
            self.settle_exception(None);
            return Err(classify_trap(trap));
        }

        let words: [i32; 4] = frame.read_words()?;
        frame.release()?;

        let (err_handle, is_err) = match ret {
            ReturnKind::String | ReturnKind::Bytes => (words[2], words[3]),
            ReturnKind::Value => (words[1], words[2]),
        };
        if is_err != 0 {
            let err_handle = Handle::from_raw(err_handle);
            self.settle_exception(Some(err_handle));
            let value = self
                .store
                .data_mut()
                .table
                .take(err_handle)
                .ok_or(HostError::StaleHandle(err_handle.index()))?;
            let err = BridgeError::from_thrown(value);
            debug!(export = name, error = %err, "guest returned an error");
            return Err(err);
        }
        self.settle_exception(None);

        match ret {
            ReturnKind::String => {
                let desc = TransferDescriptor::exact(words[0], words[1] as u32 as usize);
                Ok(Returned::String(transcode::take_string(&mut self.store, &exports, desc)?))
            }
            ReturnKind::Bytes => {
                let desc = TransferDescriptor::exact(words[0], words[1] as u32 as usize);
                Ok(Returned::Bytes(transcode::take_bytes(&mut self.store, &exports, desc)?))
            }
            ReturnKind::Value => Ok(Returned::Value(self.take_value(Handle::from_raw(words[0]))?)),
        }
    }

    /// Call an export that takes and returns plain i32 values.
    pub fn call_i32(&mut self, name: &str, args: &[i32]) -> Result<i32, BridgeError> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| BridgeError::MissingExport(name.into()))?;
        let ty = func.ty(&self.store);
        if ty.params().len() != args.len() || ty.results().len() != 1 {
            return Err(BridgeError::Signature {
                name: name.into(),
                expected: ty.params().len(),
                given: args.len(),
            });
        }
        self.settle_exception(None);
        self.refuel()?;
        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut results = [Val::I32(0)];
        let outcome = func.call(&mut self.store, &params, &mut results);
        self.settle_exception(None);
        outcome.map_err(classify_trap)?;
        results[0]
            .i32()
            .ok_or_else(|| BridgeError::Unexpected(format!("export '{}' did not return an i32", name)))
    }

    /// Clear the exception slot, before a call or after one.
    ///
    /// `consumed` is the error handle the guest returned, if any. A guest
    /// with an `exn_store` export owns every handle it was notified of; a
    /// guest without one never saw the handle, so it is released here.
    fn settle_exception(&mut self, consumed: Option<Handle>) {
        let state = self.store.data_mut();
        let Some(handle) = state.take_exception() else {
            return;
        };
        if Some(handle) == consumed {
            return;
        }
        debug!(handle = handle.index(), "guest handled a host exception");
        if !state.guest_owns_exceptions() {
            state.table.drop(handle);
        }
    }

    // ── Host-side access ──

    /// Copy a string into a fresh guest allocation owned by the caller.
    pub fn pass_str(&mut self, text: &str) -> Result<TransferDescriptor, BridgeError> {
        transcode::pass_str(&mut self.store, &self.exports, text)
    }

    /// Copy bytes into a fresh guest allocation owned by the caller.
    pub fn pass_bytes(&mut self, bytes: &[u8]) -> Result<TransferDescriptor, BridgeError> {
        transcode::pass_bytes(&mut self.store, &self.exports, bytes)
    }

    /// Decode a string in guest memory without taking ownership.
    pub fn decode_str(&mut self, ptr: i32, len: usize) -> Result<String, BridgeError> {
        transcode::decode_str(&mut self.store, &self.exports, ptr, len)
    }

    /// Decode and free a string region.
    pub fn take_string(&mut self, desc: TransferDescriptor) -> Result<String, BridgeError> {
        transcode::take_string(&mut self.store, &self.exports, desc)
    }

    /// Copy out and free a byte region.
    pub fn take_bytes(&mut self, desc: TransferDescriptor) -> Result<Vec<u8>, BridgeError> {
        transcode::take_bytes(&mut self.store, &self.exports, desc)
    }

    /// Run `f` over guest bytes in place.
    pub fn with_bytes<R>(&mut self, ptr: i32, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R, BridgeError> {
        transcode::with_guest_bytes(&mut self.store, &self.exports, ptr, len, f)
    }

    /// Copy host bytes into guest memory at `ptr`.
    pub fn write_at(&mut self, ptr: i32, bytes: &[u8]) -> Result<(), BridgeError> {
        transcode::write_at(&mut self.store, &self.exports, ptr, bytes)
    }

    /// Return a caller-owned region to the guest allocator.
    pub fn free(&mut self, desc: TransferDescriptor) -> Result<(), BridgeError> {
        transcode::free(&mut self.store, &self.exports, desc)
    }

    /// Add a host value to the handle table.
    pub fn add_value(&mut self, value: HostValue) -> Handle {
        self.store.data_mut().table.add(value)
    }

    /// Read and release a handle.
    pub fn take_value(&mut self, handle: Handle) -> Result<HostValue, BridgeError> {
        Ok(self
            .store
            .data_mut()
            .table
            .take(handle)
            .ok_or(HostError::StaleHandle(handle.index()))?)
    }

    // ── Introspection ──

    pub fn handles(&self) -> &HandleTable {
        &self.store.data().table
    }

    pub fn views(&self) -> &ViewCache {
        &self.store.data().views
    }

    /// Handle currently in the exception slot.
    pub fn exception(&self) -> Option<Handle> {
        self.store.data().exception
    }

    /// Current guest stack pointer.
    pub fn stack_pointer(&mut self) -> Result<i32, BridgeError> {
        self.refuel()?;
        Ok(self.exports.stack_pointer.call(&mut self.store, 0)?)
    }

    /// Size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.exports.memory.data_size(&self.store)
    }

    /// Blake3 digest of the module bytes.
    pub fn digest(&self) -> &Hash {
        &self.digest
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

/// Flatten one argument onto `params`, recording what the guest now owns.
fn marshal(
    store: &mut Store<HostState>,
    exports: &GuestExports,
    arg: &Arg<'_>,
    params: &mut Vec<Val>,
    passed: &mut Vec<Passed>,
) -> Result<(), BridgeError> {
    match arg {
        Arg::Str(text) => {
            let desc = transcode::pass_str(store, exports, text)?;
            passed.push(Passed::Region(desc));
            let (ptr, len) = desc.abi();
            params.extend([Val::I32(ptr), Val::I32(len)]);
        }
        Arg::Bytes(bytes) => {
            let desc = transcode::pass_bytes(store, exports, bytes)?;
            passed.push(Passed::Region(desc));
            let (ptr, len) = desc.abi();
            params.extend([Val::I32(ptr), Val::I32(len)]);
        }
        Arg::I32(v) => params.push(Val::I32(*v)),
        Arg::U32(v) => params.push(Val::I32(*v as i32)),
        Arg::Bool(b) => params.push(Val::I32(*b as i32)),
        Arg::Value(value) => {
            let handle = store.data_mut().table.add(value.clone());
            passed.push(Passed::Value(handle));
            params.push(Val::I32(handle.as_raw()));
        }
    }
    Ok(())
}

/// Free everything marshalled so far when a later argument fails.
fn reclaim(store: &mut Store<HostState>, exports: &GuestExports, passed: Vec<Passed>) {
    for item in passed {
        match item {
            Passed::Region(desc) => {
                if let Err(e) = transcode::free(store, exports, desc) {
                    debug!(ptr = desc.ptr, "failed to free argument: {}", e);
                }
            }
            Passed::Value(handle) => store.data_mut().table.drop(handle),
        }
    }
}

/// Create a Wasmtime engine with deterministic configuration.
fn create_engine(config: &BridgeConfig) -> Result<Engine, BridgeError> {
    let mut wasm_config = Config::new();

    // Fuel metering
    wasm_config.consume_fuel(config.fuel_limit.is_some());

    wasm_config.wasm_threads(false);
    wasm_config.wasm_multi_memory(false);
    wasm_config.cranelift_nan_canonicalization(true);

    Ok(Engine::new(&wasm_config)?)
}

/// Convert a failed guest call into a `BridgeError`.
///
/// Values thrown through `throw`/`rethrow` → `BridgeError::Thrown`
/// Bridge and host errors raised inside imports → themselves
/// Fuel exhaustion → `BridgeError::FuelExhausted`
/// Other traps → `BridgeError::GuestTrapped`
pub(crate) fn classify_trap(err: anyhow::Error) -> BridgeError {
    let err = match err.downcast::<GuestThrow>() {
        Ok(GuestThrow(value)) => return BridgeError::from_thrown(value),
        Err(err) => err,
    };
    let err = match err.downcast::<BridgeError>() {
        Ok(BridgeError::Wasmtime(inner)) => return classify_trap(inner),
        Ok(other) => return other,
        Err(err) => err,
    };
    let err = match err.downcast::<HostError>() {
        Ok(host) => return BridgeError::Host(host),
        Err(err) => err,
    };
    if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        return BridgeError::FuelExhausted;
    }
    BridgeError::GuestTrapped(format!("{:#}", err))
}
