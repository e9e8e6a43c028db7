//! WASM module validation: ABI compatibility checks.
//!
//! Validates that a compiled guest module can be driven by the bridge
//! before it is instantiated. Checks:
//!
//! 1. Memory export present
//! 2. Allocator and stack exports present with correct signatures
//! 3. Optional exports, when present, have correct signatures
//! 4. All imports are known functions from `keystone_host`; no WASI

use wasmtime::{ExternType, FuncType, Module, ValType};

use crate::error::BridgeError;
use crate::exports::{ADD_TO_STACK_POINTER, EXN_STORE, FREE, MALLOC, MEMORY, REALLOC, START};
use crate::linker::{IMPORT_MODULE, IMPORT_NAMES};

/// Check if a ValType is i32.
fn is_i32(vt: &ValType) -> bool {
    matches!(vt, ValType::I32)
}

/// Expected export: (name, param_count_of_i32, result_count_of_i32).
const REQUIRED_EXPORTS: &[(&str, usize, usize)] = &[
    (MALLOC, 1, 1),
    (REALLOC, 3, 1),
    (FREE, 2, 0),
    (ADD_TO_STACK_POINTER, 1, 1),
];

/// Exports the bridge uses when the guest provides them.
const OPTIONAL_EXPORTS: &[(&str, usize, usize)] = &[(EXN_STORE, 1, 0), (START, 0, 0)];

/// Validate that a WASM module meets the bridge ABI.
pub fn validate_module(module: &Module) -> Result<(), BridgeError> {
    validate_exports(module)?;
    validate_imports(module)?;
    Ok(())
}

fn check_signature(name: &str, func_ty: &FuncType, params: usize, results: usize) -> Result<(), BridgeError> {
    let param_tys: Vec<ValType> = func_ty.params().collect();
    let result_tys: Vec<ValType> = func_ty.results().collect();

    if param_tys.len() != params || !param_tys.iter().all(is_i32) {
        return Err(BridgeError::ValidationError(format!(
            "export '{}' has wrong param signature: expected {} i32 params, got {} params",
            name,
            params,
            param_tys.len()
        )));
    }

    if result_tys.len() != results || !result_tys.iter().all(is_i32) {
        return Err(BridgeError::ValidationError(format!(
            "export '{}' has wrong result signature: expected {} i32 results, got {} results",
            name,
            results,
            result_tys.len()
        )));
    }

    Ok(())
}

/// Check that all required exports are present with correct signatures.
fn validate_exports(module: &Module) -> Result<(), BridgeError> {
    let has_memory = module
        .exports()
        .any(|e| e.name() == MEMORY && matches!(e.ty(), ExternType::Memory(_)));
    if !has_memory {
        return Err(BridgeError::ValidationError(format!("module must export '{}'", MEMORY)));
    }

    for &(name, params, results) in REQUIRED_EXPORTS {
        let export = module
            .exports()
            .find(|e| e.name() == name)
            .ok_or_else(|| BridgeError::ValidationError(format!("missing required export: {}", name)))?;

        match export.ty() {
            ExternType::Func(ft) => check_signature(name, &ft, params, results)?,
            _ => {
                return Err(BridgeError::ValidationError(format!(
                    "export '{}' must be a function",
                    name
                )));
            }
        }
    }

    for &(name, params, results) in OPTIONAL_EXPORTS {
        if let Some(export) = module.exports().find(|e| e.name() == name) {
            match export.ty() {
                ExternType::Func(ft) => check_signature(name, &ft, params, results)?,
                _ => {
                    return Err(BridgeError::ValidationError(format!(
                        "export '{}' must be a function",
                        name
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Check that all imports are known `keystone_host` functions and none are WASI.
fn validate_imports(module: &Module) -> Result<(), BridgeError> {
    for import in module.imports() {
        let module_name = import.module();

        if module_name.starts_with("wasi") {
            return Err(BridgeError::ValidationError(format!(
                "WASI import not allowed: {}::{}",
                module_name,
                import.name()
            )));
        }

        if module_name != IMPORT_MODULE {
            return Err(BridgeError::ValidationError(format!(
                "import from unknown module '{}' (only '{}' allowed): {}",
                module_name,
                IMPORT_MODULE,
                import.name()
            )));
        }

        if !matches!(import.ty(), ExternType::Func(_)) {
            return Err(BridgeError::ValidationError(format!(
                "non-function import not allowed: {}::{}",
                module_name,
                import.name()
            )));
        }

        if !IMPORT_NAMES.contains(&import.name()) {
            return Err(BridgeError::ValidationError(format!(
                "unknown host function: {}::{}",
                module_name,
                import.name()
            )));
        }
    }

    Ok(())
}
