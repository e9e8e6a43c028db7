//! Shared test helpers for integration tests.
//!
//! Provides the test guest module (written in WAT, so no wasm toolchain is
//! needed), capability sets, and bridge factory functions used across all
//! integration test files.

#![allow(dead_code)]

use std::sync::Arc;

use keystone_bridge::{Bridge, BridgeConfig};
use keystone_hostapi::{Capabilities, ErrorValue, HostValue, MemSink, SeededRandom, StaticLoader};

/// Initial guest stack pointer; the stack grows down from here.
pub const STACK_TOP: i32 = 4096;

/// A guest that follows the bridge ABI.
///
/// Memory layout:
/// ```text
/// [0, 1024)      static data
/// [1024, 4096)   shadow stack, growing down from 4096
/// [4096, ...)    bump heap, 8-byte aligned, grows memory on demand
/// ```
///
/// `free` only counts calls; `realloc` always moves. Fallible imports are
/// checked through `$exn`, which `exn_store` sets.
pub const GUEST_WAT: &str = r#"
(module
    (import "keystone_host" "string_new" (func $string_new (param i32 i32) (result i32)))
    (import "keystone_host" "json_parse" (func $json_parse (param i32 i32) (result i32)))
    (import "keystone_host" "object_drop_ref" (func $drop_ref (param i32)))
    (import "keystone_host" "object_clone_ref" (func $clone_ref (param i32) (result i32)))
    (import "keystone_host" "is_undefined" (func $is_undefined (param i32) (result i32)))
    (import "keystone_host" "random_source" (func $random_source (result i32)))
    (import "keystone_host" "random_fill" (func $random_fill (param i32 i32 i32)))
    (import "keystone_host" "random_fill_array" (func $random_fill_array (param i32 i32)))
    (import "keystone_host" "module_loader" (func $module_loader (result i32)))
    (import "keystone_host" "require" (func $require (param i32 i32 i32) (result i32)))
    (import "keystone_host" "memory" (func $memory_obj (result i32)))
    (import "keystone_host" "buffer" (func $buffer (param i32) (result i32)))
    (import "keystone_host" "length" (func $length (param i32) (result i32)))
    (import "keystone_host" "bytes_new" (func $bytes_new (param i32) (result i32)))
    (import "keystone_host" "bytes_new_with_length" (func $bytes_new_with_length (param i32) (result i32)))
    (import "keystone_host" "bytes_set" (func $bytes_set (param i32 i32 i32)))
    (import "keystone_host" "bytes_subarray" (func $bytes_subarray (param i32 i32 i32) (result i32)))
    (import "keystone_host" "error_new" (func $error_new (result i32)))
    (import "keystone_host" "error_stack" (func $error_stack (param i32 i32)))
    (import "keystone_host" "console_error" (func $console_error (param i32 i32)))
    (import "keystone_host" "throw" (func $throw (param i32 i32)))
    (import "keystone_host" "rethrow" (func $rethrow (param i32)))

    (memory (export "memory") 1)

    (global $sp (mut i32) (i32.const 4096))
    (global $heap (mut i32) (i32.const 4096))
    (global $exn (mut i32) (i32.const 0))
    (global $started (mut i32) (i32.const 0))
    (global $mallocs (mut i32) (i32.const 0))
    (global $reallocs (mut i32) (i32.const 0))
    (global $frees (mut i32) (i32.const 0))

    (data (i32.const 16) "boom")
    (data (i32.const 32) "[\"0xab\",\"rms1q\"]")
    (data (i32.const 64) "[\"{}\",\"atoi1q\"]")
    (data (i32.const 144) "guest says hi")
    (data (i32.const 160) "\ff\fe")
    (data (i32.const 176) "{oops")
    (data (i32.const 192) "no loader")
    (data (i32.const 208) "empty mnemonic")
    (data (i32.const 224) "deriving address")
    (data (i32.const 256) "Invalid address type")
    (data (i32.const 288) "invalid hrp")

    ;; ── Allocator ──

    (func $alloc (param $size i32) (result i32)
        (local $ptr i32) (local $end i32)
        global.get $heap
        i32.const 7
        i32.add
        i32.const -8
        i32.and
        local.set $ptr
        local.get $ptr
        local.get $size
        i32.add
        local.set $end
        (block $ok
            local.get $end
            memory.size
            i32.const 16
            i32.shl
            i32.le_u
            br_if $ok
            local.get $end
            memory.size
            i32.const 16
            i32.shl
            i32.sub
            i32.const 65535
            i32.add
            i32.const 16
            i32.shr_u
            memory.grow
            i32.const -1
            i32.ne
            br_if $ok
            unreachable)
        local.get $end
        global.set $heap
        local.get $ptr)

    (func $malloc (export "malloc") (param $size i32) (result i32)
        global.get $mallocs
        i32.const 1
        i32.add
        global.set $mallocs
        local.get $size
        call $alloc)

    (func (export "realloc") (param $ptr i32) (param $old i32) (param $new i32) (result i32)
        (local $dst i32)
        global.get $reallocs
        i32.const 1
        i32.add
        global.set $reallocs
        local.get $new
        call $alloc
        local.set $dst
        local.get $dst
        local.get $ptr
        local.get $old
        local.get $new
        local.get $old
        local.get $new
        i32.lt_u
        select
        memory.copy
        local.get $dst)

    (func $free (export "free") (param i32 i32)
        global.get $frees
        i32.const 1
        i32.add
        global.set $frees)

    (func (export "add_to_stack_pointer") (param $delta i32) (result i32)
        global.get $sp
        local.get $delta
        i32.add
        global.set $sp
        global.get $sp)

    (func (export "exn_store") (param $handle i32)
        local.get $handle
        global.set $exn)

    (func (export "start")
        i32.const 1
        global.set $started)

    (func (export "started") (result i32) global.get $started)
    (func (export "malloc_count") (result i32) global.get $mallocs)
    (func (export "realloc_count") (result i32) global.get $reallocs)
    (func (export "free_count") (result i32) global.get $frees)

    ;; ── Result helpers ──

    (func $take_exn (result i32)
        (local $h i32)
        global.get $exn
        local.set $h
        i32.const 0
        global.set $exn
        local.get $h)

    (func $ok_slice (param $ret i32) (param $ptr i32) (param $len i32)
        local.get $ret
        local.get $ptr
        i32.store
        local.get $ret
        local.get $len
        i32.store offset=4)

    (func $err_slice (param $ret i32) (param $err i32)
        local.get $ret
        local.get $err
        i32.store offset=8
        local.get $ret
        i32.const 1
        i32.store offset=12)

    (func $ok_value (param $ret i32) (param $h i32)
        local.get $ret
        local.get $h
        i32.store)

    (func $err_value (param $ret i32) (param $err i32)
        local.get $ret
        local.get $err
        i32.store offset=4
        local.get $ret
        i32.const 1
        i32.store offset=8)

    ;; Copy `len` static bytes at `src` into a fresh allocation.
    (func $dup (param $src i32) (param $len i32) (result i32)
        (local $p i32)
        local.get $len
        call $malloc
        local.set $p
        local.get $p
        local.get $src
        local.get $len
        memory.copy
        local.get $p)

    ;; ── Strings and bytes ──

    (func (export "echo") (param $ret i32) (param $ptr i32) (param $len i32)
        local.get $ret
        local.get $ptr
        local.get $len
        call $ok_slice)

    (func (export "fail") (param $ret i32)
        local.get $ret
        i32.const 16
        i32.const 4
        call $string_new
        call $err_slice)

    (func (export "bad_utf8") (param $ret i32)
        local.get $ret
        i32.const 160
        i32.const 2
        call $dup
        i32.const 2
        call $ok_slice)

    (func (export "bad_string_new") (param $ret i32)
        local.get $ret
        i32.const 160
        i32.const 2
        call $string_new
        call $ok_value)

    (func (export "parse_json") (param $ret i32) (param $ptr i32) (param $len i32)
        (local $h i32)
        i32.const 0
        global.set $exn
        local.get $ptr
        local.get $len
        call $json_parse
        local.set $h
        local.get $ptr
        local.get $len
        call $free
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_value
            return
        end
        local.get $ret
        local.get $h
        call $ok_value)

    ;; Triggers a host exception and handles it without reporting it.
    (func (export "swallow") (param $ret i32)
        i32.const 0
        global.set $exn
        i32.const 176
        i32.const 5
        call $json_parse
        drop
        call $take_exn
        call $drop_ref
        local.get $ret
        i32.const 0
        i32.const 0
        call $ok_slice)

    ;; ── Handles ──

    (func (export "clone_value") (param $ret i32) (param $h i32)
        local.get $ret
        local.get $h
        call $clone_ref
        call $ok_value
        local.get $h
        call $drop_ref)

    (func (export "drop_value") (param $ret i32) (param $h i32)
        local.get $h
        call $drop_ref
        local.get $ret
        i32.const 0
        i32.const 0
        call $ok_slice)

    ;; ── Randomness ──

    (func (export "random_bytes") (param $ret i32) (param $len i32)
        (local $src i32) (local $p i32)
        i32.const 0
        global.set $exn
        call $random_source
        local.set $src
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_slice
            return
        end
        local.get $len
        call $malloc
        local.set $p
        local.get $src
        local.get $p
        local.get $len
        call $random_fill
        local.get $src
        call $drop_ref
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_slice
            return
        end
        local.get $ret
        local.get $p
        local.get $len
        call $ok_slice)

    ;; Fills a host byte array, then copies it into linear memory through
    ;; a byte-array view of the memory buffer.
    (func (export "random_via_array") (param $ret i32) (param $len i32)
        (local $src i32) (local $arr i32) (local $p i32) (local $mem i32)
        (local $buf i32) (local $view i32) (local $sub i32) (local $n i32)
        i32.const 0
        global.set $exn
        call $random_source
        local.set $src
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_slice
            return
        end
        local.get $len
        call $bytes_new_with_length
        local.set $arr
        local.get $src
        local.get $arr
        call $random_fill_array
        local.get $src
        call $drop_ref
        global.get $exn
        if
            local.get $arr
            call $drop_ref
            local.get $ret
            call $take_exn
            call $err_slice
            return
        end
        local.get $arr
        call $length
        local.set $n
        local.get $n
        call $malloc
        local.set $p
        call $memory_obj
        local.set $mem
        local.get $mem
        call $buffer
        local.set $buf
        local.get $buf
        call $bytes_new
        local.set $view
        local.get $view
        local.get $p
        local.get $p
        local.get $n
        i32.add
        call $bytes_subarray
        local.set $sub
        local.get $sub
        local.get $arr
        i32.const 0
        call $bytes_set
        local.get $sub
        call $drop_ref
        local.get $view
        call $drop_ref
        local.get $buf
        call $drop_ref
        local.get $mem
        call $drop_ref
        local.get $arr
        call $drop_ref
        local.get $ret
        local.get $p
        local.get $n
        call $ok_slice)

    ;; ── Errors ──

    (func (export "throw_message") (param $ret i32) (param $ptr i32) (param $len i32)
        local.get $ptr
        local.get $len
        call $throw)

    (func (export "rethrow_new_error") (param $ret i32)
        call $error_new
        call $rethrow)

    ;; Re-raises a captured random-source failure as a trap.
    (func (export "rethrow_random") (param $ret i32)
        (local $src i32) (local $p i32)
        i32.const 0
        global.set $exn
        call $random_source
        local.set $src
        i32.const 4
        call $malloc
        local.set $p
        local.get $src
        local.get $p
        i32.const 4
        call $random_fill
        global.get $exn
        if
            call $take_exn
            call $rethrow
        end
        local.get $src
        call $drop_ref
        local.get $ret
        local.get $p
        i32.const 4
        call $ok_slice)

    (func (export "module_error_stack") (param $ret i32) (param $ptr i32) (param $len i32)
        (local $loader i32) (local $err i32)
        i32.const 0
        global.set $exn
        call $module_loader
        local.set $loader
        local.get $loader
        local.get $ptr
        local.get $len
        call $require
        local.set $err
        local.get $loader
        call $drop_ref
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_slice
            return
        end
        local.get $ret
        local.get $err
        call $error_stack
        local.get $err
        call $drop_ref)

    (func (export "log_error") (param $ret i32)
        i32.const 144
        i32.const 13
        call $dup
        i32.const 13
        call $console_error
        local.get $ret
        i32.const 0
        i32.const 0
        call $ok_slice)

    (func (export "load_module") (param $ret i32) (param $ptr i32) (param $len i32)
        (local $loader i32) (local $h i32)
        call $module_loader
        local.set $loader
        local.get $loader
        call $is_undefined
        if
            local.get $ret
            i32.const 192
            i32.const 9
            call $string_new
            call $err_value
            return
        end
        i32.const 0
        global.set $exn
        local.get $loader
        local.get $ptr
        local.get $len
        call $require
        local.set $h
        local.get $loader
        call $drop_ref
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_value
            return
        end
        local.get $ret
        local.get $h
        call $ok_value)

    ;; ── Resource limits ──

    (func (export "spin") (param $ret i32)
        (loop $forever
            br $forever))

    (func (export "oom") (param $ret i32)
        local.get $ret
        i32.const 0x4000000
        call $malloc
        i32.const 0
        call $ok_slice)

    ;; ── Wallet exports ──

    (func (export "generate_mnemonic") (param $ret i32)
        (local $src i32) (local $p i32) (local $i i32) (local $at i32)
        i32.const 0
        global.set $exn
        call $random_source
        local.set $src
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_slice
            return
        end
        i32.const 24
        call $malloc
        local.set $p
        local.get $src
        local.get $p
        i32.const 24
        call $random_fill
        local.get $src
        call $drop_ref
        global.get $exn
        if
            local.get $ret
            call $take_exn
            call $err_slice
            return
        end
        (block $done
            (loop $next
                local.get $i
                i32.const 24
                i32.ge_u
                br_if $done
                local.get $p
                local.get $i
                i32.add
                local.set $at
                local.get $at
                local.get $at
                i32.load8_u
                i32.const 26
                i32.rem_u
                i32.const 97
                i32.add
                i32.store8
                local.get $i
                i32.const 1
                i32.add
                local.set $i
                br $next))
        local.get $ret
        local.get $p
        i32.const 24
        call $ok_slice)

    (func $derive (param $ret i32) (param $m_ptr i32) (param $m_len i32)
        (param $hrp_ptr i32) (param $hrp_len i32)
        local.get $m_ptr
        local.get $m_len
        call $free
        local.get $hrp_ptr
        local.get $hrp_len
        call $free
        local.get $m_len
        i32.eqz
        if
            local.get $ret
            i32.const 208
            i32.const 14
            call $string_new
            call $err_value
            return
        end
        local.get $ret
        i32.const 32
        i32.const 16
        call $json_parse
        call $ok_value)

    (func (export "generate_address") (param $ret i32) (param $m_ptr i32) (param $m_len i32)
        (param $coin i32) (param $account i32) (param $internal i32) (param $index i32)
        (param $hrp_ptr i32) (param $hrp_len i32)
        local.get $ret
        local.get $m_ptr
        local.get $m_len
        local.get $hrp_ptr
        local.get $hrp_len
        call $derive)

    (func (export "generate_address_with_logs") (param $ret i32) (param $m_ptr i32) (param $m_len i32)
        (param $coin i32) (param $account i32) (param $internal i32) (param $index i32)
        (param $hrp_ptr i32) (param $hrp_len i32)
        i32.const 224
        i32.const 16
        call $dup
        i32.const 16
        call $console_error
        local.get $ret
        local.get $m_ptr
        local.get $m_len
        local.get $hrp_ptr
        local.get $hrp_len
        call $derive)

    (func (export "change_bech32_hrp") (param $ret i32) (param $a_ptr i32) (param $a_len i32)
        (param $hrp_ptr i32) (param $hrp_len i32)
        local.get $a_ptr
        local.get $a_len
        call $free
        local.get $hrp_ptr
        local.get $hrp_len
        call $free
        local.get $hrp_len
        i32.eqz
        if
            local.get $ret
            i32.const 288
            i32.const 11
            call $string_new
            call $err_value
            return
        end
        local.get $ret
        i32.const 64
        i32.const 15
        call $json_parse
        call $ok_value)

    ;; Returns hrp ++ "1" ++ address.
    (func (export "to_bech32_address") (param $ret i32) (param $a_ptr i32) (param $a_len i32)
        (param $hrp_ptr i32) (param $hrp_len i32) (param $kind i32)
        (local $p i32)
        local.get $kind
        if
            local.get $ret
            i32.const 256
            i32.const 20
            call $string_new
            call $err_slice
            return
        end
        local.get $hrp_len
        local.get $a_len
        i32.add
        i32.const 1
        i32.add
        call $malloc
        local.set $p
        local.get $p
        local.get $hrp_ptr
        local.get $hrp_len
        memory.copy
        local.get $p
        local.get $hrp_len
        i32.add
        i32.const 49
        i32.store8
        local.get $p
        local.get $hrp_len
        i32.add
        i32.const 1
        i32.add
        local.get $a_ptr
        local.get $a_len
        memory.copy
        local.get $a_ptr
        local.get $a_len
        call $free
        local.get $hrp_ptr
        local.get $hrp_len
        call $free
        local.get $ret
        local.get $p
        local.get $hrp_len
        local.get $a_len
        i32.add
        i32.const 1
        i32.add
        call $ok_slice)
)
"#;

// ── Capabilities ──

/// Deterministic randomness, an in-memory console, no module loader.
pub fn test_caps(sink: Arc<MemSink>) -> Capabilities {
    Capabilities::os()
        .with_random(SeededRandom::new(7))
        .with_sink(sink)
}

// ── Bridge factories ──

/// Default test config: 4 MiB memory ceiling, generous fuel.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        max_memory_pages: 64,
        fuel_limit: Some(50_000_000),
        run_start: true,
    }
}

/// A bridge over the test guest with the given capabilities.
pub fn bridge_with(caps: Capabilities) -> Bridge {
    Bridge::new(GUEST_WAT.as_bytes(), test_config(), caps).unwrap()
}

/// A bridge over the test guest plus the sink its console writes to.
pub fn load_bridge() -> (Bridge, Arc<MemSink>) {
    let sink = Arc::new(MemSink::new());
    let bridge = bridge_with(test_caps(sink.clone()));
    (bridge, sink)
}

/// Read one of the guest's allocator counters.
pub fn counter(bridge: &mut Bridge, name: &str) -> i32 {
    bridge.call_i32(name, &[]).unwrap()
}

/// A guest whose allocator hands out regions that run off the end of
/// memory. Writes into them fail; `free_count` reports releases.
pub const CRAMPED_WAT: &str = r#"
    (module
        (import "keystone_host" "module_loader" (func $module_loader (result i32)))
        (import "keystone_host" "require" (func $require (param i32 i32 i32) (result i32)))
        (import "keystone_host" "error_stack" (func $error_stack (param i32 i32)))
        (memory (export "memory") 1)
        (global $sp (mut i32) (i32.const 1024))
        (data (i32.const 16) "broken")
        (global $frees (mut i32) (i32.const 0))
        (func (export "malloc") (param i32) (result i32) i32.const 65534)
        (func (export "realloc") (param i32 i32 i32) (result i32) local.get 0)
        (func (export "free") (param i32 i32)
            global.get $frees
            i32.const 1
            i32.add
            global.set $frees)
        (func (export "free_count") (result i32) global.get $frees)
        (func (export "add_to_stack_pointer") (param i32) (result i32)
            global.get $sp
            local.get 0
            i32.add
            global.set $sp
            global.get $sp)
        (func (export "stack_out_of_range") (param $ret i32)
            i32.const 70000
            call $module_loader
            i32.const 16
            i32.const 6
            call $require
            call $error_stack)
    )
"#;

/// A bridge over [`CRAMPED_WAT`]. Its loader serves `broken`, an error
/// with an empty stack.
pub fn cramped_bridge() -> Bridge {
    let loader = StaticLoader::new().with_module("broken", HostValue::Error(ErrorValue::with_stack("x", "")));
    let caps = Capabilities::os().with_loader(loader);
    Bridge::new(CRAMPED_WAT.as_bytes(), test_config(), caps).unwrap()
}
