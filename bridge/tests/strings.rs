//! String and byte transcoding through a live guest: encoding strategy,
//! round trips, memory growth, and strict decoding.

mod common;

use keystone_bridge::{Arg, BridgeError, ReturnKind};

use common::*;

// ── Encoding ──

#[test]
fn test_ascii_string_needs_no_realloc() {
    let (mut bridge, _) = load_bridge();
    let reallocs = counter(&mut bridge, "realloc_count");

    let desc = bridge.pass_str("abc").unwrap();

    assert_eq!(desc.len, 3);
    assert_eq!(desc.capacity, 3);
    assert_eq!(counter(&mut bridge, "realloc_count"), reallocs);
    let bytes = bridge.with_bytes(desc.ptr, desc.len, |b| b.to_vec()).unwrap();
    assert_eq!(bytes, [0x61, 0x62, 0x63]);
    bridge.free(desc).unwrap();
}

#[test]
fn test_non_ascii_string_takes_realloc_path() {
    let (mut bridge, _) = load_bridge();
    let reallocs = counter(&mut bridge, "realloc_count");

    let desc = bridge.pass_str("héllo").unwrap();

    assert_eq!(counter(&mut bridge, "realloc_count"), reallocs + 1);
    assert_eq!(desc.len, 6);
    // One ASCII byte, then room for four UTF-16 units at three bytes each.
    assert_eq!(desc.capacity, 13);
    let bytes = bridge.with_bytes(desc.ptr, desc.len, |b| b.to_vec()).unwrap();
    assert_eq!(bytes, [0x68, 0xC3, 0xA9, 0x6C, 0x6C, 0x6F]);
    assert_eq!(bridge.take_string(desc).unwrap(), "héllo");
}

#[test]
fn test_round_trip_through_guest() {
    let (mut bridge, _) = load_bridge();
    let texts = [
        "",
        "abc",
        "héllo",
        "日本語テキスト",
        "crab 🦀 emoji",
        "ascii prefix then ünïcödé",
    ];
    let frees = counter(&mut bridge, "free_count");

    for text in texts {
        let out = bridge
            .call("echo", &[Arg::Str(text)], ReturnKind::String)
            .unwrap()
            .into_string()
            .unwrap();
        assert_eq!(out, text);
    }

    // Each echoed region is freed exactly once, by the host.
    assert_eq!(counter(&mut bridge, "free_count"), frees + texts.len() as i32);
}

#[test]
fn test_large_string_grows_memory_and_rebuilds_views() {
    let (mut bridge, _) = load_bridge();
    let text = "ab€".repeat(100_000);
    let memory_before = bridge.memory_size();
    let rebuilds_before = bridge.views().rebuilds();

    let out = bridge
        .call("echo", &[Arg::Str(&text)], ReturnKind::String)
        .unwrap()
        .into_string()
        .unwrap();

    assert_eq!(out, text);
    assert!(bridge.memory_size() > memory_before);
    assert!(bridge.views().rebuilds() > rebuilds_before);
}

#[test]
fn test_bytes_written_before_growth_survive_it() {
    let (mut bridge, _) = load_bridge();
    let early = bridge.pass_str("written early").unwrap();

    // Force the heap past the initial page.
    let big = bridge.pass_bytes(&vec![0x5A; 200_000]).unwrap();

    assert_eq!(bridge.decode_str(early.ptr, early.len).unwrap(), "written early");
    bridge.free(big).unwrap();
    bridge.free(early).unwrap();
}

#[test]
fn test_failed_write_frees_fresh_region() {
    let mut bridge = cramped_bridge();

    assert!(bridge.pass_str("abc").is_err());
    assert_eq!(counter(&mut bridge, "free_count"), 1);

    assert!(bridge.pass_bytes(&[1, 2, 3]).is_err());
    assert_eq!(counter(&mut bridge, "free_count"), 2);
}

#[test]
fn test_failed_tail_write_frees_reallocated_region() {
    let mut bridge = cramped_bridge();

    // The ASCII prefix fits; the re-encoded tail does not.
    assert!(bridge.pass_str("aé").is_err());
    assert_eq!(counter(&mut bridge, "free_count"), 1);
}

// ── Decoding ──

#[test]
fn test_invalid_utf8_from_guest_is_fatal_and_freed() {
    let (mut bridge, _) = load_bridge();
    let frees = counter(&mut bridge, "free_count");

    let err = bridge.call("bad_utf8", &[], ReturnKind::String).unwrap_err();

    assert!(matches!(err, BridgeError::Decode(_)), "got {:?}", err);
    assert_eq!(counter(&mut bridge, "free_count"), frees + 1);
}

#[test]
fn test_invalid_utf8_in_string_new_traps() {
    let (mut bridge, _) = load_bridge();
    let err = bridge.call("bad_string_new", &[], ReturnKind::Value).unwrap_err();
    assert!(matches!(err, BridgeError::Decode(_)), "got {:?}", err);
}

#[test]
fn test_broken_continuation_byte_is_rejected() {
    let (mut bridge, _) = load_bridge();
    // 'h', then a two-byte lead followed by a non-continuation byte.
    let desc = bridge.pass_bytes(&[0x68, 0xC3, 0x28]).unwrap();
    let err = bridge.take_string(desc).unwrap_err();
    assert!(matches!(err, BridgeError::Decode(_)));
}

#[test]
fn test_decode_out_of_bounds_is_rejected() {
    let (mut bridge, _) = load_bridge();
    let size = bridge.memory_size();
    let err = bridge.decode_str((size - 2) as i32, 4).unwrap_err();
    assert!(matches!(err, BridgeError::Host(_)), "got {:?}", err);
}

// ── Bytes ──

#[test]
fn test_bytes_round_trip_through_guest() {
    let (mut bridge, _) = load_bridge();
    let payload = [0u8, 1, 2, 0x7F, 0x80, 0xFF];
    let out = bridge
        .call("echo", &[Arg::Bytes(&payload)], ReturnKind::Bytes)
        .unwrap()
        .into_bytes()
        .unwrap();
    assert_eq!(out, payload);
}

#[test]
fn test_write_at_offset_of_existing_region() {
    let (mut bridge, _) = load_bridge();
    let desc = bridge.pass_bytes(&[0; 8]).unwrap();

    bridge.write_at(desc.ptr + 2, &[9, 9]).unwrap();

    let bytes = bridge.take_bytes(desc).unwrap();
    assert_eq!(bytes, [0, 0, 9, 9, 0, 0, 0, 0]);
}

#[test]
fn test_zero_copy_read_sees_guest_bytes() {
    let (mut bridge, _) = load_bridge();
    let desc = bridge.pass_bytes(b"view me").unwrap();
    let sum = bridge
        .with_bytes(desc.ptr, desc.len, |b| b.iter().map(|&x| x as u32).sum::<u32>())
        .unwrap();
    assert_eq!(sum, b"view me".iter().map(|&x| x as u32).sum::<u32>());
    bridge.free(desc).unwrap();
}
