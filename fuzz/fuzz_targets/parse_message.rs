// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use sip_parse::{parse_message, serialize_message};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 || data.len() > 4096 {
        return;
    }
    let Some(msg) = parse_message(&Bytes::copy_from_slice(data)) else {
        return;
    };

    // Whatever parses must serialize and parse again with the same Via chain.
    let reparsed = parse_message(&serialize_message(&msg)).expect("reparse serialized message");
    assert_eq!(msg.headers().via_count(), reparsed.headers().via_count());
    assert_eq!(msg.is_request(), reparsed.is_request());
});
