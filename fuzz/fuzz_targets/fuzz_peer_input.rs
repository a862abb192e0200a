#![no_main]

//! Fuzz the inputs an unauthenticated peer controls before any decision is
//! made: the declared remote-address headers and (for completeness) the
//! trusted-range list an operator might paste in.
//!
//! # Goal
//! Parsing must reject or accept; it must never panic, loop, or allocate
//! without bound.

use libfuzzer_sys::fuzz_target;
use peergate::pipeline::{peer_from_headers, HEADER_REMOTE_ADDR, HEADER_REMOTE_PORT};
use peergate::trust::TrustedRanges;

fuzz_target!(|data: (&str, &str, &str)| {
    let (host, port, ranges) = data;

    let mut headers = http::HeaderMap::new();
    if let Ok(value) = http::HeaderValue::from_str(host) {
        headers.insert(HEADER_REMOTE_ADDR, value);
    }
    if let Ok(value) = http::HeaderValue::from_str(port) {
        headers.insert(HEADER_REMOTE_PORT, value);
    }
    let _ = peer_from_headers(&headers);

    let _ = TrustedRanges::parse(ranges);
});
