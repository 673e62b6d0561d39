//! Fuzz target: `compress::unpack`
//!
//! Arbitrary bytes flagged as DEFLATE must either inflate within the limit
//! or fail with an error, never panic or over-allocate.
//!
//! cargo fuzz run fuzz_payload_unpack

#![no_main]

use libfuzzer_sys::fuzz_target;
use protobridge::rpc::compress;
use protobridge::rpc::events::Payload;

const LIMIT: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    let payload = Payload {
        bytes: data.to_vec(),
        compressed: true,
    };
    if let Ok(out) = compress::unpack(payload, LIMIT) {
        assert!(out.len() <= LIMIT, "inflated past the limit");
    }
});
