#![no_main]

use janus::{DecodeBudget, MemorySource, scan_and_load};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let source = MemorySource::new("fuzz.mpo", data.to_vec());
    if let Ok(budget) = DecodeBudget::new(256, 256) {
        let _ = scan_and_load(&source, budget);
    }
});
