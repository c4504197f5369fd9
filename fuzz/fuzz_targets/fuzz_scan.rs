#![no_main]

use janus::{MemorySource, SignatureSet, classify, scan_offsets};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&chunk, rest)) = data.split_first() else {
        return;
    };
    let chunk_size = usize::from(chunk).max(1);
    let signatures = SignatureSet::jpeg();

    let source = MemorySource::new("fuzz", rest.to_vec());
    let offsets = scan_offsets(&source, &signatures, chunk_size).unwrap();
    let reference = scan_offsets(&source, &signatures, rest.len().max(1)).unwrap();
    assert_eq!(offsets, reference);
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));

    let _ = classify(&offsets);
});
