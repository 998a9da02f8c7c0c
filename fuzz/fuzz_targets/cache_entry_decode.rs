#![no_main]

use libfuzzer_sys::fuzz_target;

use netdiskcache::cache::fuzzing::decode_entry;

fuzz_target!(|data: &[u8]| {
    if let Ok((metadata, _body)) = decode_entry(data) {
        assert!(metadata.is_valid());
    }
});
