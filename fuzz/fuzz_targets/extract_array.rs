#![no_main]

use std::io::Cursor;
use std::path::Path;

use libfuzzer_sys::fuzz_target;

// Arbitrary source text must never panic the extractor, only produce an error.
fuzz_target!(|data: &[u8]| {
    let _ = nvfw::extract_array_from_reader(Cursor::new(data), Path::new("fuzz.c"), "fuzz_data");
});
