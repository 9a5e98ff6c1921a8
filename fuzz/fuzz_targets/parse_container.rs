#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = nvfw::detect_kind(data);
    let _ = nvfw::parse_bin_image(data);
    let _ = nvfw::parse_secure_boot_image(data);
    let _ = nvfw::parse_fmc_image(data);
});
