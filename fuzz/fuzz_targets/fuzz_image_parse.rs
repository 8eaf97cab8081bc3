#![no_main]

use libfuzzer_sys::fuzz_target;
use packfs::image::HEADER_SIZE;
use packfs::ImageReader;
use std::io::Write;
use tempfile::NamedTempFile;

fuzz_target!(|data: &[u8]| {
    if data.len() < HEADER_SIZE {
        return;
    }

    let mut temp_file = match NamedTempFile::new() {
        Ok(f) => f,
        Err(_) => return,
    };
    if temp_file.write_all(data).and_then(|_| temp_file.flush()).is_err() {
        return;
    }

    // Invalid images must be rejected, never panic
    let mut reader = match ImageReader::open(temp_file.path()) {
        Ok(r) => r,
        Err(_) => return,
    };

    let paths: Vec<String> = reader.list_entries().to_vec();
    for path in &paths {
        let _ = reader.read_entry(path);
        let _ = reader.read_link(path);
    }

    let _ = reader.contains("");
    let _ = reader.contains("../../../etc/passwd");
});
