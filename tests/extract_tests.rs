//! Extractor tests: scan generated bindata text for named arrays, plain and gzip-compressed.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use nvfw::{extract_array, extract_array_from_reader, ExtractError};

/// Render one array the way the generated sources do: metadata comment block, declaration, hex rows.
fn c_array(name: &str, meta: &[String], bytes: &[u8]) -> String {
    let mut text = String::from("//\n");
    for line in meta {
        text.push_str(&format!("// {line}\n"));
    }
    text.push_str("//\n");
    text.push_str(&format!("static BINDATA_CONST NvU8 {name}[] =\n{{\n"));
    for row in bytes.chunks(16) {
        let row: Vec<String> = row.iter().map(|b| format!("0x{b:02x}")).collect();
        text.push_str(&format!("    {},\n", row.join(", ")));
    }
    text.push_str("};\n\n");
    text
}

fn plain(name: &str, bytes: &[u8]) -> String {
    c_array(
        name,
        &[
            "COMPRESSION: NO".to_string(),
            format!("DATA SIZE (bytes): {}", bytes.len()),
        ],
        bytes,
    )
}

/// gzip `data` and drop the 10-byte member header, as the vendor generator does.
fn headerless_gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::best());
    enc.write_all(data).unwrap();
    let stream = enc.finish().unwrap();
    stream[10..].to_vec()
}

fn compressed(name: &str, declared_size: usize, raw: &[u8]) -> String {
    c_array(
        name,
        &[
            "COMPRESSION: YES".to_string(),
            format!("DATA SIZE (bytes): {declared_size}"),
            format!("COMPRESSED SIZE (bytes): {}", raw.len()),
        ],
        raw,
    )
}

fn extract_str(text: &str, name: &str) -> Result<Vec<u8>, ExtractError> {
    extract_array_from_reader(Cursor::new(text.as_bytes()), Path::new("g_bindata_test.c"), name)
}

#[test]
fn uncompressed_array_from_file() {
    let data: Vec<u8> = (0..=40u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(plain("fw_image_prod_data", &data).as_bytes()).unwrap();
    file.flush().unwrap();

    let blob = extract_array(file.path(), "fw_image_prod_data").unwrap();
    assert_eq!(blob, data);
}

#[test]
fn compressed_array_decompresses_to_declared_size() {
    let data: Vec<u8> = (0..36u8).map(|i| i % 5).collect();
    let raw = headerless_gzip(&data);
    let text = compressed("fw_sig_prod_data", 36, &raw);

    let blob = extract_str(&text, "fw_sig_prod_data").unwrap();
    assert_eq!(blob.len(), 36);
    assert_eq!(blob, data);
}

#[test]
fn compressed_array_with_short_output_is_rejected() {
    let data = vec![7u8; 35];
    let raw = headerless_gzip(&data);
    let text = compressed("fw_sig_prod_data", 36, &raw);

    match extract_str(&text, "fw_sig_prod_data") {
        Err(ExtractError::DecompressedSizeMismatch {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 36);
            assert_eq!(actual, 35);
        }
        other => panic!("expected DecompressedSizeMismatch, got {other:?}"),
    }
}

#[test]
fn compressed_size_is_checked_before_inflating() {
    let raw = headerless_gzip(&[1u8; 64]);
    let text = c_array(
        "fw_image_prod_data",
        &[
            "COMPRESSION: YES".to_string(),
            "DATA SIZE (bytes): 64".to_string(),
            format!("COMPRESSED SIZE (bytes): {}", raw.len() + 1),
        ],
        &raw,
    );

    let err = extract_str(&text, "fw_image_prod_data").unwrap_err();
    assert!(matches!(err, ExtractError::SizeMismatch { actual, .. } if actual == raw.len()));
}

#[test]
fn uncompressed_size_mismatch() {
    let text = c_array(
        "fw_desc_data",
        &["COMPRESSION: NO".to_string(), "DATA SIZE (bytes): 8".to_string()],
        &[1, 2, 3],
    );
    let err = extract_str(&text, "fw_desc_data").unwrap_err();
    assert!(matches!(
        err,
        ExtractError::SizeMismatch {
            expected: 8,
            actual: 3,
            ..
        }
    ));
    let msg = err.to_string();
    assert!(msg.contains("g_bindata_test.c") && msg.contains("fw_desc_data"), "{msg}");
}

#[test]
fn missing_array_is_not_found() {
    let text = plain("fw_image_prod_data", &[1, 2, 3]);
    let err = extract_str(&text, "fw_image_dbg_data").unwrap_err();
    assert!(matches!(err, ExtractError::NotFound { ref array, .. } if array == "fw_image_dbg_data"));
}

#[test]
fn longer_declaration_does_not_match_prefix() {
    let text = plain("fw_image_prod_data_v2", &[1, 2, 3]);
    assert!(matches!(
        extract_str(&text, "fw_image_prod_data"),
        Err(ExtractError::NotFound { .. })
    ));
}

#[test]
fn empty_array() {
    let text = "// COMPRESSION: NO\n// DATA SIZE (bytes): 0\nstatic BINDATA_CONST NvU8 fw_empty_data[] =\n{\n};\n";
    assert!(matches!(
        extract_str(text, "fw_empty_data"),
        Err(ExtractError::EmptyArray { .. })
    ));
}

#[test]
fn most_recent_metadata_applies() {
    let first: Vec<u8> = vec![0xaa; 20];
    let second_data: Vec<u8> = (0..100u8).collect();
    let second_raw = headerless_gzip(&second_data);

    let mut text = plain("fw_first_data", &first);
    text.push_str(&compressed("fw_second_data", second_data.len(), &second_raw));
    text.push_str(&plain("fw_third_data", &[9, 9]));

    assert_eq!(extract_str(&text, "fw_first_data").unwrap(), first);
    assert_eq!(extract_str(&text, "fw_second_data").unwrap(), second_data);
    assert_eq!(extract_str(&text, "fw_third_data").unwrap(), vec![9, 9]);
}

#[test]
fn array_without_metadata() {
    let text = "static BINDATA_CONST NvU8 fw_bare_data[] =\n{\n    0x01, 0x02,\n};\n";
    assert!(matches!(
        extract_str(text, "fw_bare_data"),
        Err(ExtractError::MissingMetadata { .. })
    ));
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("g_bindata_missing.c");
    let err = extract_array(&path, "anything").unwrap_err();
    assert!(matches!(err, ExtractError::Io { .. }));
    assert!(err.to_string().contains("g_bindata_missing.c"));
}
