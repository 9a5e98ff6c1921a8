//! Array extractor: pull one named byte array out of a generated bindata `.c` file.
//!
//! The generated files declare each array after a comment block such as:
//!
//! ```text
//! // COMPRESSION: YES
//! // DATA SIZE (bytes): 5376
//! // COMPRESSED SIZE (bytes): 3002
//! //
//! static BINDATA_CONST NvU8 ksec2BinArchiveSecurescrubUcode_AD10X_image_prod_data[] =
//! {
//!     0xed, 0xd8, 0x03, ...
//! };
//! ```
//!
//! Scanning is a single forward pass. Metadata lines update the most recently
//! seen compression flag and sizes; the declaration line switches to byte
//! accumulation, which ends at the first line containing `};`.
//! Compressed payloads are gzip members with the 10-byte header stripped.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::debug;
use thiserror::Error;

/// Literal prefix of every array declaration in the generated sources.
pub const DECLARATION_PREFIX: &str = "static BINDATA_CONST NvU8 ";

/// Minimal gzip member header: deflate, no flags, no mtime, no extra flags, OS = Unix.
pub const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];

const COMPRESSION_TAG: &str = "COMPRESSION: ";
const DATA_SIZE_TAG: &str = "DATA SIZE (bytes): ";
const COMPRESSED_SIZE_TAG: &str = "COMPRESSED SIZE (bytes): ";
const ARRAY_END: &str = "};";

/// Errors produced while extracting an array.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{}: IO error: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: array {array} not found", path.display())]
    NotFound { path: PathBuf, array: String },
    #[error("{}: array {array} contains no bytes", path.display())]
    EmptyArray { path: PathBuf, array: String },
    #[error("{}: array {array} has no preceding {field} metadata", path.display())]
    MissingMetadata {
        path: PathBuf,
        array: String,
        field: &'static str,
    },
    #[error("{}: array {array}: expected {expected} bytes, found {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        array: String,
        expected: usize,
        actual: usize,
    },
    /// `actual` stops counting one byte past `expected`.
    #[error("{}: array {array}: expected {expected} bytes after decompression, got {actual}", path.display())]
    DecompressedSizeMismatch {
        path: PathBuf,
        array: String,
        expected: usize,
        actual: usize,
    },
    #[error("{}: array {array}: gzip stream is corrupt: {source}", path.display())]
    Decompress {
        path: PathBuf,
        array: String,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata declared in the comment block most recently seen before an array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayMetadata {
    pub compressed: Option<bool>,
    pub data_size: Option<usize>,
    pub compressed_size: Option<usize>,
}

/// Something that can hand out named byte blobs.
///
/// Builders only see this trait; [`SourceFile`] reads generated sources,
/// tests can use an in-memory map.
pub trait BlobSource {
    fn blob(&self, array: &str) -> Result<Vec<u8>, ExtractError>;
}

/// A generated bindata source file on disk. Each [`BlobSource::blob`] call rescans the file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    path: PathBuf,
}

impl SourceFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlobSource for SourceFile {
    fn blob(&self, array: &str) -> Result<Vec<u8>, ExtractError> {
        extract_array(&self.path, array)
    }
}

impl BlobSource for std::collections::HashMap<String, Vec<u8>> {
    fn blob(&self, array: &str) -> Result<Vec<u8>, ExtractError> {
        self.get(array).cloned().ok_or_else(|| ExtractError::NotFound {
            path: PathBuf::from("<memory>"),
            array: array.to_string(),
        })
    }
}

/// Open `path` read-only and extract the array named `array`.
pub fn extract_array<P: AsRef<Path>>(path: P, array: &str) -> Result<Vec<u8>, ExtractError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    extract_array_from_reader(BufReader::new(file), path, array)
}

/// Extract `array` from already-open generated source text. `path` is only used in errors.
pub fn extract_array_from_reader<R: BufRead>(
    reader: R,
    path: &Path,
    array: &str,
) -> Result<Vec<u8>, ExtractError> {
    let io_err = |source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut meta = ArrayMetadata::default();
    let mut lines = reader.lines();
    let mut found = false;

    for line in lines.by_ref() {
        let line = line.map_err(io_err)?;
        match classify(&line, array) {
            Line::Compression(flag) => meta.compressed = Some(flag),
            Line::DataSize(n) => meta.data_size = Some(n),
            Line::CompressedSize(n) => meta.compressed_size = Some(n),
            Line::Declaration => {
                found = true;
                break;
            }
            Line::Other => {}
        }
    }
    if !found {
        return Err(ExtractError::NotFound {
            path: path.to_path_buf(),
            array: array.to_string(),
        });
    }

    let mut raw = Vec::new();
    for line in lines {
        let line = line.map_err(io_err)?;
        if line.contains(ARRAY_END) {
            break;
        }
        push_hex_bytes(&line, &mut raw);
    }

    debug!(
        "{}: {array}: {} raw bytes, metadata {:?}",
        path.display(),
        raw.len(),
        meta
    );
    decode_payload(raw, meta, path, array)
}

/// Validate accumulated bytes against `meta` and decompress if needed.
pub fn decode_payload(
    raw: Vec<u8>,
    meta: ArrayMetadata,
    path: &Path,
    array: &str,
) -> Result<Vec<u8>, ExtractError> {
    let missing = |field| ExtractError::MissingMetadata {
        path: path.to_path_buf(),
        array: array.to_string(),
        field,
    };

    if raw.is_empty() {
        return Err(ExtractError::EmptyArray {
            path: path.to_path_buf(),
            array: array.to_string(),
        });
    }

    let compressed = meta.compressed.ok_or_else(|| missing("COMPRESSION"))?;
    let data_size = meta.data_size.ok_or_else(|| missing("DATA SIZE"))?;

    if !compressed {
        if raw.len() != data_size {
            return Err(ExtractError::SizeMismatch {
                path: path.to_path_buf(),
                array: array.to_string(),
                expected: data_size,
                actual: raw.len(),
            });
        }
        return Ok(raw);
    }

    let compressed_size = meta
        .compressed_size
        .ok_or_else(|| missing("COMPRESSED SIZE"))?;
    if raw.len() != compressed_size {
        return Err(ExtractError::SizeMismatch {
            path: path.to_path_buf(),
            array: array.to_string(),
            expected: compressed_size,
            actual: raw.len(),
        });
    }

    let mut stream = Vec::with_capacity(GZIP_HEADER.len() + raw.len());
    stream.extend_from_slice(&GZIP_HEADER);
    stream.extend_from_slice(&raw);

    // One byte past the declared size is enough to detect an oversized payload.
    let limit = (data_size as u64).saturating_add(1);
    let mut output = Vec::new();
    GzDecoder::new(stream.as_slice())
        .take(limit)
        .read_to_end(&mut output)
        .map_err(|source| ExtractError::Decompress {
            path: path.to_path_buf(),
            array: array.to_string(),
            source,
        })?;

    if output.len() != data_size {
        return Err(ExtractError::DecompressedSizeMismatch {
            path: path.to_path_buf(),
            array: array.to_string(),
            expected: data_size,
            actual: output.len(),
        });
    }
    Ok(output)
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Compression(bool),
    DataSize(usize),
    CompressedSize(usize),
    Declaration,
    Other,
}

fn classify(line: &str, array: &str) -> Line {
    if let Some(rest) = after(line, COMPRESSION_TAG) {
        if rest.starts_with("YES") {
            return Line::Compression(true);
        }
        if rest.starts_with("NO") {
            return Line::Compression(false);
        }
    }
    if let Some(n) = after(line, COMPRESSED_SIZE_TAG).and_then(leading_number) {
        return Line::CompressedSize(n);
    }
    if let Some(n) = after(line, DATA_SIZE_TAG).and_then(leading_number) {
        return Line::DataSize(n);
    }
    if let Some(rest) = after(line, DECLARATION_PREFIX) {
        if let Some(tail) = rest.strip_prefix(array) {
            if !tail.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
                return Line::Declaration;
            }
        }
    }
    Line::Other
}

fn after<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.find(tag).map(|i| &line[i + tag.len()..])
}

fn leading_number(s: &str) -> Option<usize> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Append every `0x[0-9a-f]{2}` literal in `line` to `out`.
///
/// Matches the regex semantics exactly: lowercase digits only, and a literal
/// like `0x123` contributes its first two digits.
fn push_hex_bytes(line: &str, out: &mut Vec<u8>) {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i + 4 <= bytes.len() {
        if bytes[i] == b'0' && bytes[i + 1] == b'x' {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 2]), hex_digit(bytes[i + 3])) {
                out.push((hi << 4) | lo);
                i += 4;
                continue;
            }
        }
        i += 1;
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}
