//! Container reader: parse images produced by the packer back into their parts.
//!
//! Does not interpret blob contents. Used by `nvfw-extract inspect` and to
//! check that written headers agree with the blobs they describe.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::elf::{SectionHeader, ELF_HEADER_SIZE, SECTION_HEADER_SIZE};
use crate::format::{
    read_u32, BinHeader, HsHeaderV2, PatchMeta, BIN_HDR_MAGIC, BIN_HDR_VERSION, HS_SIG_OFFSET,
};

/// Errors produced by the container reader.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated {what}: need {needed} bytes, have {len}")]
    Truncated {
        what: &'static str,
        needed: u64,
        len: usize,
    },
    #[error("invalid magic: expected 0x10de, found {0:#x}")]
    InvalidMagic(u32),
    #[error("unsupported nvfw_bin_hdr version: {0}")]
    UnsupportedVersion(u32),
    #[error("{what} at offset {offset} with size {size} extends past end of file ({len} bytes)")]
    OutOfRange {
        what: &'static str,
        offset: u64,
        size: u64,
        len: usize,
    },
    #[error("inconsistent header: {0}")]
    Inconsistent(&'static str),
    #[error("not a 32-bit little-endian ELF image")]
    NotElf,
    #[error("section name at .shstrtab offset {0} is not NUL-terminated UTF-8")]
    BadSectionName(u32),
    #[error("section {section}: CRC32 {actual:#010x} does not match sh_info {expected:#010x}")]
    ChecksumMismatch {
        section: String,
        expected: u32,
        actual: u32,
    },
}

/// Which container layout a file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Bootloader,
    SecureBoot,
    Fmc,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContainerKind::Bootloader => "bootloader",
            ContainerKind::SecureBoot => "secure-boot",
            ContainerKind::Fmc => "fmc",
        })
    }
}

/// Bootloader image: header, descriptor and firmware.
#[derive(Debug, Clone)]
pub struct BinImage<'a> {
    pub header: BinHeader,
    pub descriptor: &'a [u8],
    pub firmware: &'a [u8],
}

/// Booter / scrubber image.
#[derive(Debug, Clone)]
pub struct SecureBootImage<'a> {
    pub header: BinHeader,
    pub hs_header: HsHeaderV2,
    pub signatures: &'a [u8],
    pub patch_loc: u32,
    pub patch_sig: u32,
    pub patch_meta: PatchMeta,
    pub num_sigs: u32,
    pub descriptor: &'a [u8],
    pub firmware: &'a [u8],
}

/// One data section of an FMC ELF image.
#[derive(Debug, Clone)]
pub struct FmcSection<'a> {
    pub name: String,
    pub header: SectionHeader,
    pub data: &'a [u8],
}

/// Read a whole container file into memory.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, ReadError> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Guess the layout: ELF magic means FMC, a consistent `nvfw_hs_header_v2`
/// means secure boot, anything else with a valid `nvfw_bin_hdr` is a bootloader.
pub fn detect_kind(bytes: &[u8]) -> Result<ContainerKind, ReadError> {
    if bytes.starts_with(b"\x7fELF") {
        return Ok(ContainerKind::Fmc);
    }
    parse_bin_header(bytes)?;
    if parse_secure_boot_image(bytes).is_ok() {
        Ok(ContainerKind::SecureBoot)
    } else {
        Ok(ContainerKind::Bootloader)
    }
}

fn parse_bin_header(bytes: &[u8]) -> Result<BinHeader, ReadError> {
    let header = BinHeader::from_bytes(bytes).ok_or(ReadError::Truncated {
        what: "nvfw_bin_hdr",
        needed: BinHeader::SIZE as u64,
        len: bytes.len(),
    })?;
    if header.bin_magic != BIN_HDR_MAGIC {
        return Err(ReadError::InvalidMagic(header.bin_magic));
    }
    if header.bin_ver != BIN_HDR_VERSION {
        return Err(ReadError::UnsupportedVersion(header.bin_ver));
    }
    if header.bin_size % crate::format::TOTAL_SIZE_ALIGN != 0 {
        return Err(ReadError::Inconsistent("bin_size is not 256-byte aligned"));
    }
    Ok(header)
}

/// Parse a bootloader image.
pub fn parse_bin_image(bytes: &[u8]) -> Result<BinImage<'_>, ReadError> {
    let header = parse_bin_header(bytes)?;
    if header.data_offset < header.header_offset {
        return Err(ReadError::Inconsistent("firmware offset precedes descriptor"));
    }
    let descriptor = slice(
        bytes,
        "descriptor",
        header.header_offset,
        header.data_offset - header.header_offset,
    )?;
    let firmware = slice(bytes, "firmware", header.data_offset, header.data_size)?;
    check_bin_size(&header)?;
    Ok(BinImage {
        header,
        descriptor,
        firmware,
    })
}

/// Parse a booter / scrubber image.
pub fn parse_secure_boot_image(bytes: &[u8]) -> Result<SecureBootImage<'_>, ReadError> {
    let header = parse_bin_header(bytes)?;
    let hs_bytes = slice(bytes, "nvfw_hs_header_v2", header.header_offset, HsHeaderV2::SIZE as u32)?;
    let hs_header = HsHeaderV2::from_bytes(hs_bytes).ok_or(ReadError::Inconsistent("short nvfw_hs_header_v2"))?;
    if hs_header.sig_size > u32::MAX - crate::format::HS_FIXED_SIZE {
        return Err(ReadError::Inconsistent("signature block size overflows"));
    }
    if hs_header.sig_offset != HS_SIG_OFFSET || hs_header != HsHeaderV2::for_signatures(hs_header.sig_size) {
        return Err(ReadError::Inconsistent("nvfw_hs_header_v2 offsets do not follow the signature block"));
    }

    let signatures = slice(bytes, "signatures", hs_header.sig_offset, hs_header.sig_size)?;
    let word = |what: &'static str, offset: u32| {
        read_u32(bytes, offset as usize).ok_or(ReadError::OutOfRange {
            what,
            offset: u64::from(offset),
            size: 4,
            len: bytes.len(),
        })
    };
    let patch_loc = word("patch_loc", hs_header.patch_loc_offset)?;
    let patch_sig = word("patch_sig", hs_header.patch_sig_offset)?;
    let meta = slice(bytes, "patch metadata", hs_header.meta_data_offset, hs_header.meta_data_size)?;
    let patch_meta = PatchMeta::from_bytes(meta).ok_or(ReadError::Inconsistent("short patch metadata"))?;
    let num_sigs = word("num_sigs", hs_header.num_sig_offset)?;
    let descriptor = slice(bytes, "descriptor", hs_header.header_offset, hs_header.header_size)?;
    if header.data_offset != hs_header.header_offset + hs_header.header_size {
        return Err(ReadError::Inconsistent("firmware does not follow the descriptor"));
    }
    let firmware = slice(bytes, "firmware", header.data_offset, header.data_size)?;
    check_bin_size(&header)?;

    Ok(SecureBootImage {
        header,
        hs_header,
        signatures,
        patch_loc,
        patch_sig,
        patch_meta,
        num_sigs,
        descriptor,
        firmware,
    })
}

/// Parse an FMC ELF image and verify every data section's CRC32 against `sh_info`.
/// Returns the data sections (everything but the null section and `.shstrtab`) in table order.
pub fn parse_fmc_image(bytes: &[u8]) -> Result<Vec<FmcSection<'_>>, ReadError> {
    if bytes.len() < ELF_HEADER_SIZE as usize {
        return Err(ReadError::Truncated {
            what: "ELF header",
            needed: u64::from(ELF_HEADER_SIZE),
            len: bytes.len(),
        });
    }
    if !bytes.starts_with(b"\x7fELF") || bytes[4] != 1 || bytes[5] != 1 {
        return Err(ReadError::NotElf);
    }
    let half = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
    let shoff = read_u32(bytes, 32).ok_or(ReadError::NotElf)?;
    let shentsize = half(46);
    let shnum = half(48);
    let shstrndx = half(50);
    if u32::from(shentsize) != SECTION_HEADER_SIZE {
        return Err(ReadError::Inconsistent("unexpected e_shentsize"));
    }
    if shstrndx == 0 || shstrndx >= shnum {
        return Err(ReadError::Inconsistent("e_shstrndx out of range"));
    }

    let table = slice(bytes, "section header table", shoff, u32::from(shnum) * SECTION_HEADER_SIZE)?;
    let headers: Vec<SectionHeader> = table
        .chunks_exact(SECTION_HEADER_SIZE as usize)
        .filter_map(SectionHeader::from_bytes)
        .collect();
    let strtab_header = headers[usize::from(shstrndx)];
    let strtab = slice(bytes, ".shstrtab", strtab_header.sh_offset, strtab_header.sh_size)?;

    let mut sections = Vec::new();
    for (index, header) in headers.iter().enumerate() {
        if index == 0 || index == usize::from(shstrndx) {
            continue;
        }
        let name = section_name(strtab, header.sh_name)?;
        let data = slice(bytes, "section", header.sh_offset, header.sh_size)?;
        let actual = crc32fast::hash(data);
        if actual != header.sh_info {
            return Err(ReadError::ChecksumMismatch {
                section: name,
                expected: header.sh_info,
                actual,
            });
        }
        sections.push(FmcSection {
            name,
            header: *header,
            data,
        });
    }
    Ok(sections)
}

fn section_name(strtab: &[u8], offset: u32) -> Result<String, ReadError> {
    let bad = || ReadError::BadSectionName(offset);
    let tail = strtab.get(offset as usize..).ok_or_else(bad)?;
    let end = tail.iter().position(|&b| b == 0).ok_or_else(bad)?;
    String::from_utf8(tail[..end].to_vec()).map_err(|_| bad())
}

fn check_bin_size(header: &BinHeader) -> Result<(), ReadError> {
    let end = u64::from(header.data_offset) + u64::from(header.data_size);
    if u64::from(header.bin_size) < end {
        return Err(ReadError::Inconsistent("bin_size smaller than the firmware end"));
    }
    Ok(())
}

fn slice<'a>(bytes: &'a [u8], what: &'static str, offset: u32, size: u32) -> Result<&'a [u8], ReadError> {
    let start = offset as usize;
    start
        .checked_add(size as usize)
        .and_then(|end| bytes.get(start..end))
        .ok_or(ReadError::OutOfRange {
            what,
            offset: u64::from(offset),
            size: u64::from(size),
            len: bytes.len(),
        })
}
