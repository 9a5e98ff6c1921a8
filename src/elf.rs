//! Minimal 32-bit little-endian ELF writer for FMC images.
//!
//! The output has no program headers. Besides the null section and
//! `.shstrtab`, every section is an opaque data blob whose header carries
//! the CRC32 of the (unpadded) contents in `sh_info`. The nouveau loader
//! looks sections up by name and checks that checksum.
//!
//! File layout: ELF header, section header table, `.shstrtab`, data sections.
//! Every section starts on a 4-byte boundary; padding bytes are zero.

use std::io::Write;

use log::debug;
use thiserror::Error;

pub const ELF_HEADER_SIZE: u32 = 52;
pub const SECTION_HEADER_SIZE: u32 = 40;
pub const SECTION_ALIGN: u32 = 4;

/// Index of `.shstrtab` in the section header table (0 is the null section).
pub const SHSTRTAB_INDEX: u16 = 1;
pub const SHSTRTAB_NAME: &str = ".shstrtab";

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ELFOSABI_SYSV: u8 = 0;
const ET_NONE: u16 = 0;
const EM_NONE: u16 = 0;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_STRTAB: u32 = 3;
pub const SHF_STRINGS: u32 = 0x20;
/// Marks the data sections as needing OS-specific handling.
pub const SHF_OS_NONCONFORMING: u32 = 0x100;

/// Errors produced by the ELF assembler.
#[derive(Debug, Error)]
pub enum ElfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("section name {0:?} not found in .shstrtab")]
    UnknownSectionName(String),
    #[error("section {section:?} ends at offset {offset}, not 4-byte aligned")]
    Misaligned { section: String, offset: u64 },
    #[error("ELF image exceeds 4 GiB")]
    TooLarge,
}

/// One named data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
}

impl Section {
    pub fn new<S: Into<String>>(name: S, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// `Elf32_Shdr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

impl SectionHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SECTION_HEADER_SIZE as usize] {
        let mut out = [0u8; SECTION_HEADER_SIZE as usize];
        let fields = [
            self.sh_name,
            self.sh_type,
            self.sh_flags,
            self.sh_addr,
            self.sh_offset,
            self.sh_size,
            self.sh_link,
            self.sh_info,
            self.sh_addralign,
            self.sh_entsize,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// Decode one 40-byte entry; `None` if `bytes` is shorter.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let f = |i: usize| crate::format::read_u32(bytes, i * 4);
        Some(Self {
            sh_name: f(0)?,
            sh_type: f(1)?,
            sh_flags: f(2)?,
            sh_addr: f(3)?,
            sh_offset: f(4)?,
            sh_size: f(5)?,
            sh_link: f(6)?,
            sh_info: f(7)?,
            sh_addralign: f(8)?,
            sh_entsize: f(9)?,
        })
    }
}

/// Number of zero bytes needed to bring `len` up to a multiple of [`SECTION_ALIGN`].
#[must_use]
pub fn padding_for(len: u32) -> u32 {
    (SECTION_ALIGN - len % SECTION_ALIGN) % SECTION_ALIGN
}

/// Build the `.shstrtab` contents: NUL, `.shstrtab` NUL, then each name NUL in order.
#[must_use]
pub fn build_shstrtab<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Vec<u8> {
    let mut strtab = vec![0u8];
    strtab.extend_from_slice(SHSTRTAB_NAME.as_bytes());
    strtab.push(0);
    for name in names {
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    strtab
}

/// Offset of the NUL-terminated string `name` in `strtab`.
///
/// Only whole entries match: the candidate must start the table or follow a NUL.
pub fn name_offset(strtab: &[u8], name: &str) -> Result<u32, ElfError> {
    let needle = name.as_bytes();
    let unknown = || ElfError::UnknownSectionName(name.to_string());
    if needle.is_empty() || needle.contains(&0) {
        return Err(unknown());
    }
    let mut start = 0usize;
    while start + needle.len() < strtab.len() {
        let at_boundary = start == 0 || strtab[start - 1] == 0;
        if at_boundary
            && strtab[start..start + needle.len()] == *needle
            && strtab[start + needle.len()] == 0
        {
            return u32::try_from(start).map_err(|_| ElfError::TooLarge);
        }
        start += 1;
    }
    Err(unknown())
}

/// Assemble an ELF image holding `sections` in order. Returns the bytes written.
pub fn write_elf<W: Write>(out: &mut W, sections: &[Section]) -> Result<u64, ElfError> {
    let strtab = build_shstrtab(sections.iter().map(|s| s.name.as_str()));
    let strtab_len = u32::try_from(strtab.len()).map_err(|_| ElfError::TooLarge)?;
    let shnum = u16::try_from(sections.len() + 2).map_err(|_| ElfError::TooLarge)?;

    let table_end = ELF_HEADER_SIZE + u32::from(shnum) * SECTION_HEADER_SIZE;

    // Offsets must be known before any header is written.
    let mut headers = Vec::with_capacity(usize::from(shnum));
    headers.push(SectionHeader::default());
    headers.push(SectionHeader {
        sh_name: name_offset(&strtab, SHSTRTAB_NAME)?,
        sh_type: SHT_STRTAB,
        sh_flags: SHF_STRINGS,
        sh_offset: table_end,
        sh_size: strtab_len,
        sh_addralign: 1,
        ..SectionHeader::default()
    });

    let mut offset = checked_add(table_end, checked_add(strtab_len, padding_for(strtab_len))?)?;
    for section in sections {
        let size = u32::try_from(section.data.len()).map_err(|_| ElfError::TooLarge)?;
        headers.push(SectionHeader {
            sh_name: name_offset(&strtab, &section.name)?,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_OS_NONCONFORMING,
            sh_offset: offset,
            sh_size: size,
            sh_info: crc32fast::hash(&section.data),
            sh_addralign: SECTION_ALIGN,
            ..SectionHeader::default()
        });
        offset = checked_add(offset, checked_add(size, padding_for(size))?)?;
    }

    let mut written: u64 = 0;
    out.write_all(&elf_header(shnum))?;
    written += u64::from(ELF_HEADER_SIZE);
    for header in &headers {
        out.write_all(&header.to_bytes())?;
        written += u64::from(SECTION_HEADER_SIZE);
    }
    check_aligned("section header table", written)?;

    written += write_padded(out, &strtab)?;
    check_aligned(SHSTRTAB_NAME, written)?;

    for (section, header) in sections.iter().zip(&headers[2..]) {
        debug!(
            "elf: {} at {:#x}, {} bytes, crc32 {:#010x}",
            section.name, header.sh_offset, header.sh_size, header.sh_info
        );
        written += write_padded(out, &section.data)?;
        check_aligned(&section.name, written)?;
    }
    Ok(written)
}

/// [`write_elf`] into a fresh buffer.
pub fn assemble_elf(sections: &[Section]) -> Result<Vec<u8>, ElfError> {
    let mut buf = Vec::new();
    write_elf(&mut buf, sections)?;
    Ok(buf)
}

fn elf_header(shnum: u16) -> [u8; ELF_HEADER_SIZE as usize] {
    let mut h = [0u8; ELF_HEADER_SIZE as usize];
    h[..4].copy_from_slice(b"\x7fELF");
    h[4] = ELFCLASS32;
    h[5] = ELFDATA2LSB;
    h[6] = EV_CURRENT;
    h[7] = ELFOSABI_SYSV;
    h[16..18].copy_from_slice(&ET_NONE.to_le_bytes());
    h[18..20].copy_from_slice(&EM_NONE.to_le_bytes());
    h[20..24].copy_from_slice(&u32::from(EV_CURRENT).to_le_bytes());
    // e_entry (24) and e_phoff (28) stay zero.
    h[32..36].copy_from_slice(&ELF_HEADER_SIZE.to_le_bytes()); // e_shoff
    // e_flags (36) stays zero.
    h[40..42].copy_from_slice(&(ELF_HEADER_SIZE as u16).to_le_bytes()); // e_ehsize
    // e_phentsize (42) and e_phnum (44) stay zero.
    h[46..48].copy_from_slice(&(SECTION_HEADER_SIZE as u16).to_le_bytes());
    h[48..50].copy_from_slice(&shnum.to_le_bytes());
    h[50..52].copy_from_slice(&SHSTRTAB_INDEX.to_le_bytes());
    h
}

fn write_padded<W: Write>(out: &mut W, data: &[u8]) -> Result<u64, ElfError> {
    let len = u32::try_from(data.len()).map_err(|_| ElfError::TooLarge)?;
    let pad = padding_for(len);
    out.write_all(data)?;
    out.write_all(&[0u8; SECTION_ALIGN as usize][..pad as usize])?;
    Ok(u64::from(len) + u64::from(pad))
}

fn check_aligned(section: &str, offset: u64) -> Result<(), ElfError> {
    if offset % u64::from(SECTION_ALIGN) != 0 {
        return Err(ElfError::Misaligned {
            section: section.to_string(),
            offset,
        });
    }
    Ok(())
}

fn checked_add(a: u32, b: u32) -> Result<u32, ElfError> {
    a.checked_add(b).ok_or(ElfError::TooLarge)
}
