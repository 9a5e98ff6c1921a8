//! ELF assembler tests: section layout, alignment and CRC32 in sh_info.

use nvfw::elf::{SHF_OS_NONCONFORMING, SHT_PROGBITS, SHT_STRTAB};
use nvfw::format::read_u32;
use nvfw::reader::parse_fmc_image;
use nvfw::{assemble_elf, ReadError, Section, SectionHeader};

fn half(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn sample_sections() -> Vec<Section> {
    vec![
        Section::new("hash", vec![0x11; 3]),
        Section::new("signature", vec![0x22; 5]),
        Section::new("publickey", vec![0x33; 7]),
        Section::new("image", (0..9u8).collect()),
    ]
}

fn section_headers(bytes: &[u8]) -> Vec<SectionHeader> {
    let shoff = read_u32(bytes, 32).unwrap() as usize;
    let shnum = usize::from(half(bytes, 48));
    (0..shnum)
        .map(|i| SectionHeader::from_bytes(&bytes[shoff + i * 40..]).unwrap())
        .collect()
}

#[test]
fn elf_header_fields() {
    let bytes = assemble_elf(&sample_sections()).unwrap();
    assert_eq!(&bytes[..4], b"\x7fELF");
    assert_eq!(bytes[4], 1); // 32-bit
    assert_eq!(bytes[5], 1); // little-endian
    assert_eq!(read_u32(&bytes, 28).unwrap(), 0); // e_phoff
    assert_eq!(read_u32(&bytes, 32).unwrap(), 52); // e_shoff
    assert_eq!(half(&bytes, 40), 52); // e_ehsize
    assert_eq!(half(&bytes, 44), 0); // e_phnum
    assert_eq!(half(&bytes, 46), 40); // e_shentsize
    assert_eq!(half(&bytes, 48), 6); // e_shnum
    assert_eq!(half(&bytes, 50), 1); // e_shstrndx
}

#[test]
fn sections_are_aligned_and_checksummed() {
    let sections = sample_sections();
    let bytes = assemble_elf(&sections).unwrap();
    let headers = section_headers(&bytes);
    assert_eq!(headers.len(), 6);
    assert_eq!(headers[0], SectionHeader::default());

    let strtab = &headers[1];
    assert_eq!(strtab.sh_type, SHT_STRTAB);
    assert_eq!(strtab.sh_offset, 52 + 6 * 40);
    let expected_strtab = b"\0.shstrtab\0hash\0signature\0publickey\0image\0";
    assert_eq!(strtab.sh_size as usize, expected_strtab.len());
    let start = strtab.sh_offset as usize;
    assert_eq!(&bytes[start..start + expected_strtab.len()], expected_strtab);

    for (section, header) in sections.iter().zip(&headers[2..]) {
        assert_eq!(header.sh_offset % 4, 0, "{} misaligned", section.name);
        assert_eq!(header.sh_type, SHT_PROGBITS);
        assert_eq!(header.sh_flags, SHF_OS_NONCONFORMING);
        assert_eq!(header.sh_addralign, 4);
        assert_eq!(header.sh_entsize, 0);
        assert_eq!(header.sh_size as usize, section.data.len());
        assert_eq!(header.sh_info, crc32fast::hash(&section.data));
        assert_ne!(header.sh_info, crc32fast::hash(&[section.data.as_slice(), &[0u8][..]].concat()));

        let start = header.sh_offset as usize;
        assert_eq!(&bytes[start..start + section.data.len()], section.data.as_slice());
    }

    // 42-byte string table pads to 44; sections pad to 4, 8, 8, 12.
    assert_eq!(headers[2].sh_offset, 292 + 44);
    assert_eq!(headers[3].sh_offset, 292 + 44 + 4);
    assert_eq!(headers[4].sh_offset, 292 + 44 + 12);
    assert_eq!(headers[5].sh_offset, 292 + 44 + 20);
    assert_eq!(bytes.len(), 292 + 44 + 32);
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(&bytes[292 + 44 + 3..292 + 44 + 4], &[0]);
}

#[test]
fn reader_resolves_names_and_checks_crc() {
    let sections = sample_sections();
    let bytes = assemble_elf(&sections).unwrap();

    let parsed = parse_fmc_image(&bytes).unwrap();
    let names: Vec<&str> = parsed.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["hash", "signature", "publickey", "image"]);
    for (orig, got) in sections.iter().zip(&parsed) {
        assert_eq!(got.data, orig.data.as_slice());
    }

    let mut corrupt = bytes.clone();
    let image_offset = parsed[3].header.sh_offset as usize;
    corrupt[image_offset] ^= 0xff;
    assert!(matches!(
        parse_fmc_image(&corrupt),
        Err(ReadError::ChecksumMismatch { ref section, .. }) if section == "image"
    ));
}

#[test]
fn aligned_sections_get_no_padding() {
    let sections = vec![Section::new("image", vec![1u8; 8])];
    let bytes = assemble_elf(&sections).unwrap();
    let headers = section_headers(&bytes);
    assert_eq!(headers.len(), 3);
    // "\0.shstrtab\0image\0" is 17 bytes -> 20.
    assert_eq!(headers[2].sh_offset, 52 + 3 * 40 + 20);
    assert_eq!(bytes.len() as u32, headers[2].sh_offset + 8);
}
