//! nvfw: extracts GSP firmware from generated NVIDIA bindata sources and
//! repackages it into the containers the nouveau firmware loader expects.
//!
//! This crate provides:
//! - **Array extractor** (`extract`): `extract_array(path, name)` pulls one hex byte array
//!   (optionally gzip-compressed) out of a generated `g_bindata_*.c` file, with size checks.
//! - **Formats** (`format`): `nvfw_bin_hdr`, `nvfw_hs_header_v2`, patch metadata, rounding.
//! - **ELF assembler** (`elf`): section-only 32-bit ELF images with CRC32 in `sh_info`.
//! - **Packer** (`packer`): bootloader, secure-boot (booter / scrubber) and FMC builders.
//! - **Reader** (`reader`): parse built containers back for inspection.
//! - **Targets** (`targets`): per-GPU firmware table and source naming conventions.
//! - **Config** (`config`): immutable run configuration and the batch driver.

pub mod config;
pub mod elf;
pub mod extract;
pub mod format;
pub mod packer;
pub mod reader;
pub mod targets;

pub use config::{build_one, run, BuildReport, OutputRecord, RunConfig, RunError};
pub use elf::{assemble_elf, write_elf, ElfError, Section, SectionHeader};
pub use extract::{extract_array, extract_array_from_reader, BlobSource, ExtractError, SourceFile};
pub use format::{round_up_to_base, BinHeader, HsHeaderV2, PatchMeta, BIN_HDR_MAGIC, BIN_HDR_VERSION};
pub use packer::{build, build_to_vec, write_bootloader, write_secure_boot, BuildError, SecureBootParts};
pub use reader::{
    detect_kind, parse_bin_image, parse_fmc_image, parse_secure_boot_image, ContainerKind, ReadError,
};
pub use targets::{
    resolve, ArrayNames, BooterDirection, FirmwareSpec, Fuse, SourceNaming, Target, TargetError,
    TargetTable,
};
