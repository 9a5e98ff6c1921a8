//! Container builders: fold extracted blobs and computed headers into the
//! byte layouts the nouveau firmware loader reads.
//!
//! The `write_*` functions take blobs that are already in memory; `build`
//! pulls them from a [`BlobSource`] by the names in an [`ArrayNames`].

use std::io::Write;

use log::{debug, warn};
use thiserror::Error;

use crate::elf::{write_elf, ElfError, Section};
use crate::extract::{BlobSource, ExtractError};
use crate::format::{
    round_up_to_base, BinHeader, HsHeaderV2, PatchMeta, HS_DESCRIPTOR_SIZE, HS_FIXED_SIZE,
    TOTAL_SIZE_ALIGN,
};
use crate::targets::ArrayNames;

/// Errors produced by the container builders.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("ELF: {0}")]
    Elf(#[from] ElfError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("signature block of {len} bytes is not a multiple of {sig_size}-byte signatures")]
    UnevenSignatureBlock { len: usize, sig_size: u32 },
    #[error("signature block contains no signatures")]
    NoSignatures,
    #[error("array {array}: expected {expected} bytes, found {actual}")]
    UnexpectedBlobSize {
        array: String,
        expected: usize,
        actual: usize,
    },
    #[error("container exceeds 4 GiB")]
    TooLarge,
}

/// Blobs of a secure-boot (booter / scrubber) image.
#[derive(Debug, Clone)]
pub struct SecureBootParts<'a> {
    pub signatures: &'a [u8],
    /// Bytes per signature (16 or 384).
    pub sig_size: u32,
    pub patch_loc: u32,
    pub patch_meta: PatchMeta,
    pub descriptor: &'a [u8],
    pub firmware: &'a [u8],
}

/// Write a bootloader image: `nvfw_bin_hdr`, descriptor, firmware.
/// Returns the number of bytes written.
pub fn write_bootloader<W: Write>(
    out: &mut W,
    descriptor: &[u8],
    firmware: &[u8],
) -> Result<u64, BuildError> {
    let desc_len = len_u32(descriptor)?;
    let fw_len = len_u32(firmware)?;
    let firmware_offset = checked_sum(&[BinHeader::SIZE as u32, desc_len])?;
    let total_size = padded_total_size(checked_sum(&[firmware_offset, fw_len])?)?;

    let header = BinHeader::new(total_size, firmware_offset, fw_len);
    out.write_all(&header.to_bytes())?;
    out.write_all(descriptor)?;
    out.write_all(firmware)?;
    Ok(u64::from(firmware_offset) + u64::from(fw_len))
}

/// Number of signatures in a block, checking the block divides evenly.
pub fn signature_count(signatures: &[u8], sig_size: u32) -> Result<u32, BuildError> {
    let uneven = || BuildError::UnevenSignatureBlock {
        len: signatures.len(),
        sig_size,
    };
    if sig_size == 0 {
        return Err(uneven());
    }
    let sig_size_usize = sig_size as usize;
    if signatures.len() % sig_size_usize != 0 {
        return Err(uneven());
    }
    let num_sigs = u32::try_from(signatures.len() / sig_size_usize).map_err(|_| BuildError::TooLarge)?;
    if num_sigs < 1 {
        return Err(BuildError::NoSignatures);
    }
    Ok(num_sigs)
}

/// Write a secure-boot image: `nvfw_bin_hdr`, `nvfw_hs_header_v2`, signatures,
/// patch location, patch signature index (0), patch metadata, signature count,
/// descriptor, firmware. Returns the number of bytes written.
pub fn write_secure_boot<W: Write>(out: &mut W, parts: &SecureBootParts<'_>) -> Result<u64, BuildError> {
    let num_sigs = signature_count(parts.signatures, parts.sig_size)?;
    let sigs_len = len_u32(parts.signatures)?;
    let fw_len = len_u32(parts.firmware)?;
    let desc_len = len_u32(parts.descriptor)?;
    if desc_len != HS_DESCRIPTOR_SIZE {
        warn!(
            "secure-boot descriptor is {desc_len} bytes, not {HS_DESCRIPTOR_SIZE}; firmware offset assumes {HS_DESCRIPTOR_SIZE}"
        );
    }

    let firmware_offset = checked_sum(&[HS_FIXED_SIZE, sigs_len])?;
    let total_size = padded_total_size(checked_sum(&[firmware_offset, fw_len])?)?;

    let bin_header = BinHeader::new(total_size, firmware_offset, fw_len);
    let hs_header = HsHeaderV2::for_signatures(sigs_len);
    debug!(
        "secure-boot: {num_sigs} x {} byte signatures, firmware at {firmware_offset:#x}, total {total_size:#x}",
        parts.sig_size
    );

    let mut written: u64 = 0;
    out.write_all(&bin_header.to_bytes())?;
    out.write_all(&hs_header.to_bytes())?;
    out.write_all(parts.signatures)?;
    written += (BinHeader::SIZE + HsHeaderV2::SIZE) as u64 + u64::from(sigs_len);

    let fields = [
        parts.patch_loc,
        0, // patch_sig
        parts.patch_meta.fuse_ver,
        parts.patch_meta.engine_id,
        parts.patch_meta.ucode_id,
        num_sigs,
    ];
    for field in fields {
        out.write_all(&field.to_le_bytes())?;
    }
    written += (fields.len() * 4) as u64;

    out.write_all(parts.descriptor)?;
    out.write_all(parts.firmware)?;
    written += u64::from(desc_len) + u64::from(fw_len);
    Ok(written)
}

/// Build the container described by `names` from blobs in `source`, writing it to `out`.
pub fn build<S: BlobSource + ?Sized, W: Write>(
    source: &S,
    names: &ArrayNames,
    out: &mut W,
) -> Result<u64, BuildError> {
    match names {
        ArrayNames::Bootloader { image, descriptor } => {
            let firmware = source.blob(image)?;
            let descriptor = source.blob(descriptor)?;
            write_bootloader(out, &descriptor, &firmware)
        }
        ArrayNames::SecureBoot {
            image,
            signatures,
            patch_loc,
            patch_meta,
            descriptor,
            sig_size,
        } => {
            let firmware = source.blob(image)?;
            let signatures = source.blob(signatures)?;
            // Reject a bad signature block before reading the remaining arrays.
            signature_count(&signatures, *sig_size)?;

            let loc_bytes = source.blob(patch_loc)?;
            let patch_loc = fixed_blob::<4>(patch_loc, &loc_bytes).map(u32::from_le_bytes)?;
            let meta_bytes = source.blob(patch_meta)?;
            let patch_meta = fixed_blob::<{ PatchMeta::SIZE }>(patch_meta, &meta_bytes).map(PatchMeta::from)?;
            let descriptor = source.blob(descriptor)?;

            write_secure_boot(
                out,
                &SecureBootParts {
                    signatures: &signatures,
                    sig_size: *sig_size,
                    patch_loc,
                    patch_meta,
                    descriptor: &descriptor,
                    firmware: &firmware,
                },
            )
        }
        ArrayNames::Fmc { sections } => {
            let sections = sections
                .iter()
                .map(|(name, array)| Ok(Section::new(*name, source.blob(array)?)))
                .collect::<Result<Vec<_>, BuildError>>()?;
            Ok(write_elf(out, &sections)?)
        }
    }
}

/// [`build`] into a fresh buffer.
pub fn build_to_vec<S: BlobSource + ?Sized>(source: &S, names: &ArrayNames) -> Result<Vec<u8>, BuildError> {
    let mut buf = Vec::new();
    build(source, names, &mut buf)?;
    Ok(buf)
}

fn fixed_blob<const N: usize>(array: &str, bytes: &[u8]) -> Result<[u8; N], BuildError> {
    bytes.try_into().map_err(|_| BuildError::UnexpectedBlobSize {
        array: array.to_string(),
        expected: N,
        actual: bytes.len(),
    })
}

/// Container size rounded up to [`TOTAL_SIZE_ALIGN`].
fn padded_total_size(unpadded: u32) -> Result<u32, BuildError> {
    if unpadded > u32::MAX - TOTAL_SIZE_ALIGN {
        return Err(BuildError::TooLarge);
    }
    Ok(round_up_to_base(unpadded, TOTAL_SIZE_ALIGN))
}

fn len_u32(bytes: &[u8]) -> Result<u32, BuildError> {
    u32::try_from(bytes.len()).map_err(|_| BuildError::TooLarge)
}

fn checked_sum(values: &[u32]) -> Result<u32, BuildError> {
    values
        .iter()
        .try_fold(0u32, |acc, v| acc.checked_add(*v))
        .ok_or(BuildError::TooLarge)
}
