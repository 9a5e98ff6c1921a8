//! Fixed-width container layouts and constants.
//!
//! Defines the `nvfw_bin_hdr` and `nvfw_hs_header_v2` layouts consumed by the
//! nouveau firmware loader. All multi-byte fields are little-endian `u32`.

/// Magic value in the first field of every `nvfw_bin_hdr`.
pub const BIN_HDR_MAGIC: u32 = 0x10de;

/// `nvfw_bin_hdr` version written by the packer.
pub const BIN_HDR_VERSION: u32 = 1;

/// Every container's `total_size` is rounded up to this many bytes.
pub const TOTAL_SIZE_ALIGN: u32 = 256;

/// Offset of the signature block inside a secure-boot container
/// (`nvfw_bin_hdr` + `nvfw_hs_header_v2`).
pub const HS_SIG_OFFSET: u32 = (BinHeader::SIZE + HsHeaderV2::SIZE) as u32;

/// Size of the patch metadata triple (fuse version, engine id, ucode id).
pub const HS_META_DATA_SIZE: u32 = 12;

/// Size of the load descriptor that the fixed secure-boot prefix assumes.
pub const HS_DESCRIPTOR_SIZE: u32 = 36;

/// Bytes in a secure-boot container before the signatures, plus everything
/// after them up to the firmware image: headers (60), patch/meta fields (24)
/// and the descriptor (36).
pub const HS_FIXED_SIZE: u32 = HS_SIG_OFFSET + 24 + HS_DESCRIPTOR_SIZE;

/// Round `x` up to the next multiple of `base`.
///
/// Uses `x + (base - x % base) % base`, which leaves exact multiples untouched.
#[must_use]
pub fn round_up_to_base(x: u32, base: u32) -> u32 {
    x + (base - x % base) % base
}

/// `nvfw_bin_hdr`: the 24-byte header at the start of bootloader and secure-boot images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinHeader {
    /// Always [`BIN_HDR_MAGIC`].
    pub bin_magic: u32,
    /// Always [`BIN_HDR_VERSION`].
    pub bin_ver: u32,
    /// Container size rounded up to [`TOTAL_SIZE_ALIGN`].
    pub bin_size: u32,
    /// Offset of the header that follows this one; fixed at 24.
    pub header_offset: u32,
    /// Offset of the firmware image.
    pub data_offset: u32,
    /// Length of the firmware image.
    pub data_size: u32,
}

impl BinHeader {
    pub const SIZE: usize = 6 * 4;

    /// Header for a container whose firmware starts at `data_offset`.
    #[must_use]
    pub fn new(bin_size: u32, data_offset: u32, data_size: u32) -> Self {
        Self {
            bin_magic: BIN_HDR_MAGIC,
            bin_ver: BIN_HDR_VERSION,
            bin_size,
            header_offset: Self::SIZE as u32,
            data_offset,
            data_size,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; BinHeader::SIZE] {
        encode_words([
            self.bin_magic,
            self.bin_ver,
            self.bin_size,
            self.header_offset,
            self.data_offset,
            self.data_size,
        ])
    }

    /// Decode the first [`Self::SIZE`] bytes; `None` if `bytes` is shorter.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let [bin_magic, bin_ver, bin_size, header_offset, data_offset, data_size] =
            decode_words::<6>(bytes)?;
        Some(Self {
            bin_magic,
            bin_ver,
            bin_size,
            header_offset,
            data_offset,
            data_size,
        })
    }
}

/// `nvfw_hs_header_v2`: the 36-byte header locating the signature and patch fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsHeaderV2 {
    pub sig_offset: u32,
    pub sig_size: u32,
    pub patch_loc_offset: u32,
    pub patch_sig_offset: u32,
    pub meta_data_offset: u32,
    pub meta_data_size: u32,
    pub num_sig_offset: u32,
    pub header_offset: u32,
    pub header_size: u32,
}

impl HsHeaderV2 {
    pub const SIZE: usize = 9 * 4;

    /// Lay out the fields that follow a signature block of `sig_size` bytes.
    #[must_use]
    pub fn for_signatures(sig_size: u32) -> Self {
        let patch_loc_offset = HS_SIG_OFFSET + sig_size;
        let patch_sig_offset = patch_loc_offset + 4;
        let meta_data_offset = patch_sig_offset + 4;
        let num_sig_offset = meta_data_offset + HS_META_DATA_SIZE;
        Self {
            sig_offset: HS_SIG_OFFSET,
            sig_size,
            patch_loc_offset,
            patch_sig_offset,
            meta_data_offset,
            meta_data_size: HS_META_DATA_SIZE,
            num_sig_offset,
            header_offset: num_sig_offset + 4,
            header_size: HS_DESCRIPTOR_SIZE,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HsHeaderV2::SIZE] {
        encode_words([
            self.sig_offset,
            self.sig_size,
            self.patch_loc_offset,
            self.patch_sig_offset,
            self.meta_data_offset,
            self.meta_data_size,
            self.num_sig_offset,
            self.header_offset,
            self.header_size,
        ])
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let [sig_offset, sig_size, patch_loc_offset, patch_sig_offset, meta_data_offset, meta_data_size, num_sig_offset, header_offset, header_size] =
            decode_words::<9>(bytes)?;
        Some(Self {
            sig_offset,
            sig_size,
            patch_loc_offset,
            patch_sig_offset,
            meta_data_offset,
            meta_data_size,
            num_sig_offset,
            header_offset,
            header_size,
        })
    }
}

/// Patch metadata stored after the patch location: fuse version, engine id, ucode id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchMeta {
    pub fuse_ver: u32,
    pub engine_id: u32,
    pub ucode_id: u32,
}

impl PatchMeta {
    pub const SIZE: usize = HS_META_DATA_SIZE as usize;

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let [fuse_ver, engine_id, ucode_id] = decode_words::<3>(bytes)?;
        Some(Self {
            fuse_ver,
            engine_id,
            ucode_id,
        })
    }
}

impl From<[u8; PatchMeta::SIZE]> for PatchMeta {
    fn from(bytes: [u8; PatchMeta::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            fuse_ver: word(0),
            engine_id: word(4),
            ucode_id: word(8),
        }
    }
}

/// Read a little-endian `u32` at `offset`.
#[must_use]
pub fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let word = bytes.get(offset..end)?;
    Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
}

fn encode_words<const N: usize, const B: usize>(words: [u32; N]) -> [u8; B] {
    let mut out = [0u8; B];
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}

fn decode_words<const N: usize>(bytes: &[u8]) -> Option<[u32; N]> {
    let mut words = [0u32; N];
    for (i, word) in words.iter_mut().enumerate() {
        *word = read_u32(bytes, i * 4)?;
    }
    Some(words)
}
