//! Per-GPU firmware table and the naming conventions of the generated bindata sources.
//!
//! Every (gpu, firmware) entry resolves to an [`ArrayNames`] descriptor before
//! anything is read, so a bad table fails at startup instead of halfway
//! through a run.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory holding the generated sources, relative to the driver source root.
pub const GENERATED_DIR: &str = "src/nvidia/generated";

/// Signature sizes (bytes per signature) the secure-boot images use.
pub const SIG_SIZES: [u32; 2] = [16, 384];

/// Errors produced while loading or validating a target table.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid gpu id {0:?}: expected lowercase letters and digits")]
    InvalidGpuId(String),
    #[error("gpu {0} listed more than once")]
    DuplicateGpu(String),
    #[error("gpu {gpu}: {stem} listed more than once")]
    DuplicateOutput { gpu: String, stem: &'static str },
    #[error("gpu {gpu}: {stem}: unsupported signature size {sig_size} (expected 16 or 384)")]
    InvalidSigSize {
        gpu: String,
        stem: &'static str,
        sig_size: u32,
    },
    #[error("gpu {gpu}: {stem} has no {fuse} variant")]
    InvalidFuse {
        gpu: String,
        stem: &'static str,
        fuse: Fuse,
    },
    #[cfg(feature = "serde")]
    #[error("target table: {0}")]
    Parse(#[from] toml::de::Error),
    #[cfg(feature = "serde")]
    #[error("target table: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Fuse/signing variant baked into the array names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Fuse {
    /// Legacy sources without a variant in the name (bootloader only).
    Unfused,
    Prod,
    Debug,
}

impl fmt::Display for Fuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Fuse::Unfused => "unfused",
            Fuse::Prod => "prod",
            Fuse::Debug => "debug",
        })
    }
}

impl Fuse {
    /// Infix between `ucode_image`/`ucode_desc` and `data` in bootloader arrays.
    fn bootloader_infix(self) -> &'static str {
        match self {
            Fuse::Unfused => "_",
            Fuse::Prod => "_prod_",
            Fuse::Debug => "_dbg_",
        }
    }

    /// Suffix tag in booter/scrubber arrays.
    fn hs_tag(self) -> Option<&'static str> {
        match self {
            Fuse::Unfused => None,
            Fuse::Prod => Some("prod"),
            Fuse::Debug => Some("dbg"),
        }
    }

    /// Word in the FMC archive function name.
    fn fmc_tag(self) -> Option<&'static str> {
        match self {
            Fuse::Unfused => None,
            Fuse::Prod => Some("Prod"),
            Fuse::Debug => Some("Debug"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BooterDirection {
    Load,
    Unload,
}

impl BooterDirection {
    fn word(self) -> &'static str {
        match self {
            BooterDirection::Load => "Load",
            BooterDirection::Unload => "Unload",
        }
    }
}

/// One firmware file to produce for a GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "kebab-case"))]
pub enum FirmwareSpec {
    Bootloader {
        fuse: Fuse,
    },
    Booter {
        direction: BooterDirection,
        fuse: Fuse,
        sig_size: u32,
    },
    Scrubber {
        fuse: Fuse,
        sig_size: u32,
    },
    Fmc {
        fuse: Fuse,
    },
}

impl FirmwareSpec {
    /// Output file stem; the file is `<stem>-<revision>.bin`.
    #[must_use]
    pub fn stem(&self) -> &'static str {
        match self {
            FirmwareSpec::Bootloader { .. } => "bootloader",
            FirmwareSpec::Booter {
                direction: BooterDirection::Load,
                ..
            } => "booter_load",
            FirmwareSpec::Booter {
                direction: BooterDirection::Unload,
                ..
            } => "booter_unload",
            FirmwareSpec::Scrubber { .. } => "scrubber",
            FirmwareSpec::Fmc { .. } => "fmc",
        }
    }

    #[must_use]
    pub fn fuse(&self) -> Fuse {
        match *self {
            FirmwareSpec::Bootloader { fuse }
            | FirmwareSpec::Booter { fuse, .. }
            | FirmwareSpec::Scrubber { fuse, .. }
            | FirmwareSpec::Fmc { fuse } => fuse,
        }
    }
}

/// Array names a builder needs, resolved from the naming conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayNames {
    Bootloader {
        image: String,
        descriptor: String,
    },
    SecureBoot {
        image: String,
        signatures: String,
        patch_loc: String,
        patch_meta: String,
        descriptor: String,
        sig_size: u32,
    },
    /// (ELF section name, array name) in section order.
    Fmc { sections: Vec<(&'static str, String)> },
}

/// Where one firmware's arrays live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceNaming {
    /// Generated source file, relative to the driver source root.
    pub file: PathBuf,
    pub arrays: ArrayNames,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Target {
    /// Lowercase GPU id, e.g. `ad102`.
    pub gpu: String,
    pub firmware: Vec<FirmwareSpec>,
}

impl Target {
    fn new(gpu: &str, firmware: Vec<FirmwareSpec>) -> Self {
        Self {
            gpu: gpu.to_string(),
            firmware,
        }
    }
}

/// Ordered list of GPUs and the firmware files produced for each.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TargetTable {
    #[cfg_attr(feature = "serde", serde(rename = "target"))]
    pub targets: Vec<Target>,
}

impl TargetTable {
    /// The GPUs and firmware nouveau loads.
    #[must_use]
    pub fn builtin() -> Self {
        use BooterDirection::{Load, Unload};
        use FirmwareSpec::{Booter, Bootloader, Fmc, Scrubber};

        let booters = |fuse, sig_size| {
            [
                Booter {
                    direction: Load,
                    fuse,
                    sig_size,
                },
                Booter {
                    direction: Unload,
                    fuse,
                    sig_size,
                },
            ]
        };
        let legacy = |sig_size| {
            let mut fw = vec![Bootloader {
                fuse: Fuse::Unfused,
            }];
            fw.extend(booters(Fuse::Prod, sig_size));
            fw
        };

        let mut ad102 = vec![Bootloader { fuse: Fuse::Prod }];
        ad102.extend(booters(Fuse::Prod, 384));
        ad102.push(Scrubber {
            fuse: Fuse::Prod,
            sig_size: 384,
        });

        let hopper = || {
            vec![
                Bootloader { fuse: Fuse::Prod },
                Fmc { fuse: Fuse::Prod },
            ]
        };

        Self {
            targets: vec![
                Target::new("tu102", legacy(16)),
                Target::new("tu116", legacy(16)),
                Target::new("ga100", legacy(384)),
                Target::new("ga102", legacy(384)),
                Target::new("ad102", ad102),
                Target::new("gh100", hopper()),
                Target::new("gb100", hopper()),
            ],
        }
    }

    /// Parse a table from TOML (`[[target]]` entries with `[[target.firmware]]` lists).
    #[cfg(feature = "serde")]
    pub fn from_toml_str(text: &str) -> Result<Self, TargetError> {
        let table: TargetTable = toml::from_str(text)?;
        table.validate()?;
        Ok(table)
    }

    #[cfg(feature = "serde")]
    pub fn to_toml_string(&self) -> Result<String, TargetError> {
        Ok(toml::to_string(self)?)
    }

    /// Check gpu ids, duplicates, signature sizes and fuse variants, and that
    /// every entry resolves to source names.
    pub fn validate(&self) -> Result<(), TargetError> {
        let mut gpus = HashSet::new();
        for target in &self.targets {
            let gpu = &target.gpu;
            let valid_id = gpu.len() >= 2
                && gpu
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if !valid_id {
                return Err(TargetError::InvalidGpuId(gpu.clone()));
            }
            if !gpus.insert(gpu.as_str()) {
                return Err(TargetError::DuplicateGpu(gpu.clone()));
            }
            let mut stems = HashSet::new();
            for spec in &target.firmware {
                if !stems.insert(spec.stem()) {
                    return Err(TargetError::DuplicateOutput {
                        gpu: gpu.clone(),
                        stem: spec.stem(),
                    });
                }
                resolve(gpu, spec)?;
            }
        }
        Ok(())
    }

    /// Targets restricted to `gpus` (all targets if `gpus` is empty), in table order.
    pub fn select<'a>(&'a self, gpus: &'a [String]) -> impl Iterator<Item = &'a Target> + 'a {
        self.targets
            .iter()
            .filter(move |t| gpus.is_empty() || gpus.iter().any(|g| g == &t.gpu))
    }
}

/// GPU id with its last character replaced by `X` (`AD102` -> `AD10X`), as the
/// scrubber sources are shared across a family.
#[must_use]
pub fn family_id(gpu_upper: &str) -> String {
    let mut chars = gpu_upper.chars();
    chars.next_back();
    let mut id: String = chars.collect();
    id.push('X');
    id
}

/// Map one firmware entry of `gpu` to its generated source file and array names.
pub fn resolve(gpu: &str, spec: &FirmwareSpec) -> Result<SourceNaming, TargetError> {
    let upper = gpu.to_ascii_uppercase();
    let invalid_fuse = || TargetError::InvalidFuse {
        gpu: gpu.to_string(),
        stem: spec.stem(),
        fuse: spec.fuse(),
    };
    let check_sig_size = |sig_size: u32| {
        if SIG_SIZES.contains(&sig_size) {
            Ok(())
        } else {
            Err(TargetError::InvalidSigSize {
                gpu: gpu.to_string(),
                stem: spec.stem(),
                sig_size,
            })
        }
    };

    let naming = match *spec {
        FirmwareSpec::Bootloader { fuse } => {
            let base = format!("kgspBinArchiveGspRmBoot_{upper}");
            let infix = fuse.bootloader_infix();
            SourceNaming {
                file: generated(&format!("kgspGetBinArchiveGspRmBoot_{upper}")),
                arrays: ArrayNames::Bootloader {
                    image: format!("{base}_ucode_image{infix}data"),
                    descriptor: format!("{base}_ucode_desc{infix}data"),
                },
            }
        }
        FirmwareSpec::Booter {
            direction,
            fuse,
            sig_size,
        } => {
            check_sig_size(sig_size)?;
            let tag = fuse.hs_tag().ok_or_else(invalid_fuse)?;
            let word = direction.word();
            SourceNaming {
                file: generated(&format!("kgspGetBinArchiveBooter{word}Ucode_{upper}")),
                arrays: secure_boot_names(
                    &format!("kgspBinArchiveBooter{word}Ucode_{upper}"),
                    tag,
                    sig_size,
                ),
            }
        }
        FirmwareSpec::Scrubber { fuse, sig_size } => {
            check_sig_size(sig_size)?;
            let tag = fuse.hs_tag().ok_or_else(invalid_fuse)?;
            let family = family_id(&upper);
            SourceNaming {
                file: generated(&format!("ksec2GetBinArchiveSecurescrubUcode_{family}")),
                arrays: secure_boot_names(
                    &format!("ksec2BinArchiveSecurescrubUcode_{family}"),
                    tag,
                    sig_size,
                ),
            }
        }
        FirmwareSpec::Fmc { fuse } => {
            let tag = fuse.fmc_tag().ok_or_else(invalid_fuse)?;
            let base = format!("kgspBinArchiveGspRmFmcGfw{tag}Signed_{upper}");
            let section = |name: &'static str, array: &str| (name, format!("{base}_ucode_{array}_data"));
            SourceNaming {
                file: generated(&format!("kgspGetBinArchiveGspRmFmcGfw{tag}Signed_{upper}")),
                arrays: ArrayNames::Fmc {
                    sections: vec![
                        section("hash", "hash"),
                        section("signature", "sig"),
                        section("publickey", "pkey"),
                        section("image", "image"),
                    ],
                },
            }
        }
    };
    Ok(naming)
}

fn secure_boot_names(base: &str, tag: &str, sig_size: u32) -> ArrayNames {
    ArrayNames::SecureBoot {
        image: format!("{base}_image_{tag}_data"),
        signatures: format!("{base}_sig_{tag}_data"),
        patch_loc: format!("{base}_patch_loc_data"),
        patch_meta: format!("{base}_patch_meta_data"),
        descriptor: format!("{base}_header_{tag}_data"),
        sig_size,
    }
}

fn generated(function: &str) -> PathBuf {
    PathBuf::from(GENERATED_DIR).join(format!("g_bindata_{function}.c"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_valid() {
        TargetTable::builtin().validate().unwrap();
    }

    #[test]
    fn scrubber_uses_family_id() {
        let naming = resolve(
            "ad102",
            &FirmwareSpec::Scrubber {
                fuse: Fuse::Prod,
                sig_size: 384,
            },
        )
        .unwrap();
        assert_eq!(
            naming.file,
            PathBuf::from("src/nvidia/generated/g_bindata_ksec2GetBinArchiveSecurescrubUcode_AD10X.c")
        );
        match naming.arrays {
            ArrayNames::SecureBoot {
                image, patch_meta, ..
            } => {
                assert_eq!(image, "ksec2BinArchiveSecurescrubUcode_AD10X_image_prod_data");
                assert_eq!(patch_meta, "ksec2BinArchiveSecurescrubUcode_AD10X_patch_meta_data");
            }
            other => panic!("unexpected names: {other:?}"),
        }
    }

    #[test]
    fn bootloader_infix_follows_fuse() {
        let naming = resolve("tu102", &FirmwareSpec::Bootloader { fuse: Fuse::Unfused }).unwrap();
        assert_eq!(
            naming.arrays,
            ArrayNames::Bootloader {
                image: "kgspBinArchiveGspRmBoot_TU102_ucode_image_data".to_string(),
                descriptor: "kgspBinArchiveGspRmBoot_TU102_ucode_desc_data".to_string(),
            }
        );
    }

    #[test]
    fn booter_names() {
        let naming = resolve(
            "ga102",
            &FirmwareSpec::Booter {
                direction: BooterDirection::Load,
                fuse: Fuse::Prod,
                sig_size: 384,
            },
        )
        .unwrap();
        assert_eq!(
            naming.file,
            PathBuf::from("src/nvidia/generated/g_bindata_kgspGetBinArchiveBooterLoadUcode_GA102.c")
        );
        assert_eq!(
            naming.arrays,
            ArrayNames::SecureBoot {
                image: "kgspBinArchiveBooterLoadUcode_GA102_image_prod_data".to_string(),
                signatures: "kgspBinArchiveBooterLoadUcode_GA102_sig_prod_data".to_string(),
                patch_loc: "kgspBinArchiveBooterLoadUcode_GA102_patch_loc_data".to_string(),
                patch_meta: "kgspBinArchiveBooterLoadUcode_GA102_patch_meta_data".to_string(),
                descriptor: "kgspBinArchiveBooterLoadUcode_GA102_header_prod_data".to_string(),
                sig_size: 384,
            }
        );

        let naming = resolve(
            "tu116",
            &FirmwareSpec::Booter {
                direction: BooterDirection::Unload,
                fuse: Fuse::Debug,
                sig_size: 16,
            },
        )
        .unwrap();
        assert_eq!(
            naming.file,
            PathBuf::from("src/nvidia/generated/g_bindata_kgspGetBinArchiveBooterUnloadUcode_TU116.c")
        );
        assert_eq!(
            naming.arrays,
            ArrayNames::SecureBoot {
                image: "kgspBinArchiveBooterUnloadUcode_TU116_image_dbg_data".to_string(),
                signatures: "kgspBinArchiveBooterUnloadUcode_TU116_sig_dbg_data".to_string(),
                patch_loc: "kgspBinArchiveBooterUnloadUcode_TU116_patch_loc_data".to_string(),
                patch_meta: "kgspBinArchiveBooterUnloadUcode_TU116_patch_meta_data".to_string(),
                descriptor: "kgspBinArchiveBooterUnloadUcode_TU116_header_dbg_data".to_string(),
                sig_size: 16,
            }
        );
    }

    #[test]
    fn booter_without_fuse_variant_is_rejected() {
        let err = resolve(
            "ga102",
            &FirmwareSpec::Booter {
                direction: BooterDirection::Unload,
                fuse: Fuse::Unfused,
                sig_size: 384,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TargetError::InvalidFuse {
                stem: "booter_unload",
                fuse: Fuse::Unfused,
                ..
            }
        ));
    }

    #[test]
    fn fmc_names() {
        let naming = resolve("gh100", &FirmwareSpec::Fmc { fuse: Fuse::Prod }).unwrap();
        assert_eq!(
            naming.file,
            PathBuf::from("src/nvidia/generated/g_bindata_kgspGetBinArchiveGspRmFmcGfwProdSigned_GH100.c")
        );
        let base = "kgspBinArchiveGspRmFmcGfwProdSigned_GH100";
        assert_eq!(
            naming.arrays,
            ArrayNames::Fmc {
                sections: vec![
                    ("hash", format!("{base}_ucode_hash_data")),
                    ("signature", format!("{base}_ucode_sig_data")),
                    ("publickey", format!("{base}_ucode_pkey_data")),
                    ("image", format!("{base}_ucode_image_data")),
                ],
            }
        );

        let debug = resolve("gb100", &FirmwareSpec::Fmc { fuse: Fuse::Debug }).unwrap();
        assert_eq!(
            debug.file,
            PathBuf::from("src/nvidia/generated/g_bindata_kgspGetBinArchiveGspRmFmcGfwDebugSigned_GB100.c")
        );
    }

    #[test]
    fn rejects_bad_entries() {
        let bad_sig = TargetTable {
            targets: vec![Target::new(
                "ga102",
                vec![FirmwareSpec::Scrubber {
                    fuse: Fuse::Prod,
                    sig_size: 17,
                }],
            )],
        };
        assert!(matches!(
            bad_sig.validate(),
            Err(TargetError::InvalidSigSize { sig_size: 17, .. })
        ));

        let bad_fuse = TargetTable {
            targets: vec![Target::new("gh100", vec![FirmwareSpec::Fmc { fuse: Fuse::Unfused }])],
        };
        assert!(matches!(bad_fuse.validate(), Err(TargetError::InvalidFuse { .. })));

        let dup = TargetTable {
            targets: vec![Target::new("gh100", vec![]), Target::new("gh100", vec![])],
        };
        assert!(matches!(dup.validate(), Err(TargetError::DuplicateGpu(_))));

        let bad_id = TargetTable {
            targets: vec![Target::new("GH100", vec![])],
        };
        assert!(matches!(bad_id.validate(), Err(TargetError::InvalidGpuId(_))));

        let load = FirmwareSpec::Booter {
            direction: BooterDirection::Load,
            fuse: Fuse::Prod,
            sig_size: 384,
        };
        let dup_output = TargetTable {
            targets: vec![Target::new("ga102", vec![load, load])],
        };
        match dup_output.validate() {
            Err(TargetError::DuplicateOutput { gpu, stem }) => {
                assert_eq!(gpu, "ga102");
                assert_eq!(stem, "booter_load");
            }
            other => panic!("expected DuplicateOutput, got {other:?}"),
        }
    }
}
