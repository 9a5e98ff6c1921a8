//! nvfw-extract: build nouveau GSP firmware files from an unpacked driver source tree.
//!
//! `extract` reads `src/nvidia/generated/g_bindata_*.c` under `--source` and writes
//! `<output>/<gpu>/gsp/<kind>-<revision>.bin` for every entry in the target table.
//! `inspect` parses a written container and prints its headers.
//! `targets` prints the built-in target table as TOML.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use nvfw::reader::{self, ContainerKind};
use nvfw::{run, RunConfig, TargetTable};

#[derive(Parser)]
#[command(name = "nvfw-extract", version, about = "Extract GSP firmware for nouveau", long_about = None)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build firmware files from generated driver sources
    Extract {
        /// Root of the unpacked driver source tree
        #[arg(short, long, default_value = ".")]
        source: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Firmware revision used in file names, e.g. 535.113.01
        #[arg(short, long)]
        revision: String,

        /// TOML target table to use instead of the built-in one
        #[arg(long, value_name = "TOML")]
        targets: Option<PathBuf>,

        /// Only build these GPUs (repeatable)
        #[arg(long = "gpu", value_name = "GPU")]
        gpus: Vec<String>,

        /// Write a JSON report of the produced files
        #[arg(long, value_name = "JSON")]
        report: Option<PathBuf>,
    },
    /// Print the headers of a built container
    Inspect {
        file: PathBuf,

        /// Container layout (detected if omitted)
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// Print the built-in target table as TOML
    Targets,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Bootloader,
    SecureBoot,
    Fmc,
}

impl From<KindArg> for ContainerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Bootloader => ContainerKind::Bootloader,
            KindArg::SecureBoot => ContainerKind::SecureBoot,
            KindArg::Fmc => ContainerKind::Fmc,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    dispatch(cli.command)
}

fn dispatch(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Extract {
            source,
            output,
            revision,
            targets,
            gpus,
            report,
        } => {
            let table = match targets {
                Some(path) => {
                    let text = fs::read_to_string(&path).map_err(|e| format!("read {}: {}", path.display(), e))?;
                    TargetTable::from_toml_str(&text)?
                }
                None => TargetTable::builtin(),
            };
            let config = RunConfig {
                source_root: source,
                output_dir: output,
                revision,
            };
            let result = run(&config, &table, &gpus)?;
            info!("{} firmware files written", result.outputs.len());
            if let Some(path) = report {
                let json = serde_json::to_string_pretty(&result)?;
                fs::write(&path, json).map_err(|e| format!("write {}: {}", path.display(), e))?;
            }
            Ok(())
        }
        Command::Inspect { file, kind } => {
            let bytes = reader::read_file(&file)?;
            let kind = match kind {
                Some(k) => k.into(),
                None => reader::detect_kind(&bytes)?,
            };
            println!("{}: {} ({} bytes)", file.display(), kind, bytes.len());
            inspect(kind, &bytes)
        }
        Command::Targets => {
            print!("{}", TargetTable::builtin().to_toml_string()?);
            Ok(())
        }
    }
}

fn inspect(kind: ContainerKind, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    match kind {
        ContainerKind::Bootloader => {
            let image = reader::parse_bin_image(bytes)?;
            println!("  {:?}", image.header);
            println!("  descriptor: {} bytes", image.descriptor.len());
            println!("  firmware:   {} bytes", image.firmware.len());
        }
        ContainerKind::SecureBoot => {
            let image = reader::parse_secure_boot_image(bytes)?;
            println!("  {:?}", image.header);
            println!("  {:?}", image.hs_header);
            println!("  signatures: {} x {} bytes", image.num_sigs, image.signatures.len() / image.num_sigs.max(1) as usize);
            println!("  patch_loc:  {:#x}", image.patch_loc);
            println!("  {:?}", image.patch_meta);
            println!("  descriptor: {} bytes", image.descriptor.len());
            println!("  firmware:   {} bytes", image.firmware.len());
        }
        ContainerKind::Fmc => {
            for section in reader::parse_fmc_image(bytes)? {
                println!(
                    "  {:<10} offset {:#08x} size {:>8} crc32 {:#010x}",
                    section.name,
                    section.header.sh_offset,
                    section.data.len(),
                    section.header.sh_info
                );
            }
        }
    }
    Ok(())
}
