//! Command-line front end: inspect a Xenon system flash, list its files and pull them out.
//!
//! Works on raw dumps (user and spare bytes interleaved, as read from the controller) or, on
//! Linux, directly on an MTD device.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::warn;

use std::fs::{self, File};
use std::io::BufReader;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
use xenonfs_recovery::nand::mtd::MtdFlash;
use xenonfs_recovery::{
    geometry::{GeometryDiscriminant, GeometryProfile, Profile},
    nand::{DumpImage, Flash},
    xenonfs::{container_name, meta::LbaForm, MOBILE_BASE, MOBILE_END},
    DecodingSession, SessionOptions,
};

/// Accept decimal or 0x-prefixed hexadecimal numbers
fn parse_number(s: &str) -> std::result::Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_u16(s: &str) -> std::result::Result<u16, String> {
    let value = parse_number(s).map_err(|e| e.to_string())?;
    u16::try_from(value).map_err(|e| e.to_string())
}

#[derive(Args, Debug)]
#[group(required = true)]
struct FlashOptions {
    /// Path to a raw flash dump
    #[clap(long, group = "flash-options")]
    image: Option<PathBuf>,

    /// Path to a `/dev/mtdX` device (or the block device of an eMMC part)
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_dev: Option<PathBuf>,
}

#[derive(Args, Debug)]
#[group(required = true)]
struct GeometryOptions {
    /// Flash part: sb16m, sb32m, sb64m, bos16m, bb128k, bb256k or emmc
    #[clap(long, group = "geometry-options")]
    geometry: Option<Profile>,

    /// Value of the flash controller's config register
    #[clap(long, group = "geometry-options", value_parser = parse_number)]
    sfc_config: Option<u32>,

    /// The controller reports an eMMC part (with --sfc-config)
    #[clap(long, requires = "sfc_config")]
    emmc: bool,
}

impl GeometryOptions {
    fn resolve(&self) -> Result<GeometryProfile> {
        let discriminant = match (self.geometry, self.sfc_config) {
            (Some(profile), _) => GeometryDiscriminant::Profile(profile),
            (None, Some(config)) => GeometryDiscriminant::Controller {
                config,
                mmc: self.emmc,
            },
            (None, None) => unreachable!(),
        };

        Ok(GeometryProfile::resolve(discriminant)?)
    }
}

impl FlashOptions {
    fn open(&self, geometry: GeometryProfile) -> Result<FlashImpl> {
        let flash = if let Some(path) = &self.image {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            let len = file.metadata()?.len();
            if len != geometry.total_dump_size {
                warn!(
                    "{} is {len:#x} bytes, expected {:#x}",
                    path.display(),
                    geometry.total_dump_size
                );
            }

            let mut dump = DumpImage::new(geometry);
            dump.load(&mut BufReader::new(file))?;
            FlashImpl::Dump(dump)
        } else {
            #[cfg(target_os = "linux")]
            {
                match &self.mtd_dev {
                    Some(dev) => FlashImpl::Mtd(MtdFlash::open(dev, geometry)?),
                    None => unreachable!(),
                }
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(flash)
    }
}

#[derive(Debug)]
enum FlashImpl {
    Dump(DumpImage),

    #[cfg(target_os = "linux")]
    Mtd(MtdFlash),
}

impl Flash for FlashImpl {
    fn geometry(&self) -> &GeometryProfile {
        match self {
            Self::Dump(flash) => flash.geometry(),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.geometry(),
        }
    }

    fn read_block_separate(&mut self, block: u32) -> Result<(Vec<u8>, Vec<u8>)> {
        match self {
            Self::Dump(flash) => flash.read_block_separate(block),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.read_block_separate(block),
        }
    }

    fn read_mapped_region(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        match self {
            Self::Dump(flash) => flash.read_mapped_region(offset, len),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.read_mapped_region(offset, len),
        }
    }
}

/// Accept a Mobile either by name ("MobileB") or by type tag ("0x31")
fn parse_mobile(s: &str) -> std::result::Result<u8, String> {
    if let Some(letter) = s.strip_prefix("Mobile").and_then(|x| x.bytes().next()) {
        let id = letter
            .to_ascii_uppercase()
            .checked_sub(b'A')
            .and_then(|x| MOBILE_BASE.checked_add(x));
        if let Some(id) = id.filter(|x| (MOBILE_BASE..MOBILE_END).contains(x)) {
            return Ok(id);
        }
    } else if let Ok(id) = parse_number(s) {
        if let Ok(id) = u8::try_from(id) {
            return Ok(id);
        }
    }

    Err(format!("{s:?} is not a Mobile name or id"))
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the geometry, the containers found and any problems
    Info,

    /// List the files in FSRoot
    List {
        /// Also show deleted files
        #[clap(long)]
        all: bool,
    },

    /// Extract files
    Extract {
        /// Names of the files to extract; all live files if none are given
        names: Vec<String>,

        /// Directory to write the files into
        #[clap(long, short, default_value = ".")]
        output: PathBuf,
    },

    /// Extract the current copy of a Mobile container
    Mobile {
        /// Mobile name ("MobileB") or type tag ("0x31")
        #[clap(value_parser = parse_mobile)]
        id: u8,

        /// File to write the container to
        output: PathBuf,
    },
}

impl Command {
    fn execute(self, session: &mut DecodingSession<FlashImpl>) -> Result<()> {
        let big_block = session.geometry().is_big_block_addressing;

        match self {
            Command::Info => {
                let geometry = session.geometry();
                println!("Geometry: {:?}", geometry.variant);
                println!(
                    "  {:#x} blocks of {:#x} bytes, {} pages each, config block {:#x}",
                    geometry.total_blocks,
                    geometry.block_size,
                    geometry.pages_per_block,
                    geometry.config_block
                );

                let lba = session.lba_map();
                println!("LBA map: {}/{} slots mapped", lba.mapped_count(), lba.len());

                let containers = session.containers();
                let fsroot = containers.fsroot;
                println!(
                    "FSRoot: block {:#x}, v {}",
                    fsroot.block, fsroot.version
                );
                for mobile in containers.mobiles() {
                    println!(
                        "{}: block {:#x}, page {}, v {}, {:#x} bytes",
                        mobile.name(big_block),
                        mobile.block,
                        mobile.page,
                        mobile.version,
                        mobile.size
                    );
                }
            }

            Command::List { all } => {
                for entry in session.list_files() {
                    if entry.is_deleted() && !all {
                        continue;
                    }

                    let deleted = if entry.is_deleted() { " (deleted)" } else { "" };
                    println!(
                        "{:<22} {:>10} {:#06x} {}{deleted}",
                        entry.name(),
                        entry.size,
                        entry.start_cluster,
                        entry.timestamp
                    );
                }
            }

            Command::Extract { names, output } => {
                let entries = match names.is_empty() {
                    true => session.fsroot().files().cloned().collect::<Vec<_>>(),
                    false => names
                        .iter()
                        .map(|name| {
                            session
                                .fsroot()
                                .find(name)
                                .cloned()
                                .with_context(|| format!("no file named {name:?}"))
                        })
                        .collect::<Result<Vec<_>>>()?,
                };

                fs::create_dir_all(&output)?;
                for entry in entries {
                    // A corrupt chain only loses this one file
                    let file = match session.extract_file(&entry) {
                        Ok(file) => file,
                        Err(e) => {
                            warn!("{}: {e}", entry.name());
                            continue;
                        }
                    };

                    let path = output.join(sanitize(&entry.name()));
                    fs::write(&path, &file.data)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!(
                        "{} -> {} ({:#x} bytes{})",
                        entry.name(),
                        path.display(),
                        file.data.len(),
                        if file.is_complete() { "" } else { ", incomplete" }
                    );
                }
            }

            Command::Mobile { id, output } => {
                let name = container_name(id, big_block);
                let Some(data) = session.read_mobile(id)? else {
                    bail!("{name} is not present on this image");
                };

                fs::write(&output, &data)
                    .with_context(|| format!("writing {}", output.display()))?;
                println!("{name} -> {} ({:#x} bytes)", output.display(), data.len());
            }
        };

        Ok(())
    }
}

/// File names come from the image; keep them from escaping the output directory
fn sanitize(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();

    match Path::new(&name).file_name() {
        Some(_) if name != "." && name != ".." => name,
        _ => format!("_{name}"),
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash to read
    #[clap(flatten)]
    flash: FlashOptions,

    /// What kind of flash it is
    #[clap(flatten)]
    geometry: GeometryOptions,

    /// Use the older BigOnSmall logical address formula
    #[clap(long)]
    legacy_bos_lba: bool,

    /// Do not check page EDC codes
    #[clap(long)]
    no_ecc: bool,

    /// Cluster index at which the filesystem starts
    #[clap(long, default_value = "0", value_parser = parse_u16)]
    fs_start_offset: u16,

    /// The command to run against this flash
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let geometry = args.geometry.resolve()?;
    let flash = args.flash.open(geometry)?;

    let form = match args.legacy_bos_lba {
        true => LbaForm::Legacy,
        false => LbaForm::Canonical,
    };
    let options = SessionOptions::default()
        .lba_form(form)
        .verify_ecc(!args.no_ecc)
        .fs_start_offset(args.fs_start_offset);

    let mut session = DecodingSession::open(flash, options)?;
    args.cmd.execute(&mut session)?;

    let warnings = session.report().warnings().count();
    if warnings > 0 {
        warn!("{warnings} problem(s) found on this image");
    }
    Ok(())
}
