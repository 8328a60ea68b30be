//! Geometry profiles for the NAND and eMMC parts behind the Xenon flash controller.
//!
//! Every size and offset used while decoding comes from a [`GeometryProfile`], so resolving one
//! never falls back to a default: an unknown controller configuration is an error.

use std::fmt;
use std::str::FromStr;

use crate::xenonfs::{Error, Result, BB_MOBILE_FSROOT, MOBILE_FSROOT};

/// Bytes of user data per page
pub const PAGE_SIZE: usize = 0x200;

/// Bytes of spare data per page on raw NAND
pub const META_SIZE: usize = 0x10;

/// Blocks at the end of the filesystem area reserved for configuration data
pub const CONFIG_BLOCKS: u32 = 4;

/// Number of small-block-sized sub-blocks in one big block, for LBA purposes
pub const BIG_BLOCK_SUBDIVISIONS: u32 = 8;

/// The system area is the first 64 MiB of big-block parts; the memory unit follows it.
const BIG_BLOCK_SYSTEM_AREA: u64 = 0x400_0000;

/// Which spare-metadata layout (if any) a part uses
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum Variant {
    /// Original small-block controller
    SmallBlock,

    /// Big-block-capable controller driving a 16 MiB small-block part
    BigOnSmall,

    /// Big-block part (256 MiB and up)
    BigBlock,

    /// eMMC behind the controller; no spare data, remapping done by the device
    EmmcMapped,
}

/// All the constants describing one flash part
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct GeometryProfile {
    pub variant: Variant,
    pub page_size: usize,
    pub page_size_phys: usize,
    pub meta_size: usize,
    pub pages_per_block: u32,
    pub block_size: usize,
    pub block_size_phys: usize,
    pub total_dump_size: u64,
    pub usable_fs_blocks: u32,
    pub config_block: u32,
    pub total_blocks: u32,
    pub total_pages: u32,
    pub is_big_block_addressing: bool,
    pub has_bad_block_remap: bool,
}

impl GeometryProfile {
    fn new(variant: Variant, block_size: usize, blocks: u32, usable_fs_blocks: u32) -> Self {
        let meta_size = match variant {
            Variant::EmmcMapped => 0,
            _ => META_SIZE,
        };
        let page_size_phys = PAGE_SIZE + meta_size;
        let pages_per_block = (block_size / PAGE_SIZE) as u32;
        let block_size_phys = pages_per_block as usize * page_size_phys;
        let total_dump_size = u64::from(blocks) * block_size_phys as u64;

        Self {
            variant,
            page_size: PAGE_SIZE,
            page_size_phys,
            meta_size,
            pages_per_block,
            block_size,
            block_size_phys,
            total_dump_size,
            usable_fs_blocks,
            config_block: usable_fs_blocks - CONFIG_BLOCKS,
            total_blocks: (total_dump_size / block_size_phys as u64) as u32,
            total_pages: blocks * pages_per_block,
            is_big_block_addressing: variant == Variant::BigBlock,
            has_bad_block_remap: variant != Variant::EmmcMapped,
        }
    }

    /// Resolve a discriminant into a full profile
    pub fn resolve(discriminant: GeometryDiscriminant) -> Result<Self> {
        match discriminant {
            GeometryDiscriminant::Profile(profile) => Ok(profile.geometry()),
            GeometryDiscriminant::Controller { config, mmc } => {
                Profile::from_controller(config, mmc).map(Profile::geometry)
            }
        }
    }

    /// Bytes of spare data that accompany one block
    pub fn spare_size(&self) -> usize {
        self.meta_size * self.pages_per_block as usize
    }

    /// How many LBA map slots each physical block occupies
    pub fn lba_slots_per_block(&self) -> u32 {
        if self.is_big_block_addressing {
            BIG_BLOCK_SUBDIVISIONS
        } else {
            1
        }
    }

    /// Expected length of the LBA map
    pub fn lba_map_len(&self) -> usize {
        self.total_blocks as usize * self.lba_slots_per_block() as usize
    }

    /// Bytes addressed by one filesystem cluster
    pub fn cluster_size(&self) -> usize {
        self.block_size / self.lba_slots_per_block() as usize
    }

    /// Block type tag that marks an FSRoot block
    pub fn fsroot_tag(&self) -> u8 {
        if self.is_big_block_addressing {
            BB_MOBILE_FSROOT
        } else {
            MOBILE_FSROOT
        }
    }

    pub fn is_emmc(&self) -> bool {
        self.variant == Variant::EmmcMapped
    }
}

/// How the caller identifies the flash part
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum GeometryDiscriminant {
    /// The controller's config register, plus whether its eMMC ident register is non-zero
    Controller { config: u32, mmc: bool },

    /// An explicitly selected profile, for offline work on dumps
    Profile(Profile),
}

/// The known flash parts
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum Profile {
    SmallBlock16M,
    SmallBlock32M,
    SmallBlock64M,
    BigOnSmall16M,
    BigBlock128K,
    BigBlock256K,
    Emmc,
}

impl Profile {
    pub const ALL: [Profile; 7] = [
        Profile::SmallBlock16M,
        Profile::SmallBlock32M,
        Profile::SmallBlock64M,
        Profile::BigOnSmall16M,
        Profile::BigBlock128K,
        Profile::BigBlock256K,
        Profile::Emmc,
    ];

    /// Short name, as accepted by [`FromStr`]
    pub fn name(self) -> &'static str {
        match self {
            Self::SmallBlock16M => "sb16m",
            Self::SmallBlock32M => "sb32m",
            Self::SmallBlock64M => "sb64m",
            Self::BigOnSmall16M => "bos16m",
            Self::BigBlock128K => "bb128k",
            Self::BigBlock256K => "bb256k",
            Self::Emmc => "emmc",
        }
    }

    pub fn geometry(self) -> GeometryProfile {
        use Variant::*;

        let big_block = |block_size: usize, usable| {
            let blocks = (BIG_BLOCK_SYSTEM_AREA / block_size as u64) as u32;
            GeometryProfile::new(BigBlock, block_size, blocks, usable)
        };

        match self {
            Self::SmallBlock16M => GeometryProfile::new(SmallBlock, 0x4000, 0x400, 0x3E0),
            Self::SmallBlock32M => GeometryProfile::new(SmallBlock, 0x4000, 0x800, 0x7C0),
            Self::SmallBlock64M => GeometryProfile::new(SmallBlock, 0x4000, 0x1000, 0xF80),
            Self::BigOnSmall16M => GeometryProfile::new(BigOnSmall, 0x4000, 0x400, 0x3E0),
            Self::BigBlock128K => big_block(0x20000, 0x1E0),
            Self::BigBlock256K => big_block(0x40000, 0xF0),
            Self::Emmc => GeometryProfile::new(EmmcMapped, 0x4000, 0xC00, 0xC00),
        }
    }

    /// Decode the controller's config register.
    ///
    /// Bits 17-18 give the controller generation (0: small block only, 1: big-block capable,
    /// 2: eMMC capable), and bits 4-5 the size class of the attached part. On the first
    /// generation size class 0 (8 MiB) was never shipped; the eMMC-capable controller uses it for
    /// its 16 MiB NAND.
    pub fn from_controller(config: u32, mmc: bool) -> Result<Self> {
        if mmc {
            return Ok(Self::Emmc);
        }

        let generation = (config >> 17) & 0x3;
        let size_class = (config >> 4) & 0x3;
        match (generation, size_class) {
            (0, 1) => Ok(Self::SmallBlock16M),
            (0, 2) => Ok(Self::SmallBlock32M),
            (0, 3) => Ok(Self::SmallBlock64M),
            (1, 1) => Ok(Self::BigOnSmall16M),
            (1, 2) => Ok(Self::BigBlock128K),
            (1, 3) => Ok(Self::BigBlock256K),
            (2, 0) => Ok(Self::BigOnSmall16M),
            (2, 1) => Ok(Self::BigBlock128K),
            (2, 2 | 3) => Ok(Self::BigBlock256K),
            _ => Err(Error::UnsupportedGeometry(format!(
                "controller config {config:#010x} (generation {generation}, size class {size_class})"
            ))),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|x| x.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnsupportedGeometry(format!("unknown profile {s:?}")))
    }
}

#[test]
fn test_profile_invariants() {
    for profile in Profile::ALL {
        let geo = profile.geometry();
        assert_eq!(geo.config_block, geo.usable_fs_blocks - CONFIG_BLOCKS);
        assert_eq!(
            geo.total_blocks as u64,
            geo.total_dump_size / geo.block_size_phys as u64
        );
        assert_eq!(geo.total_pages, geo.total_blocks * geo.pages_per_block);

        if geo.is_emmc() {
            assert_eq!(geo.meta_size, 0);
            assert_eq!(geo.block_size_phys, geo.block_size);
        } else {
            assert_eq!(
                geo.block_size_phys,
                geo.pages_per_block as usize * (geo.page_size + geo.meta_size)
            );
        }
    }
}

#[test]
fn test_known_sizes() {
    let sb = Profile::SmallBlock16M.geometry();
    assert_eq!(sb.block_size_phys, 0x4200);
    assert_eq!(sb.total_dump_size, 0x108_0000);
    assert_eq!(sb.lba_map_len(), 0x400);

    let bb = Profile::BigBlock128K.geometry();
    assert_eq!(bb.pages_per_block, 256);
    assert_eq!(bb.total_blocks, 0x200);
    assert_eq!(bb.total_dump_size, 0x420_0000);
    assert_eq!(bb.lba_map_len(), 0x200 * 8);
    assert_eq!(bb.cluster_size(), 0x4000);
    assert_eq!(bb.fsroot_tag(), 0x2C);

    let emmc = Profile::Emmc.geometry();
    assert_eq!(emmc.total_dump_size, 0x300_0000);
    assert_eq!(emmc.fsroot_tag(), 0x30);
}

#[test]
fn test_resolve_controller() {
    let resolve = |config, mmc| {
        GeometryProfile::resolve(GeometryDiscriminant::Controller { config, mmc })
    };

    assert_eq!(resolve(0x0000_0020, false).unwrap().variant, Variant::SmallBlock);
    assert_eq!(resolve(0x0002_0010, false).unwrap().variant, Variant::BigOnSmall);
    assert_eq!(resolve(0x0002_0020, false).unwrap().variant, Variant::BigBlock);
    assert_eq!(resolve(0, true).unwrap().variant, Variant::EmmcMapped);

    // 8 MiB size class and unknown controller generations are rejected, not defaulted
    assert!(matches!(
        resolve(0x0000_0000, false),
        Err(Error::UnsupportedGeometry(_))
    ));
    assert!(matches!(
        resolve(0x0006_0010, false),
        Err(Error::UnsupportedGeometry(_))
    ));
}

#[test]
fn test_resolve_emmc_capable_controller() {
    let profile = |config| Profile::from_controller(config, false).unwrap();

    // Corona with 16 MiB NAND
    assert_eq!(profile(0x0004_3000), Profile::BigOnSmall16M);
    assert_eq!(
        GeometryProfile::resolve(GeometryDiscriminant::Controller {
            config: 0x0004_3000,
            mmc: false
        })
        .unwrap(),
        Profile::BigOnSmall16M.geometry()
    );

    assert_eq!(profile(0x0004_0010), Profile::BigBlock128K);
    assert_eq!(profile(0x0004_0020), Profile::BigBlock256K);
    assert_eq!(profile(0x0004_0030), Profile::BigBlock256K);
    assert_eq!(Profile::from_controller(0x0004_3000, true).unwrap(), Profile::Emmc);
}

#[test]
fn test_profile_from_str() {
    assert_eq!("BB128K".parse::<Profile>().unwrap(), Profile::BigBlock128K);
    assert!("sb8m".parse::<Profile>().is_err());
}
