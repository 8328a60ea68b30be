//! Decoding of the Xenon system-area filesystem.
//!
//! Every 512-byte page on raw NAND is followed by 16 bytes of spare data, which the filesystem
//! uses as its only metadata:
//!
//! ```text
//! +---------- page 0 ----------+---- spare ----+---------- page 1 ----------+---- spare ----+
//! |        512 user bytes      | lba, type,    |        512 user bytes      |      ...      |
//! |                            | sequence, EDC |                            |               |
//! +----------------------------+---------------+----------------------------+---------------+
//! ```
//!
//! The spare bytes name the logical block address of the block, a 6-bit block type, a sequence
//! number and a 26-bit error-detecting code. Three controller generations arrange these fields
//! differently (see [`meta`]).
//!
//! Containers are written log-style: every update goes to a fresh block with a higher sequence
//! number, so the current copy of a container is the one with the highest sequence anywhere on
//! the surface. The root container, FSRoot, holds two tables interleaved in 512-byte runs: a
//! 16-bit cluster chain table and 256 directory entries. A file is read by following its chain
//! from the start cluster, translating each cluster through the LBA map to a physical block.
//!
//! eMMC parts carry no spare data. Instead, one of two anchor blocks just below the config area
//! points directly at every container.

mod error;

pub mod ecc;
pub mod extract;
pub mod fsroot;
pub mod lba;
pub mod meta;
pub mod scan;

pub use error::{ChainFault, Error, Issue, Report, Result};

/// Number of Mobile container slots
pub const MAX_MOBILE: usize = 0xF;

/// Block type of the first Mobile container
pub const MOBILE_BASE: u8 = 0x30;

/// One past the last Mobile block type
pub const MOBILE_END: u8 = MOBILE_BASE + MAX_MOBILE as u8;

/// Block type of FSRoot on small-block addressing
pub const MOBILE_FSROOT: u8 = 0x30;

/// Block type of FSRoot on big-block addressing
pub const BB_MOBILE_FSROOT: u8 = 0x2C;

/// Block type of an erased page, which also terminates a scan within a block
pub const BLOCK_TYPE_ERASED: u8 = 0x3F;

/// Size of each of the two tables held in an FSRoot block
pub const FSROOT_SIZE: usize = 0x2000;

/// Human-readable name of a container type, e.g. "MobileB" for 0x31
pub fn container_name(id: u8, big_block: bool) -> String {
    let fsroot = if big_block {
        BB_MOBILE_FSROOT
    } else {
        MOBILE_FSROOT
    };

    if id == fsroot {
        "FSRoot".to_string()
    } else if (MOBILE_BASE..MOBILE_END).contains(&id) {
        format!("Mobile{}", char::from(b'A' + (id - MOBILE_BASE)))
    } else {
        format!("Container{id:02X}")
    }
}

#[test]
fn test_container_name() {
    assert_eq!(container_name(0x30, false), "FSRoot");
    assert_eq!(container_name(0x31, false), "MobileB");
    assert_eq!(container_name(0x3E, false), "MobileO");
    assert_eq!(container_name(0x30, true), "MobileA");
    assert_eq!(container_name(0x2C, true), "FSRoot");
}
