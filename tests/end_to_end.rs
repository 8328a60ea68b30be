//! Whole-image decoding of synthetic dumps

use anyhow::{anyhow, Result};

use xenonfs_recovery::{
    geometry::{GeometryProfile, Profile},
    nand::{DumpImage, Flash},
    xenonfs::{
        ecc,
        fsroot::{FsEntry, FsRoot, FsTimestamp},
        meta::{Anchor, AnchorRecord, PageMetadata, MMC_ANCHOR_BLOCKS},
        ChainFault, Error, Issue,
    },
    DecodingSession, SessionOptions,
};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|x| (x as u8).wrapping_mul(31).wrapping_add(seed) ^ (x >> 9) as u8)
        .collect()
}

fn block_meta(lba: u16, block_type: u8, sequence: u32) -> PageMetadata {
    PageMetadata {
        lba,
        block_type,
        sequence,
        ..Default::default()
    }
}

/// Program a single page the way a container copy is written, with its EDC
fn program_one_page(
    dump: &mut DumpImage,
    block: u32,
    page: u32,
    user: &[u8],
    meta: &PageMetadata,
) -> Result<()> {
    let geometry = *dump.geometry();
    let mut spare = meta.encode(geometry.variant)?;
    let mut page_buf = vec![0xFF; geometry.page_size];
    page_buf[..user.len()].copy_from_slice(user);
    ecc::fill(&page_buf, &mut spare);
    dump.program_page(block, page, &page_buf, &spare)
}

struct SmallBlockImage {
    dump: DumpImage,
    config: Vec<u8>,
    big: Vec<u8>,
    mobile: Vec<u8>,
}

fn small_block_image() -> Result<SmallBlockImage> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut dump = DumpImage::new(geometry);
    let ts = FsTimestamp::from_parts(2011, 6, 15, 12, 0, 0);

    let config = pattern(0x1234, 1);
    let big = pattern(0x6000, 2);
    let mobile = pattern(0x200, 3);

    let mut root = FsRoot::new();
    root.add_entry(FsEntry::new("config.bin", 0x40, config.len() as u32, ts))?;
    root.add_entry(FsEntry::new("big.dat", 0x50, big.len() as u32, ts))?;
    let mut old = FsEntry::new("old.txt", 0x60, 0x10, ts);
    old.delete();
    root.add_entry(old)?;
    root.set_next(0x40, 0x1FFF)?;
    root.set_next(0x50, 0x51)?;
    root.set_next(0x51, 0x1FFF)?;

    // A stale FSRoot copy, then the current one
    dump.program_block(0x21, &FsRoot::new().encode()?, &block_meta(0x21, 0x30, 0))?;
    dump.program_block(0x20, &root.encode()?, &block_meta(0x20, 0x30, 1))?;

    // MobileB: one copy of one page
    let mobile_meta = PageMetadata {
        free_page_count: 31,
        container_size: mobile.len() as u32,
        ..block_meta(0x30, 0x31, 1)
    };
    program_one_page(&mut dump, 0x30, 0, &mobile, &mobile_meta)?;

    // File data, remapped away from the physical blocks of the same number; the bad block
    // claims one of the addresses too but must be ignored
    dump.program_block(0x60, &config, &block_meta(0x40, 0x01, 0))?;
    dump.program_block(0x62, &pattern(0x4000, 9), &block_meta(0x51, 0x01, 0))?;
    dump.program_page(0x62, 0, &[], &[0x00; 16])?;
    dump.program_block(0x61, &big[..0x4000], &block_meta(0x50, 0x01, 0))?;
    dump.program_block(0x70, &big[0x4000..], &block_meta(0x51, 0x01, 0))?;

    Ok(SmallBlockImage {
        dump,
        config,
        big,
        mobile,
    })
}

#[test]
fn test_small_block_end_to_end() -> Result<()> {
    let image = small_block_image()?;
    let mut session = DecodingSession::open(image.dump, SessionOptions::default())?;

    assert_eq!(session.containers().fsroot.block, 0x20);
    assert_eq!(session.containers().fsroot.version, 1);

    let files = session.list_files();
    let names: Vec<_> = files.iter().map(|x| x.name()).collect();
    assert_eq!(names, ["config.bin", "big.dat", "?ld.txt"]);
    assert!(files[2].is_deleted());

    let config = session.extract_file(&files[0])?;
    assert_eq!(config.data.len(), 0x1234);
    assert_eq!(config.data, image.config);
    assert_eq!(config.segments.len(), 1);
    assert_eq!(config.segments[0].block, 0x60);

    let big = session.extract_file(&files[1])?;
    assert_eq!(big.data, image.big);
    let blocks: Vec<_> = big.segments.iter().map(|x| x.block).collect();
    assert_eq!(blocks, [0x61, 0x70]);
    assert!(big.issues.is_empty());

    assert_eq!(session.read_mobile(0x31)?, Some(image.mobile));
    assert_eq!(session.read_mobile(0x32)?, None);

    let report = session.report();
    assert!(report.issues().contains(&Issue::BadBlock { block: 0x62 }));
    assert!(report.issues().contains(&Issue::MissingMobile { id: 0x32 }));
    assert_eq!(report.warnings().count(), 1);
    Ok(())
}

#[test]
fn test_damaged_image() -> Result<()> {
    let mut image = small_block_image()?;

    // Flip a bit in the middle of config.bin without fixing its EDC
    let (user, spare) = image.dump.read_block_separate(0x60)?;
    let mut page = user[0x400..0x600].to_vec();
    page[0x10] ^= 0x01;
    image.dump.program_page(0x60, 2, &page, &spare[0x20..0x30])?;

    // And lose the second block of big.dat
    image.dump.program_block(0x70, &[], &block_meta(0x51, 0x3F, 0))?;

    let mut session = DecodingSession::open(image.dump, SessionOptions::default())?;
    let files = session.list_files();

    let config = session.extract_file(&files[0])?;
    assert_eq!(config.data.len(), image.config.len());
    assert_eq!(config.issues, [Issue::EccMismatch { block: 0x60, page: 2 }]);

    let big = session.extract_file(&files[1])?;
    assert_eq!(big.data, image.big[..0x4000]);
    assert!(!big.is_complete());
    assert_eq!(
        big.issues,
        [Issue::UnmappedCluster {
            file: "big.dat".to_string(),
            cluster: 0x51
        }]
    );

    assert_eq!(session.report().warnings().count(), 3);
    Ok(())
}

#[test]
fn test_corrupt_chain_is_per_file() -> Result<()> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut dump = DumpImage::new(geometry);
    let ts = FsTimestamp::default();

    let mut root = FsRoot::new();
    root.add_entry(FsEntry::new("loop.bin", 0x40, 0x10000, ts))?;
    root.add_entry(FsEntry::new("fine.bin", 0x40, 0x100, ts))?;
    root.set_next(0x40, 0x41)?;
    root.set_next(0x41, 0x40)?;
    dump.program_block(0x10, &root.encode()?, &block_meta(0x10, 0x30, 5))?;
    dump.program_block(0x11, &pattern(0x4000, 4), &block_meta(0x40, 0x01, 0))?;
    dump.program_block(0x12, &pattern(0x4000, 5), &block_meta(0x41, 0x01, 0))?;

    let mut session = DecodingSession::open(dump, SessionOptions::default())?;
    let files = session.list_files();

    assert!(matches!(
        session.extract_file(&files[0]),
        Err(Error::CorruptChain {
            cluster: 0x40,
            fault: ChainFault::Cycle
        })
    ));

    let fine = session.extract_file(&files[1])?;
    assert_eq!(fine.data, pattern(0x4000, 4)[..0x100]);
    Ok(())
}

#[test]
fn test_big_block_sub_block_extraction() -> Result<()> {
    let geometry = Profile::BigBlock128K.geometry();
    let mut dump = DumpImage::new(geometry);
    let payload = pattern(geometry.block_size, 7);

    let mut root = FsRoot::new();
    let ts = FsTimestamp::default();
    root.add_entry(FsEntry::new("sub.bin", 0x182, 0x5000, ts))?;
    root.set_next(0x182, 0x183)?;
    root.set_next(0x183, 0x1FFF)?;

    dump.program_block(1, &root.encode()?, &block_meta(0x01, 0x2C, 3))?;
    dump.program_block(5, &payload, &block_meta(0x10, 0x01, 0))?;

    // Clusters are counted from the start of the filesystem area
    let options = SessionOptions::default().fs_start_offset(0x100);
    let mut session = DecodingSession::open(dump, options)?;
    assert_eq!(session.lba_map().len(), 0x200 * 8);
    assert_eq!(session.containers().fsroot.block, 1);

    let files = session.list_files();
    let file = session.extract_file(&files[0])?;
    assert_eq!(file.data, payload[0x8000..0xD000]);

    let pieces: Vec<_> = file.segments.iter().map(|x| (x.block, x.offset, x.len)).collect();
    assert_eq!(pieces, [(5, 0x8000, 0x4000), (5, 0xC000, 0x1000)]);
    assert!(session.report().is_clean());
    Ok(())
}

fn write_anchor(dump: &mut DumpImage, geometry: &GeometryProfile, anchor: &Anchor) -> Result<()> {
    let mut buf = vec![0; geometry.block_size];
    anchor.encode(&mut buf)?;
    let block = geometry.config_block - MMC_ANCHOR_BLOCKS;
    dump.write_mapped(block * geometry.block_size as u32, &buf)
}

#[test]
fn test_emmc_end_to_end() -> Result<()> {
    let geometry = Profile::Emmc.geometry();
    let mut dump = DumpImage::new(geometry);

    let mut anchor = Anchor {
        version: 12,
        ..Default::default()
    };
    anchor.mobiles[0] = AnchorRecord {
        block: 0x10,
        size_blocks: 1,
    };
    anchor.mobiles[2] = AnchorRecord {
        block: 0x20,
        size_blocks: 1,
    };
    write_anchor(&mut dump, &geometry, &anchor)?;

    let payload = pattern(0x4800, 8);
    let mobile = pattern(0x4000, 9);
    let mut root = FsRoot::new();
    let ts = FsTimestamp::default();
    root.add_entry(FsEntry::new("emmc.bin", 0x30, payload.len() as u32, ts))?;
    root.set_next(0x30, 0x31)?;
    root.set_next(0x31, 0x1FFF)?;

    dump.write_mapped(0x10 * 0x4000, &root.encode()?)?;
    dump.write_mapped(0x20 * 0x4000, &mobile)?;
    dump.write_mapped(0x30 * 0x4000, &payload)?;

    let mut session = DecodingSession::open(dump, SessionOptions::default())?;
    assert_eq!(session.containers().fsroot.version, 12);

    let entry = session
        .fsroot()
        .find("emmc.bin")
        .cloned()
        .ok_or(anyhow!("emmc.bin missing"))?;
    let file = session.extract_file(&entry)?;
    assert_eq!(file.data, payload);
    assert_eq!(file.segments.len(), 2);

    assert_eq!(session.read_mobile(0x32)?, Some(mobile));
    assert_eq!(session.read_mobile(0x31)?, None);
    assert!(session.report().is_clean());
    Ok(())
}
