//! Locating the current copy of FSRoot and of every Mobile container.
//!
//! On raw NAND every rewrite of a container lands in a fresh block with a higher sequence number,
//! leaving the stale copies behind, so the whole surface has to be scanned. eMMC parts instead keep
//! an anchor block pointing straight at each container.

use log::{debug, info};

use super::meta::{Anchor, LbaForm, PageMetadata, MMC_ANCHOR_BLOCKS};
use super::{
    container_name, Error, Issue, Report, Result, BLOCK_TYPE_ERASED, MAX_MOBILE, MOBILE_BASE,
    MOBILE_END, MOBILE_FSROOT,
};
use crate::geometry::GeometryProfile;
use crate::nand::{Flash, PageUtil};

/// Where the current copy of a container lives
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct ContainerDescriptor {
    /// Block type tag of the container
    pub id: u8,

    /// Sequence number on NAND, anchor version on eMMC
    pub version: u32,

    pub block: u32,

    /// Page within the block holding the newest copy
    pub page: u32,

    /// Size in bytes
    pub size: u32,
}

impl ContainerDescriptor {
    pub fn name(&self, big_block: bool) -> String {
        container_name(self.id, big_block)
    }
}

/// The containers found on an image
#[derive(Debug, Clone)]
pub struct Containers {
    pub fsroot: ContainerDescriptor,
    mobiles: [Option<ContainerDescriptor>; MAX_MOBILE],
}

impl Containers {
    /// Current copy of the Mobile with type tag `id`
    pub fn mobile(&self, id: u8) -> Option<&ContainerDescriptor> {
        let index = id.checked_sub(MOBILE_BASE)? as usize;
        self.mobiles.get(index)?.as_ref()
    }

    /// Every Mobile present, in id order
    pub fn mobiles(&self) -> impl Iterator<Item = &ContainerDescriptor> {
        self.mobiles.iter().flatten()
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ScanState {
    /// Nothing found yet
    Scanning,

    /// At least one container copy is held
    FoundCandidate,

    /// The surface has been fully scanned
    Done,
}

/// Keeps the highest-sequence copy of every container seen, one block at a time
#[derive(Debug)]
pub struct VersionedScanner {
    geometry: GeometryProfile,
    form: LbaForm,
    state: ScanState,
    fsroot: Option<ContainerDescriptor>,
    mobiles: [Option<ContainerDescriptor>; MAX_MOBILE],
}

impl VersionedScanner {
    pub fn new(geometry: &GeometryProfile, form: LbaForm) -> Self {
        Self {
            geometry: *geometry,
            form,
            state: ScanState::Scanning,
            fsroot: None,
            mobiles: [None; MAX_MOBILE],
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    fn page_meta(&self, spare: &[u8], page: u32) -> Result<PageMetadata> {
        let offset = page as usize * self.geometry.meta_size;
        let spare = spare.get(offset..).ok_or(Error::Truncated {
            what: "spare data",
            len: spare.len(),
            need: offset + self.geometry.meta_size,
        })?;
        PageMetadata::decode(self.geometry.variant, spare, self.form)
    }

    /// Look at the spare data of one physical block.
    ///
    /// Block 0 holds the boot loader and bad blocks hold nothing, so both are passed over.
    pub fn observe(&mut self, block: u32, spare: &[u8]) -> Result<()> {
        if block == 0 {
            return Ok(());
        }

        let meta = self.page_meta(spare, 0)?;
        if meta.bad_block {
            return Ok(());
        }

        let tag = meta.block_type;
        let candidate = if tag == self.geometry.fsroot_tag() {
            ContainerDescriptor {
                id: tag,
                version: meta.sequence,
                block,
                page: 0,
                size: self.geometry.block_size as u32,
            }
        } else if (MOBILE_BASE..MOBILE_END).contains(&tag) {
            let page = self.newest_page(spare, tag, meta.free_page_count)?;
            ContainerDescriptor {
                id: tag,
                version: meta.sequence,
                block,
                page,
                size: self.page_meta(spare, page)?.container_size,
            }
        } else {
            return Ok(());
        };

        let big_block = self.geometry.is_big_block_addressing;
        let slot = if tag == self.geometry.fsroot_tag() {
            &mut self.fsroot
        } else {
            &mut self.mobiles[(tag - MOBILE_BASE) as usize]
        };

        // Ties keep the copy seen first
        if slot.map_or(true, |x| candidate.version > x.version) {
            debug!(
                "{} candidate at block {block:#x}, page {}, v {}, size {:#x}",
                candidate.name(big_block),
                candidate.page,
                candidate.version,
                candidate.size
            );
            *slot = Some(candidate);
            self.state = ScanState::FoundCandidate;
        }

        Ok(())
    }

    /// Find the page holding the last copy of a Mobile within its block.
    ///
    /// Copies are written one after another, each taking the pages the first copy used.
    fn newest_page(&self, spare: &[u8], tag: u8, free_pages: u32) -> Result<u32> {
        let pages = self.geometry.pages_per_block;
        let stride = pages.saturating_sub(free_pages).max(1);

        let mut newest = 0;
        for page in (0..pages).step_by(stride as usize) {
            let block_type = self.page_meta(spare, page)?.block_type;
            if block_type == tag {
                newest = page;
            }
            if block_type == BLOCK_TYPE_ERASED {
                break;
            }
        }

        Ok(newest)
    }

    /// End the scan. Without an FSRoot nothing on the image can be read.
    pub fn finish(mut self, report: &mut Report) -> Result<Containers> {
        self.state = ScanState::Done;
        let fsroot = self.fsroot.ok_or(Error::NoFsRootFound)?;
        Ok(found(&self.geometry, fsroot, self.mobiles, report))
    }
}

/// Log the result of a scan and note the Mobiles that are absent
fn found(
    geometry: &GeometryProfile,
    fsroot: ContainerDescriptor,
    mobiles: [Option<ContainerDescriptor>; MAX_MOBILE],
    report: &mut Report,
) -> Containers {
    let big_block = geometry.is_big_block_addressing;
    info!(
        "FSRoot found at block {:#x}, v {}",
        fsroot.block, fsroot.version
    );

    for (id, mobile) in (MOBILE_BASE..MOBILE_END).zip(mobiles.iter()) {
        match mobile {
            Some(x) => info!(
                "{} found at block {:#x}, page {}, v {}, size {:#x}",
                x.name(big_block),
                x.block,
                x.page,
                x.version,
                x.size
            ),
            None if id == geometry.fsroot_tag() => (),
            None => report.push(Issue::MissingMobile { id }),
        }
    }

    Containers { fsroot, mobiles }
}

/// Read the anchor blocks of an eMMC part and take the containers from the newest one.
///
/// The second anchor wins a version tie, being the copy written last.
pub fn scan_anchor<F: Flash>(flash: &mut F, report: &mut Report) -> Result<Containers> {
    let geometry = *flash.geometry();
    let block_size = geometry.block_size;
    let anchor_block = geometry.config_block - MMC_ANCHOR_BLOCKS;

    let buf = flash
        .read_mapped_region(
            anchor_block * block_size as u32,
            block_size * MMC_ANCHOR_BLOCKS as usize,
        )
        .map_err(|source| Error::Io {
            block: anchor_block,
            source,
        })?;

    // Erased anchors were never written
    let anchor = buf
        .chunks(block_size)
        .filter(|x| !x.is_erased())
        .filter_map(Anchor::decode)
        .fold(None, |best: Option<Anchor>, x| match best {
            Some(best) if best.version > x.version => Some(best),
            _ => Some(x),
        })
        .ok_or(Error::NoFsRootFound)?;
    debug!("Using anchor version {}", anchor.version);

    let mut fsroot = None;
    let mut mobiles = [None; MAX_MOBILE];
    for (id, slot) in (MOBILE_BASE..MOBILE_END).zip(mobiles.iter_mut()) {
        let Some(record) = anchor.record(id).filter(|x| x.block != 0) else {
            continue;
        };

        let descriptor = ContainerDescriptor {
            id,
            version: anchor.version,
            block: record.block.into(),
            page: 0,
            size: u32::from(record.size_blocks) * block_size as u32,
        };
        if id == MOBILE_FSROOT {
            fsroot = Some(ContainerDescriptor {
                size: block_size as u32,
                ..descriptor
            });
        } else {
            *slot = Some(descriptor);
        }
    }

    let fsroot = fsroot.ok_or(Error::NoFsRootFound)?;
    Ok(found(&geometry, fsroot, mobiles, report))
}

/// Read the spare data of every block of a NAND part once, in order, handing each to `visit`.
///
/// Progress is reported through `howudoin`.
pub fn scan_surface<F, V>(flash: &mut F, mut visit: V) -> Result<()>
where
    F: Flash,
    V: FnMut(u32, &[u8]) -> Result<()>,
{
    let block_count = flash.geometry().total_blocks;
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(block_count));

    for block in 0..block_count {
        let (_, spare) = flash
            .read_block_separate(block)
            .map_err(|source| Error::Io { block, source })?;
        visit(block, &spare)?;
        rpt.inc();
    }

    rpt.close();
    Ok(())
}

/// Find every container on a part, scanning the whole surface on NAND
pub fn scan_containers<F: Flash>(
    flash: &mut F,
    form: LbaForm,
    report: &mut Report,
) -> Result<Containers> {
    let geometry = *flash.geometry();
    if geometry.is_emmc() {
        return scan_anchor(flash, report);
    }

    let mut scanner = VersionedScanner::new(&geometry, form);
    scan_surface(flash, |block, spare| scanner.observe(block, spare))?;
    scanner.finish(report)
}

#[cfg(test)]
use crate::geometry::Profile;

/// Spare data of a whole block with the given pages' metadata filled in
#[cfg(test)]
fn block_spare(
    geometry: &GeometryProfile,
    pages: &[(u32, PageMetadata)],
) -> anyhow::Result<Vec<u8>> {
    let mut spare = vec![0xFF; geometry.spare_size()];
    for (page, meta) in pages {
        let offset = *page as usize * geometry.meta_size;
        let bytes = meta.encode(geometry.variant)?;
        spare[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }
    Ok(spare)
}

#[cfg(test)]
fn tagged(block_type: u8, sequence: u32) -> PageMetadata {
    PageMetadata {
        block_type,
        sequence,
        ..Default::default()
    }
}

#[test]
fn test_highest_sequence_wins() -> anyhow::Result<()> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut scanner = VersionedScanner::new(&geometry, LbaForm::Canonical);
    assert_eq!(scanner.state(), ScanState::Scanning);

    for (block, sequence) in [(10, 3), (11, 7), (12, 5)] {
        scanner.observe(block, &block_spare(&geometry, &[(0, tagged(0x30, sequence))])?)?;
    }
    assert_eq!(scanner.state(), ScanState::FoundCandidate);

    let mut report = Report::default();
    let containers = scanner.finish(&mut report)?;
    assert_eq!(containers.fsroot.block, 11);
    assert_eq!(containers.fsroot.version, 7);
    assert_eq!(containers.fsroot.size, 0x4000);
    Ok(())
}

#[test]
fn test_first_seen_wins_tie() -> anyhow::Result<()> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut scanner = VersionedScanner::new(&geometry, LbaForm::Canonical);
    for block in [20, 21] {
        scanner.observe(block, &block_spare(&geometry, &[(0, tagged(0x30, 9))])?)?;
    }

    let containers = scanner.finish(&mut Report::default())?;
    assert_eq!(containers.fsroot.block, 20);
    Ok(())
}

#[test]
fn test_skipped_blocks() -> anyhow::Result<()> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut scanner = VersionedScanner::new(&geometry, LbaForm::Canonical);

    // The boot loader block and bad blocks never count
    scanner.observe(0, &block_spare(&geometry, &[(0, tagged(0x30, 100))])?)?;
    let mut bad = tagged(0x30, 50);
    bad.bad_block = true;
    scanner.observe(3, &block_spare(&geometry, &[(0, bad)])?)?;
    assert_eq!(scanner.state(), ScanState::Scanning);

    assert!(matches!(
        scanner.finish(&mut Report::default()),
        Err(Error::NoFsRootFound)
    ));
    Ok(())
}

#[test]
fn test_mobile_newest_page() -> anyhow::Result<()> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut scanner = VersionedScanner::new(&geometry, LbaForm::Canonical);
    scanner.observe(4, &block_spare(&geometry, &[(0, tagged(0x30, 1))])?)?;

    // Each copy takes 8 pages; the third slot is still erased, and stale data past it is ignored
    let first = PageMetadata {
        free_page_count: 24,
        container_size: 0x100,
        ..tagged(0x31, 4)
    };
    let second = PageMetadata {
        container_size: 0x200,
        ..first
    };
    let stale = PageMetadata {
        container_size: 0x300,
        ..first
    };
    let spare = block_spare(&geometry, &[(0, first), (8, second), (24, stale)])?;
    scanner.observe(5, &spare)?;

    let mut report = Report::default();
    let containers = scanner.finish(&mut report)?;
    let mobile = containers.mobile(0x31).ok_or(anyhow::anyhow!("no MobileB"))?;
    assert_eq!(
        *mobile,
        ContainerDescriptor {
            id: 0x31,
            version: 4,
            block: 5,
            page: 8,
            size: 0x200
        }
    );
    assert_eq!(mobile.name(false), "MobileB");
    assert_eq!(containers.mobiles().count(), 1);

    // MobileC..MobileO are absent, which is only informational
    assert_eq!(report.issues().len(), 13);
    assert!(report.is_clean());
    Ok(())
}

#[test]
fn test_big_block_tags() -> anyhow::Result<()> {
    let geometry = Profile::BigBlock128K.geometry();
    let mut scanner = VersionedScanner::new(&geometry, LbaForm::Canonical);
    scanner.observe(1, &block_spare(&geometry, &[(0, tagged(0x2C, 2))])?)?;
    let mobile_a = PageMetadata {
        free_page_count: 252,
        container_size: 0x40,
        ..tagged(0x30, 1)
    };
    scanner.observe(2, &block_spare(&geometry, &[(0, mobile_a)])?)?;

    let containers = scanner.finish(&mut Report::default())?;
    assert_eq!(containers.fsroot.block, 1);
    assert_eq!(containers.fsroot.size, 0x20000);
    let mobile = containers.mobile(0x30).ok_or(anyhow::anyhow!("no MobileA"))?;
    assert_eq!((mobile.block, mobile.size), (2, 0x40));
    assert_eq!(mobile.name(true), "MobileA");
    Ok(())
}

#[cfg(test)]
fn write_anchor(
    dump: &mut crate::nand::DumpImage,
    index: u32,
    version: u32,
    records: &[(u8, u16, u16)],
) -> anyhow::Result<()> {
    use super::meta::AnchorRecord;

    let geometry = *dump.geometry();
    let mut anchor = Anchor {
        version,
        ..Default::default()
    };
    for &(id, block, size_blocks) in records {
        anchor.mobiles[(id - MOBILE_BASE) as usize] = AnchorRecord { block, size_blocks };
    }

    let mut buf = vec![0; geometry.block_size];
    anchor.encode(&mut buf)?;
    let block = geometry.config_block - MMC_ANCHOR_BLOCKS + index;
    dump.write_mapped(block * geometry.block_size as u32, &buf)
}

#[test]
fn test_scan_surface() -> anyhow::Result<()> {
    use crate::nand::DumpImage;

    let geometry = Profile::BigBlock128K.geometry();
    let mut dump = DumpImage::new(geometry);
    let meta = tagged(0x2C, 1);
    dump.program_page(3, 0, &[], &meta.encode(geometry.variant)?)?;

    let mut seen = Vec::new();
    scan_surface(&mut dump, |block, spare| {
        assert_eq!(spare.len(), geometry.spare_size());
        if !spare.is_erased() {
            seen.push(block);
        }
        Ok(())
    })?;
    assert_eq!(seen, [3]);

    // The same pass feeds the scanner through scan_containers
    let containers = scan_containers(&mut dump, LbaForm::Canonical, &mut Report::default())?;
    assert_eq!(containers.fsroot.block, 3);

    // A failing visitor stops the pass
    let mut visited = 0;
    let result = scan_surface(&mut dump, |_, _| {
        visited += 1;
        Err(Error::NoFsRootFound)
    });
    assert!(matches!(result, Err(Error::NoFsRootFound)));
    assert_eq!(visited, 1);
    Ok(())
}

#[test]
fn test_emmc_anchor() -> anyhow::Result<()> {
    use crate::nand::DumpImage;

    let mut dump = DumpImage::new(Profile::Emmc.geometry());
    write_anchor(&mut dump, 0, 6, &[(0x30, 0x100, 1), (0x31, 0x110, 2)])?;
    write_anchor(&mut dump, 1, 5, &[(0x30, 0x200, 1)])?;

    let mut report = Report::default();
    let containers = scan_containers(&mut dump, LbaForm::Canonical, &mut report)?;
    assert_eq!(containers.fsroot.block, 0x100);
    assert_eq!(containers.fsroot.version, 6);
    assert_eq!(containers.fsroot.size, 0x4000);
    let mobile = containers.mobile(0x31).ok_or(anyhow::anyhow!("no MobileB"))?;
    assert_eq!((mobile.block, mobile.size), (0x110, 0x8000));
    assert!(containers.mobile(0x32).is_none());

    // Equal versions: the second anchor wins
    write_anchor(&mut dump, 1, 6, &[(0x30, 0x200, 1)])?;
    let containers = scan_containers(&mut dump, LbaForm::Canonical, &mut report)?;
    assert_eq!(containers.fsroot.block, 0x200);
    assert_eq!(containers.mobiles().count(), 0);
    Ok(())
}

#[test]
fn test_emmc_without_fsroot() -> anyhow::Result<()> {
    use crate::nand::DumpImage;

    let mut dump = DumpImage::new(Profile::Emmc.geometry());
    write_anchor(&mut dump, 0, 1, &[(0x31, 0x110, 2)])?;
    assert!(matches!(
        scan_anchor(&mut dump, &mut Report::default()),
        Err(Error::NoFsRootFound)
    ));
    Ok(())
}
