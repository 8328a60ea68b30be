//! The logical block address map: which physical block holds each logical block.
//!
//! Blocks that go bad are retired and their contents moved elsewhere, so a filesystem cluster
//! can only be found through the LBA recorded in each physical block's spare data.

use std::collections::HashMap;

use log::debug;

use super::meta::{LbaForm, PageMetadata};
use super::scan::scan_surface;
use super::{Error, Issue, Report, Result, BLOCK_TYPE_ERASED};
use crate::geometry::GeometryProfile;
use crate::nand::Flash;

/// Pages between the sub-block metadata records of a big block
const SUB_BLOCK_PAGES: usize = 32;

/// Where a filesystem cluster lives on the physical part
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct ClusterLocation {
    /// Physical block index
    pub block: u32,

    /// Byte offset of the cluster within the block's user data
    pub offset: usize,
}

/// Physical-to-logical block table, read-only once built
#[derive(Debug, Clone)]
pub struct LbaMap {
    slots: Box<[Option<u16>]>,
    slots_per_block: u32,
    cluster_size: usize,

    /// Logical address to the first slot carrying it
    reverse: HashMap<u16, u32>,
}

impl LbaMap {
    fn from_slots(geometry: &GeometryProfile, slots: Vec<Option<u16>>) -> Self {
        let mut reverse = HashMap::new();
        for (index, lba) in slots.iter().enumerate() {
            if let Some(lba) = lba {
                reverse.entry(*lba).or_insert(index as u32);
            }
        }

        Self {
            slots: slots.into_boxed_slice(),
            slots_per_block: geometry.lba_slots_per_block(),
            cluster_size: geometry.cluster_size(),
            reverse,
        }
    }

    /// The map of a part that does its own remapping: every block is where it says it is
    pub fn identity(geometry: &GeometryProfile) -> Self {
        let slots = (0..geometry.lba_map_len()).map(|x| Some(x as u16)).collect();
        Self::from_slots(geometry, slots)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Logical address recorded in a slot, if any
    pub fn get(&self, slot: usize) -> Option<u16> {
        self.slots.get(slot).copied().flatten()
    }

    pub fn slots_per_block(&self) -> u32 {
        self.slots_per_block
    }

    /// Bytes addressed by one cluster
    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Number of slots that point at a logical block
    pub fn mapped_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Find the physical location of a filesystem cluster.
    ///
    /// `fs_start_offset` is subtracted from the cluster index first. On big-block parts, eight
    /// clusters share one logical block and the remainder selects the sub-block within it.
    pub fn locate(&self, cluster: u16, fs_start_offset: u16) -> Option<ClusterLocation> {
        let relative = cluster.checked_sub(fs_start_offset)?;
        let per_block = self.slots_per_block as u16;

        let slot = *self.reverse.get(&(relative / per_block))?;
        Some(ClusterLocation {
            block: slot / self.slots_per_block,
            offset: (relative % per_block) as usize * self.cluster_size,
        })
    }
}

/// Builds an [`LbaMap`] one physical block at a time
#[derive(Debug)]
pub struct LbaMapBuilder {
    geometry: GeometryProfile,
    form: LbaForm,
    slots: Vec<Option<u16>>,
}

impl LbaMapBuilder {
    pub fn new(geometry: &GeometryProfile, form: LbaForm) -> Self {
        Self {
            geometry: *geometry,
            form,
            slots: vec![None; geometry.lba_map_len()],
        }
    }

    /// Record the logical address(es) of a physical block from its spare data
    pub fn record(&mut self, block: u32, spare: &[u8], report: &mut Report) -> Result<()> {
        let per_block = self.geometry.lba_slots_per_block();
        let stride = self.geometry.meta_size * SUB_BLOCK_PAGES;

        for sub in 0..per_block {
            let slot = (block * per_block + sub) as usize;
            let offset = sub as usize * stride;
            let spare = spare.get(offset..).ok_or(Error::Truncated {
                what: "spare data",
                len: spare.len(),
                need: offset + self.geometry.meta_size,
            })?;
            let meta = PageMetadata::decode(self.geometry.variant, spare, self.form)?;

            // The bad-block mark is only meaningful on the first page
            if sub == 0 && meta.bad_block {
                report.push(Issue::BadBlock { block });
                return Ok(());
            }

            if meta.block_type == BLOCK_TYPE_ERASED {
                debug!("block {block:#x}, sub-block {sub}: erased");
                continue;
            }

            if let Some(x) = self.slots.get_mut(slot) {
                *x = Some(meta.lba);
            }
        }

        Ok(())
    }

    pub fn finish(self) -> LbaMap {
        LbaMap::from_slots(&self.geometry, self.slots)
    }
}

/// Read the whole surface and build its LBA map. eMMC parts get the identity map without any reads.
pub fn build_lba_map<F: Flash>(
    flash: &mut F,
    form: LbaForm,
    report: &mut Report,
) -> Result<LbaMap> {
    let geometry = *flash.geometry();
    if geometry.is_emmc() {
        return Ok(LbaMap::identity(&geometry));
    }

    let mut builder = LbaMapBuilder::new(&geometry, form);
    scan_surface(flash, |block, spare| builder.record(block, spare, report))?;
    Ok(builder.finish())
}

#[cfg(test)]
use crate::{geometry::Profile, nand::DumpImage};

#[cfg(test)]
fn spare_for(geometry: &GeometryProfile, lba: u16, bad_block: bool) -> anyhow::Result<Vec<u8>> {
    let fields = PageMetadata {
        lba,
        block_type: 0x01,
        bad_block,
        ..Default::default()
    };
    Ok(fields.encode(geometry.variant)?)
}

#[test]
fn test_map_length_per_variant() -> anyhow::Result<()> {
    for profile in [
        Profile::SmallBlock16M,
        Profile::BigOnSmall16M,
        Profile::BigBlock256K,
        Profile::Emmc,
    ] {
        let mut dump = DumpImage::new(profile.geometry());
        let mut report = Report::default();
        let map = build_lba_map(&mut dump, LbaForm::Canonical, &mut report)?;

        let geometry = profile.geometry();
        let expected = match geometry.is_big_block_addressing {
            true => geometry.total_blocks as usize * 8,
            false => geometry.total_blocks as usize,
        };
        assert_eq!(map.len(), expected, "{profile}");
        assert!(report.is_clean());
    }
    Ok(())
}

#[test]
fn test_small_block_remap() -> anyhow::Result<()> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut dump = DumpImage::new(geometry);
    dump.program_page(5, 0, &[], &spare_for(&geometry, 0x10, false)?)?;
    dump.program_page(6, 0, &[], &spare_for(&geometry, 0x11, true)?)?;
    dump.program_page(7, 0, &[], &spare_for(&geometry, 0x10, false)?)?;
    dump.program_page(8, 0, &[], &spare_for(&geometry, 0x12, false)?)?;

    let mut report = Report::default();
    let map = build_lba_map(&mut dump, LbaForm::Canonical, &mut report)?;

    assert_eq!(map.get(5), Some(0x10));
    assert_eq!(map.get(6), None);
    assert_eq!(map.get(4), None);
    assert_eq!(map.mapped_count(), 3);
    assert_eq!(report.issues(), [Issue::BadBlock { block: 6 }]);

    // The first block carrying an address wins
    assert_eq!(
        map.locate(0x10, 0),
        Some(ClusterLocation {
            block: 5,
            offset: 0
        })
    );
    assert_eq!(map.locate(0x12, 0).map(|x| x.block), Some(8));
    assert_eq!(map.locate(0x14, 2).map(|x| x.block), Some(8));
    assert_eq!(map.locate(0x11, 0), None);
    assert_eq!(map.locate(0x01, 2), None);
    Ok(())
}

#[test]
fn test_big_block_sub_blocks() -> anyhow::Result<()> {
    let geometry = Profile::BigBlock128K.geometry();
    let mut dump = DumpImage::new(geometry);
    for sub in 0..8 {
        dump.program_page(2, sub * 32, &[], &spare_for(&geometry, 0x20, false)?)?;
    }
    // Only the first half of block 3 has been written
    for sub in 0..4 {
        dump.program_page(3, sub * 32, &[], &spare_for(&geometry, 0x21, false)?)?;
    }

    let mut report = Report::default();
    let map = build_lba_map(&mut dump, LbaForm::Canonical, &mut report)?;
    assert_eq!(map.slots_per_block(), 8);
    assert_eq!(map.cluster_size(), 0x4000);
    assert!((16..24).all(|x| map.get(x) == Some(0x20)));
    assert!((24..28).all(|x| map.get(x) == Some(0x21)));
    assert!((28..32).all(|x| map.get(x).is_none()));

    assert_eq!(
        map.locate(0x20 * 8 + 3, 0),
        Some(ClusterLocation {
            block: 2,
            offset: 3 * 0x4000
        })
    );
    assert_eq!(map.locate(0x21 * 8 + 1 + 0x40, 0x40).map(|x| x.block), Some(3));
    Ok(())
}

#[test]
fn test_identity() {
    let map = LbaMap::identity(&Profile::Emmc.geometry());
    assert_eq!(map.len(), 0xC00);
    assert_eq!(
        map.locate(0x123, 0),
        Some(ClusterLocation {
            block: 0x123,
            offset: 0
        })
    );
}
