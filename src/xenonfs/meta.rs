//! Codecs for the per-page spare metadata, and for the eMMC anchor block.
//!
//! The three NAND layouts hold the same information in different places, and do not even agree
//! on byte order: the sequence number is stored least-significant byte first on small-block parts
//! but most-significant first on big-block parts. The raw structs below mirror the bytes exactly;
//! [`MetadataView`] is the only way the rest of the crate reads them.

use bytes::{Buf, BufMut};
use deku::prelude::*;

use super::{Error, Result, BLOCK_TYPE_ERASED, MAX_MOBILE, MOBILE_BASE};
use crate::geometry::Variant;

/// Value of a bad-block byte on a good block
pub const GOOD_BLOCK_MARK: u8 = 0xFF;

/// Layout-independent access to one page's spare metadata
pub trait MetadataView {
    /// 12-bit logical block address
    fn lba(&self) -> u16;

    /// 6-bit block type tag
    fn block_type(&self) -> u8;

    /// Raw bad-block byte
    fn bad_block_mark(&self) -> u8;

    /// Size of the container written in this block, in bytes
    fn container_size(&self) -> u32;

    /// Pages left unwritten in the block
    fn free_page_count(&self) -> u32;

    /// 24-bit version counter
    fn sequence(&self) -> u32;

    /// The stored EDC bytes, in the order [`super::ecc::compute`] produces them
    fn ecc(&self) -> [u8; 4];

    fn is_bad(&self) -> bool {
        self.bad_block_mark() != GOOD_BLOCK_MARK
    }

    fn is_erased(&self) -> bool {
        self.block_type() == BLOCK_TYPE_ERASED
    }
}

/// Spare layout of the original small-block controller
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
pub struct SmallBlockMeta {
    pub block_id1: u8,
    #[deku(bits = 4)]
    pub unused0: u8,
    #[deku(bits = 4)]
    pub block_id0: u8,
    pub sequence0: u8,
    pub sequence1: u8,
    pub sequence2: u8,
    pub bad_block: u8,
    pub sequence3: u8,
    pub size1: u8,
    pub size0: u8,
    pub free_pages: u8,
    pub unused1: [u8; 2],
    #[deku(bits = 2)]
    pub ecc3: u8,
    #[deku(bits = 6)]
    pub block_type: u8,
    pub ecc2: u8,
    pub ecc1: u8,
    pub ecc0: u8,
}

/// Spare layout of a big-block controller driving a small-block part.
///
/// Same as [`SmallBlockMeta`] except that the low sequence byte moved to the front.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
pub struct BigOnSmallMeta {
    pub sequence0: u8,
    pub block_id1: u8,
    #[deku(bits = 4)]
    pub unused0: u8,
    #[deku(bits = 4)]
    pub block_id0: u8,
    pub sequence1: u8,
    pub sequence2: u8,
    pub bad_block: u8,
    pub sequence3: u8,
    pub size1: u8,
    pub size0: u8,
    pub free_pages: u8,
    pub unused1: [u8; 2],
    #[deku(bits = 2)]
    pub ecc3: u8,
    #[deku(bits = 6)]
    pub block_type: u8,
    pub ecc2: u8,
    pub ecc1: u8,
    pub ecc0: u8,
}

/// Spare layout of big-block parts. The sequence bytes are stored in reverse order here.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
pub struct BigBlockMeta {
    pub bad_block: u8,
    pub block_id1: u8,
    #[deku(bits = 4)]
    pub unused0: u8,
    #[deku(bits = 4)]
    pub block_id0: u8,
    pub sequence2: u8,
    pub sequence1: u8,
    pub sequence0: u8,
    pub unused1: u8,
    pub size1: u8,
    pub size0: u8,
    /// Counted in units of four pages
    pub free_pages: u8,
    pub unused2: [u8; 2],
    #[deku(bits = 2)]
    pub ecc3: u8,
    #[deku(bits = 6)]
    pub block_type: u8,
    pub ecc2: u8,
    pub ecc1: u8,
    pub ecc0: u8,
}

/// Which formulas to use for the BigOnSmall logical block address and container size.
///
/// Two revisions of the reference code disagree: one masks before shifting (like the other
/// layouts), the other shifts first and masks afterwards, which leaves only the low byte. Both
/// fields are affected the same way. Until a real BigOnSmall image settles it, both are available.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum LbaForm {
    /// `((BlockID0 & 0xF) << 8) + BlockID1` and `(FsSize0 << 8) + FsSize1`
    #[default]
    Canonical,

    /// `((BlockID0 << 8) & 0xF) + BlockID1` and `((FsSize0 << 8) & 0xFF) + FsSize1`
    Legacy,
}

fn lba_canonical(id0: u8, id1: u8) -> u16 {
    ((u16::from(id0) & 0xF) << 8) + u16::from(id1)
}

fn size_from(size0: u8, size1: u8) -> u32 {
    (u32::from(size0) << 8) + u32::from(size1)
}

fn sequence_from(sequence0: u8, sequence1: u8, sequence2: u8) -> u32 {
    u32::from(sequence0) + (u32::from(sequence1) << 8) + (u32::from(sequence2) << 16)
}

fn ecc_from(ecc3: u8, block_type: u8, ecc2: u8, ecc1: u8, ecc0: u8) -> [u8; 4] {
    [(ecc3 << 6) | block_type, ecc2, ecc1, ecc0]
}

impl MetadataView for SmallBlockMeta {
    fn lba(&self) -> u16 {
        lba_canonical(self.block_id0, self.block_id1)
    }
    fn block_type(&self) -> u8 {
        self.block_type
    }
    fn bad_block_mark(&self) -> u8 {
        self.bad_block
    }
    fn container_size(&self) -> u32 {
        size_from(self.size0, self.size1)
    }
    fn free_page_count(&self) -> u32 {
        self.free_pages.into()
    }
    fn sequence(&self) -> u32 {
        sequence_from(self.sequence0, self.sequence1, self.sequence2)
    }
    fn ecc(&self) -> [u8; 4] {
        ecc_from(self.ecc3, self.block_type, self.ecc2, self.ecc1, self.ecc0)
    }
}

impl BigOnSmallMeta {
    pub fn lba_with(&self, form: LbaForm) -> u16 {
        match form {
            LbaForm::Canonical => lba_canonical(self.block_id0, self.block_id1),
            LbaForm::Legacy => {
                ((u16::from(self.block_id0) << 8) & 0xF) + (u16::from(self.block_id1) & 0xFF)
            }
        }
    }

    pub fn container_size_with(&self, form: LbaForm) -> u32 {
        match form {
            LbaForm::Canonical => size_from(self.size0, self.size1),
            LbaForm::Legacy => ((u32::from(self.size0) << 8) & 0xFF) + u32::from(self.size1),
        }
    }
}

impl MetadataView for BigOnSmallMeta {
    fn lba(&self) -> u16 {
        self.lba_with(LbaForm::Canonical)
    }
    fn block_type(&self) -> u8 {
        self.block_type
    }
    fn bad_block_mark(&self) -> u8 {
        self.bad_block
    }
    fn container_size(&self) -> u32 {
        size_from(self.size0, self.size1)
    }
    fn free_page_count(&self) -> u32 {
        self.free_pages.into()
    }
    fn sequence(&self) -> u32 {
        sequence_from(self.sequence0, self.sequence1, self.sequence2)
    }
    fn ecc(&self) -> [u8; 4] {
        ecc_from(self.ecc3, self.block_type, self.ecc2, self.ecc1, self.ecc0)
    }
}

impl MetadataView for BigBlockMeta {
    fn lba(&self) -> u16 {
        lba_canonical(self.block_id0, self.block_id1)
    }
    fn block_type(&self) -> u8 {
        self.block_type
    }
    fn bad_block_mark(&self) -> u8 {
        self.bad_block
    }
    fn container_size(&self) -> u32 {
        size_from(self.size0, self.size1)
    }
    fn free_page_count(&self) -> u32 {
        u32::from(self.free_pages) * 4
    }
    fn sequence(&self) -> u32 {
        sequence_from(self.sequence0, self.sequence1, self.sequence2)
    }
    fn ecc(&self) -> [u8; 4] {
        ecc_from(self.ecc3, self.block_type, self.ecc2, self.ecc1, self.ecc0)
    }
}

/// The spare bytes of one page, decoded with the layout of the part they came from
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SpareRecord {
    SmallBlock(SmallBlockMeta),
    BigOnSmall(BigOnSmallMeta, LbaForm),
    BigBlock(BigBlockMeta),
}

impl SpareRecord {
    /// Decode the first 16 bytes of `spare`
    pub fn decode(variant: Variant, spare: &[u8], form: LbaForm) -> Result<Self> {
        Ok(match variant {
            Variant::SmallBlock => Self::SmallBlock(SmallBlockMeta::from_bytes((spare, 0))?.1),
            Variant::BigOnSmall => {
                Self::BigOnSmall(BigOnSmallMeta::from_bytes((spare, 0))?.1, form)
            }
            Variant::BigBlock => Self::BigBlock(BigBlockMeta::from_bytes((spare, 0))?.1),
            Variant::EmmcMapped => {
                return Err(Error::UnsupportedGeometry(
                    "eMMC parts carry no spare metadata".to_string(),
                ))
            }
        })
    }

    /// Lay out a set of logical fields the way `variant` stores them. The EDC bytes are left
    /// zeroed; see [`super::ecc::fill`].
    pub fn from_fields(variant: Variant, fields: &PageMetadata) -> Result<Self> {
        let PageMetadata {
            lba,
            block_type,
            sequence,
            free_page_count,
            container_size,
            bad_block,
            ..
        } = *fields;

        let block_id0 = ((lba >> 8) & 0xF) as u8;
        let block_id1 = lba as u8;
        let [sequence0, sequence1, sequence2, _] = sequence.to_le_bytes();
        let [size1, size0, ..] = container_size.to_le_bytes();
        let bad_block = if bad_block { 0x00 } else { GOOD_BLOCK_MARK };
        let block_type = block_type & 0x3F;

        Ok(match variant {
            Variant::SmallBlock => Self::SmallBlock(SmallBlockMeta {
                block_id1,
                block_id0,
                sequence0,
                sequence1,
                sequence2,
                bad_block,
                size1,
                size0,
                free_pages: free_page_count as u8,
                block_type,
                ..Default::default()
            }),
            Variant::BigOnSmall => Self::BigOnSmall(
                BigOnSmallMeta {
                    sequence0,
                    block_id1,
                    block_id0,
                    sequence1,
                    sequence2,
                    bad_block,
                    size1,
                    size0,
                    free_pages: free_page_count as u8,
                    block_type,
                    ..Default::default()
                },
                LbaForm::Canonical,
            ),
            Variant::BigBlock => Self::BigBlock(BigBlockMeta {
                bad_block,
                block_id1,
                block_id0,
                sequence2,
                sequence1,
                sequence0,
                size1,
                size0,
                free_pages: (free_page_count / 4) as u8,
                block_type,
                ..Default::default()
            }),
            Variant::EmmcMapped => {
                return Err(Error::UnsupportedGeometry(
                    "eMMC parts carry no spare metadata".to_string(),
                ))
            }
        })
    }

    /// Write the record back out as 16 spare bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::SmallBlock(meta) => meta.to_bytes()?,
            Self::BigOnSmall(meta, _) => meta.to_bytes()?,
            Self::BigBlock(meta) => meta.to_bytes()?,
        })
    }

    fn view(&self) -> &dyn MetadataView {
        match self {
            Self::SmallBlock(meta) => meta,
            Self::BigOnSmall(meta, _) => meta,
            Self::BigBlock(meta) => meta,
        }
    }
}

impl MetadataView for SpareRecord {
    fn lba(&self) -> u16 {
        match self {
            Self::BigOnSmall(meta, form) => meta.lba_with(*form),
            _ => self.view().lba(),
        }
    }
    fn block_type(&self) -> u8 {
        self.view().block_type()
    }
    fn bad_block_mark(&self) -> u8 {
        self.view().bad_block_mark()
    }
    fn container_size(&self) -> u32 {
        match self {
            Self::BigOnSmall(meta, form) => meta.container_size_with(*form),
            _ => self.view().container_size(),
        }
    }
    fn free_page_count(&self) -> u32 {
        self.view().free_page_count()
    }
    fn sequence(&self) -> u32 {
        self.view().sequence()
    }
    fn ecc(&self) -> [u8; 4] {
        self.view().ecc()
    }
}

/// The logical content of one page's spare data, independent of layout
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct PageMetadata {
    pub lba: u16,
    pub block_type: u8,
    pub sequence: u32,
    pub free_page_count: u32,
    pub container_size: u32,
    pub bad_block: bool,
    pub ecc: [u8; 4],
}

impl PageMetadata {
    /// Decode spare bytes straight into the logical view
    pub fn decode(variant: Variant, spare: &[u8], form: LbaForm) -> Result<Self> {
        SpareRecord::decode(variant, spare, form).map(|x| Self::from(&x))
    }

    /// Encode into 16 spare bytes for `variant` (EDC bytes zeroed)
    pub fn encode(&self, variant: Variant) -> Result<Vec<u8>> {
        SpareRecord::from_fields(variant, self)?.encode()
    }
}

impl From<&SpareRecord> for PageMetadata {
    fn from(value: &SpareRecord) -> Self {
        Self {
            lba: value.lba(),
            block_type: value.block_type(),
            sequence: value.sequence(),
            free_page_count: value.free_page_count(),
            container_size: value.container_size(),
            bad_block: value.is_bad(),
            ecc: value.ecc(),
        }
    }
}

/// Number of anchor block copies on eMMC parts
pub const MMC_ANCHOR_BLOCKS: u32 = 2;

/// Length of the hash at the start of the anchor
pub const MMC_ANCHOR_HASH_LEN: usize = 0x14;

pub const MMC_ANCHOR_VERSION_POS: usize = 0x18;
pub const MMC_ANCHOR_MOBI_START: usize = 0x1C;
pub const MMC_ANCHOR_MOBI_SIZE: usize = 0x8;

/// Offset of the record for container `id`, if `id` is a container type
fn anchor_record_pos(id: u8) -> Option<usize> {
    let index = id.checked_sub(MOBILE_BASE)? as usize;
    (index < MAX_MOBILE).then_some(MMC_ANCHOR_MOBI_START + index * MMC_ANCHOR_MOBI_SIZE)
}

/// Version counter of an anchor block
pub fn anchor_version(buf: &[u8]) -> Option<u32> {
    let mut field = buf.get(MMC_ANCHOR_VERSION_POS..MMC_ANCHOR_VERSION_POS + 4)?;
    Some(field.get_u32())
}

/// Block holding container `id`, or 0 when absent
pub fn anchor_mobile_block(buf: &[u8], id: u8) -> Option<u16> {
    let pos = anchor_record_pos(id)?;
    let mut field = buf.get(pos..pos + 2)?;
    Some(field.get_u16())
}

/// Size of container `id`, in blocks
pub fn anchor_mobile_size(buf: &[u8], id: u8) -> Option<u16> {
    let pos = anchor_record_pos(id)? + 4;
    let mut field = buf.get(pos..pos + 2)?;
    Some(field.get_u16())
}

/// One container pointer in an anchor block
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct AnchorRecord {
    pub block: u16,
    pub size_blocks: u16,
}

/// The fields we care about in an eMMC anchor block
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct Anchor {
    pub version: u32,
    pub mobiles: [AnchorRecord; MAX_MOBILE],
}

impl Anchor {
    /// Convert from a byte slice
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let version = anchor_version(buf)?;
        let mut mobiles = [AnchorRecord::default(); MAX_MOBILE];
        for (id, record) in (MOBILE_BASE..).zip(mobiles.iter_mut()) {
            *record = AnchorRecord {
                block: anchor_mobile_block(buf, id)?,
                size_blocks: anchor_mobile_size(buf, id)?,
            };
        }

        Some(Self { version, mobiles })
    }

    /// Write into a byte slice; the hash region is left as is
    pub fn encode(&self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let end = MMC_ANCHOR_MOBI_START + MAX_MOBILE * MMC_ANCHOR_MOBI_SIZE;
        let mut out = out_bytes
            .get_mut(MMC_ANCHOR_VERSION_POS..end)
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;

        out.put_u32(self.version);
        for record in &self.mobiles {
            out.put_u16(record.block);
            out.put_u16(0);
            out.put_u16(record.size_blocks);
            out.put_u16(0);
        }
        Ok(())
    }

    pub fn record(&self, id: u8) -> Option<AnchorRecord> {
        let index = id.checked_sub(MOBILE_BASE)? as usize;
        self.mobiles.get(index).copied()
    }
}

#[cfg(test)]
fn known_fields() -> PageMetadata {
    PageMetadata {
        lba: 0x123,
        block_type: 0x30,
        sequence: 0x42,
        free_page_count: 0x1C,
        container_size: 0x0200,
        bad_block: false,
        // First EDC byte shares its low bits with the block type
        ecc: [0x30, 0, 0, 0],
    }
}

#[test]
fn test_small_block_literal() -> anyhow::Result<()> {
    let spare = [
        0x23, 0x01, 0x42, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x02, 0x1C, 0x00, 0x00, 0xF0, 0xAA, 0xBB,
        0xCC,
    ];
    let meta = PageMetadata::decode(Variant::SmallBlock, &spare, LbaForm::Canonical)?;
    assert_eq!(meta.lba, 0x123);
    assert_eq!(meta.block_type, 0x30);
    assert_eq!(meta.sequence, 0x42);
    assert_eq!(meta.free_page_count, 0x1C);
    assert_eq!(meta.container_size, 0x200);
    assert!(!meta.bad_block);
    assert_eq!(meta.ecc, [0xF0, 0xAA, 0xBB, 0xCC]);

    // The high nibble of byte 1 is not part of the LBA
    let mut spare = spare;
    spare[1] = 0xA1;
    let meta = PageMetadata::decode(Variant::SmallBlock, &spare, LbaForm::Canonical)?;
    assert_eq!(meta.lba, 0x123);
    Ok(())
}

#[test]
fn test_big_on_small_literal() -> anyhow::Result<()> {
    let spare = [
        0x42, 0x23, 0x01, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x02, 0x1C, 0x00, 0x00, 0x30, 0x00, 0x00,
        0x00,
    ];
    let meta = PageMetadata::decode(Variant::BigOnSmall, &spare, LbaForm::Canonical)?;
    assert_eq!(meta.lba, 0x123);
    assert_eq!(meta.block_type, 0x30);
    assert_eq!(meta.sequence, 0x42);
    assert_eq!(meta.container_size, 0x200);

    let legacy = PageMetadata::decode(Variant::BigOnSmall, &spare, LbaForm::Legacy)?;
    assert_eq!(legacy.lba, 0x23);
    assert_eq!(legacy.sequence, 0x42);
    assert_eq!(legacy.container_size, 0);
    Ok(())
}

#[test]
fn test_big_on_small_size_forms() -> anyhow::Result<()> {
    let mut spare = [0xFF; 16];
    spare[7] = 0x40;
    spare[8] = 0x03;

    let canonical = PageMetadata::decode(Variant::BigOnSmall, &spare, LbaForm::Canonical)?;
    assert_eq!(canonical.container_size, 0x340);

    // Shifting before masking drops the high byte, like the legacy address
    let legacy = PageMetadata::decode(Variant::BigOnSmall, &spare, LbaForm::Legacy)?;
    assert_eq!(legacy.container_size, 0x40);

    // Other layouts have a single formula
    let small = PageMetadata::decode(Variant::SmallBlock, &spare, LbaForm::Legacy)?;
    assert_eq!(small.container_size, canonical.container_size);
    Ok(())
}

#[test]
fn test_big_block_literal() -> anyhow::Result<()> {
    let spare = [
        0xFF, 0x23, 0x01, 0x00, 0x00, 0x42, 0x00, 0x00, 0x02, 0x07, 0x00, 0x00, 0x30, 0x00, 0x00,
        0x00,
    ];
    let meta = PageMetadata::decode(Variant::BigBlock, &spare, LbaForm::Canonical)?;
    assert_eq!(meta.lba, 0x123);
    assert_eq!(meta.block_type, 0x30);
    assert_eq!(meta.sequence, 0x42);
    assert_eq!(meta.free_page_count, 7 * 4);
    assert!(!meta.bad_block);

    // Reversed byte order compared to the small-block layouts
    let mut spare = spare;
    spare[3] = 0x01;
    let meta = PageMetadata::decode(Variant::BigBlock, &spare, LbaForm::Canonical)?;
    assert_eq!(meta.sequence, 0x01_0042);

    spare[0] = 0x00;
    let meta = PageMetadata::decode(Variant::BigBlock, &spare, LbaForm::Canonical)?;
    assert!(meta.bad_block);
    Ok(())
}

#[test]
fn test_fields_survive_every_layout() -> anyhow::Result<()> {
    for variant in [Variant::SmallBlock, Variant::BigOnSmall, Variant::BigBlock] {
        let fields = known_fields();
        let spare = fields.encode(variant)?;
        assert_eq!(spare.len(), 16);
        assert_eq!(
            PageMetadata::decode(variant, &spare, LbaForm::Canonical)?,
            fields,
            "{variant:?}"
        );
    }
    Ok(())
}

#[test]
fn test_emmc_has_no_spare() {
    assert!(matches!(
        PageMetadata::decode(Variant::EmmcMapped, &[0xFF; 16], LbaForm::Canonical),
        Err(Error::UnsupportedGeometry(_))
    ));
}

#[test]
fn test_short_spare_is_an_error() {
    assert!(matches!(
        SpareRecord::decode(Variant::SmallBlock, &[0xFF; 8], LbaForm::Canonical),
        Err(Error::Decode(_))
    ));
}

#[test]
fn test_anchor_fields() -> anyhow::Result<()> {
    let mut buf = vec![0u8; 0x200];
    let mut anchor = Anchor {
        version: 0x0102_0304,
        ..Default::default()
    };
    anchor.mobiles[0] = AnchorRecord {
        block: 0x0123,
        size_blocks: 1,
    };
    anchor.mobiles[1] = AnchorRecord {
        block: 0x0456,
        size_blocks: 3,
    };
    anchor.encode(&mut buf)?;

    assert_eq!(buf[MMC_ANCHOR_VERSION_POS..][..4], [1, 2, 3, 4]);
    assert_eq!(anchor_version(&buf), Some(0x0102_0304));
    assert_eq!(anchor_mobile_block(&buf, 0x31), Some(0x0456));
    assert_eq!(anchor_mobile_size(&buf, 0x31), Some(3));
    assert_eq!(anchor_mobile_block(&buf, 0x3E), Some(0));
    assert_eq!(anchor_mobile_block(&buf, 0x3F), None);
    assert_eq!(Anchor::decode(&buf), Some(anchor));

    assert_eq!(anchor_version(&buf[..0x10]), None);
    Ok(())
}
