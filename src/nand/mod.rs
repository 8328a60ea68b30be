//! Abstractions and code to access the raw flash behind the Xenon controller

use std::io::{Read, Write};

use anyhow::{ensure, Context};

use crate::geometry::GeometryProfile;
use crate::xenonfs::{ecc, meta::PageMetadata};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// Block-level read access to a flash part, live or dumped
pub trait Flash {
    /// Get the geometry of the part
    fn geometry(&self) -> &GeometryProfile;

    /// Read one physical block, returning its user data and its spare data separately.
    ///
    /// The user data is `block_size` bytes and the spare data `meta_size * pages_per_block` bytes
    /// (empty on eMMC). Bad blocks are read like any other; their spare data says they are bad.
    fn read_block_separate(&mut self, block: u32) -> anyhow::Result<(Vec<u8>, Vec<u8>)>;

    /// Read a byte range of the directly addressable region. Only eMMC parts have one.
    fn read_mapped_region(&mut self, offset: u32, len: usize) -> anyhow::Result<Vec<u8>>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    fn geometry(&self) -> &GeometryProfile {
        (**self).geometry()
    }

    fn read_block_separate(&mut self, block: u32) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        (**self).read_block_separate(block)
    }

    fn read_mapped_region(&mut self, offset: u32, len: usize) -> anyhow::Result<Vec<u8>> {
        (**self).read_mapped_region(offset, len)
    }
}

/// Split a raw block (user and spare bytes interleaved page by page) into its two parts
pub fn split_block(geometry: &GeometryProfile, raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    if geometry.is_emmc() {
        return (raw.to_vec(), Vec::new());
    }

    let mut user = Vec::with_capacity(geometry.block_size);
    let mut spare = Vec::with_capacity(geometry.spare_size());
    for page in raw.chunks(geometry.page_size_phys) {
        let (page_user, page_spare) = page.split_at(geometry.page_size.min(page.len()));
        user.extend_from_slice(page_user);
        spare.extend_from_slice(page_spare);
    }

    (user, spare)
}

/// A raw flash dump held in memory.
///
/// The dump is stored exactly as the controller reads it: each page's user bytes followed by its
/// spare bytes. Untouched areas read as erased, so a fresh `DumpImage` is a blank part onto which
/// test images can be programmed.
#[derive(Debug, Clone)]
pub struct DumpImage {
    blocks: Box<[DumpBlock]>,
    geometry: GeometryProfile,
}

/// A block of DumpImage
#[derive(Debug, Clone, Default)]
struct DumpBlock {
    /// Leading bytes of the raw block; anything past the end is erased
    data: Vec<u8>,
}

impl DumpBlock {
    fn write(&mut self, offset: usize, content: &[u8]) {
        let end = offset + content.len();
        if self.data.len() < end {
            self.data.resize(end, 0xFF);
        }
        self.data[offset..end].copy_from_slice(content);
    }

    fn read(&self, offset: usize, content: &mut [u8]) {
        content.fill(0xFF);
        if let Some(data) = self.data.get(offset..) {
            let n = data.len().min(content.len());
            content[..n].copy_from_slice(&data[..n]);
        }
    }
}

impl DumpImage {
    /// Create an erased image of the given geometry
    pub fn new(geometry: GeometryProfile) -> Self {
        let blocks = vec![DumpBlock::default(); geometry.total_blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, geometry }
    }

    /// Initialize the image contents from a type implementing `Read`, such as a dump file.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.geometry.block_size_phys];

        for (index, block) in self.blocks.iter_mut().enumerate() {
            read.read_exact(&mut buf)
                .with_context(|| format!("dump ends before block {index:#x}"))?;

            block.data.clear();
            if !buf.is_erased() {
                block.data.extend_from_slice(&buf);
            }
        }

        Ok(())
    }

    /// Write the whole raw image out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.geometry.block_size_phys];

        for block in self.blocks.iter() {
            block.read(0, &mut buf);
            write.write_all(&buf)?;
        }

        Ok(())
    }

    fn block_mut(&mut self, index: u32) -> anyhow::Result<&mut DumpBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index:#x} out of range"))
    }

    /// Program one page's user and spare bytes. Short content is padded with 0xFF.
    pub fn program_page(
        &mut self,
        block: u32,
        page: u32,
        user: &[u8],
        spare: &[u8],
    ) -> anyhow::Result<()> {
        let geometry = self.geometry;
        ensure!(page < geometry.pages_per_block, "page index out of bounds");
        ensure!(user.len() <= geometry.page_size, "user data larger than a page");
        ensure!(spare.len() <= geometry.meta_size, "spare data larger than the spare area");

        let begin = page as usize * geometry.page_size_phys;
        let mut buf = vec![0xFF; geometry.page_size_phys];
        buf[..user.len()].copy_from_slice(user);
        buf[geometry.page_size..][..spare.len()].copy_from_slice(spare);

        self.block_mut(block)?.write(begin, &buf);
        Ok(())
    }

    /// Program a whole block: `user` (padded with 0xFF) plus the same spare metadata on every
    /// page, each page with its own EDC. On eMMC only the user data is written.
    pub fn program_block(
        &mut self,
        block: u32,
        user: &[u8],
        meta: &PageMetadata,
    ) -> anyhow::Result<()> {
        let geometry = self.geometry;
        ensure!(user.len() <= geometry.block_size, "user data larger than a block");

        if geometry.is_emmc() {
            return self.write_mapped(block * geometry.block_size as u32, user);
        }

        let template = meta.encode(geometry.variant)?;
        let mut page_buf = vec![0xFF; geometry.page_size];
        for page in 0..geometry.pages_per_block {
            let start = page as usize * geometry.page_size;
            let chunk = user.get(start..).unwrap_or_default();
            let n = chunk.len().min(geometry.page_size);
            page_buf.fill(0xFF);
            page_buf[..n].copy_from_slice(&chunk[..n]);

            let mut spare = template.clone();
            ecc::fill(&page_buf, &mut spare);
            self.program_page(block, page, &page_buf, &spare)?;
        }

        Ok(())
    }

    /// Write bytes at an offset of the directly addressable region (eMMC only)
    pub fn write_mapped(&mut self, offset: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(self.geometry.is_emmc(), "only eMMC parts have a mapped region");

        let block_size = self.geometry.block_size;
        let mut offset = offset as usize;
        let mut content = content;
        while !content.is_empty() {
            let in_block = offset % block_size;
            let n = content.len().min(block_size - in_block);
            self.block_mut((offset / block_size) as u32)?
                .write(in_block, &content[..n]);

            offset += n;
            content = &content[n..];
        }

        Ok(())
    }
}

impl Flash for DumpImage {
    fn geometry(&self) -> &GeometryProfile {
        &self.geometry
    }

    fn read_block_separate(&mut self, block: u32) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        let mut raw = vec![0; self.geometry.block_size_phys];
        self.block_mut(block)?.read(0, &mut raw);

        Ok(split_block(&self.geometry, &raw))
    }

    fn read_mapped_region(&mut self, offset: u32, len: usize) -> anyhow::Result<Vec<u8>> {
        ensure!(self.geometry.is_emmc(), "only eMMC parts have a mapped region");

        let block_size = self.geometry.block_size;
        let mut out = vec![0; len];
        let mut offset = offset as usize;
        let mut rest = out.as_mut_slice();
        while !rest.is_empty() {
            let in_block = offset % block_size;
            let n = rest.len().min(block_size - in_block);
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(n);
            self.block_mut((offset / block_size) as u32)?
                .read(in_block, head);

            offset += n;
            rest = tail;
        }

        Ok(out)
    }
}

#[cfg(test)]
use crate::geometry::Profile;

#[test]
fn test_dump_blank() -> anyhow::Result<()> {
    let mut dump = DumpImage::new(Profile::SmallBlock16M.geometry());
    let (user, spare) = dump.read_block_separate(0)?;
    assert_eq!(user.len(), 0x4000);
    assert_eq!(spare.len(), 32 * 16);
    assert!(user.is_erased() && spare.is_erased());

    let last = dump.geometry().total_blocks - 1;
    assert!(dump.read_block_separate(last).is_ok());
    assert!(dump.read_block_separate(last + 1).is_err());
    Ok(())
}

#[test]
fn test_dump_program_page() -> anyhow::Result<()> {
    let mut dump = DumpImage::new(Profile::SmallBlock16M.geometry());
    dump.program_page(3, 2, &[0xA5; 0x200], &[0x11; 4])?;
    assert!(dump.program_page(3, 32, &[], &[]).is_err());
    assert!(dump.program_page(3, 0, &[0; 0x201], &[]).is_err());

    let (user, spare) = dump.read_block_separate(3)?;
    assert!(user[..0x400].is_erased());
    assert!(user[0x400..0x600].iter().all(|&x| x == 0xA5));
    assert!(user[0x600..].is_erased());
    assert_eq!(spare[0x20..0x24], [0x11; 4]);
    assert!(spare[0x24..].is_erased());
    Ok(())
}

#[test]
fn test_dump_save_load() -> anyhow::Result<()> {
    let geometry = Profile::SmallBlock16M.geometry();
    let mut dump = DumpImage::new(geometry);
    dump.program_page(1, 0, &[0x55; 0x200], &[0x00; 16])?;

    let mut raw = Vec::new();
    dump.save(&mut raw)?;
    assert_eq!(raw.len() as u64, geometry.total_dump_size);
    assert!(raw[0x4200..0x4400].iter().all(|&x| x == 0x55));
    assert!(raw[0x4400..0x4410].iter().all(|&x| x == 0x00));

    let mut loaded = DumpImage::new(geometry);
    loaded.load(&mut raw.as_slice())?;
    assert_eq!(loaded.read_block_separate(1)?, dump.read_block_separate(1)?);

    // A short dump is rejected
    assert!(loaded.load(&mut &raw[..0x4200]).is_err());
    Ok(())
}

#[test]
fn test_dump_mapped_region() -> anyhow::Result<()> {
    let mut dump = DumpImage::new(Profile::Emmc.geometry());
    let payload: Vec<u8> = (0..0x5000).map(|x| x as u8).collect();
    dump.write_mapped(0x3F00, &payload)?;

    assert_eq!(dump.read_mapped_region(0x3F00, payload.len())?, payload);
    assert!(dump.read_mapped_region(0x3E00, 0x100)?.is_erased());

    let (user, spare) = dump.read_block_separate(1)?;
    assert!(spare.is_empty());
    assert_eq!(user[..0x100], payload[0x100..0x200]);

    let mut nand = DumpImage::new(Profile::SmallBlock16M.geometry());
    assert!(nand.read_mapped_region(0, 0x10).is_err());
    Ok(())
}

#[test]
fn test_dump_program_block() -> anyhow::Result<()> {
    use crate::xenonfs::meta::LbaForm;

    let geometry = Profile::SmallBlock16M.geometry();
    let mut dump = DumpImage::new(geometry);
    let meta = PageMetadata {
        lba: 0x42,
        block_type: 0x31,
        sequence: 7,
        ..Default::default()
    };
    dump.program_block(9, &[0x3C; 0x300], &meta)?;

    let (user, spare) = dump.read_block_separate(9)?;
    assert!(user[..0x300].iter().all(|&x| x == 0x3C));
    assert!(user[0x300..].is_erased());

    for (page_user, page_spare) in user.chunks(0x200).zip(spare.chunks(0x10)) {
        assert!(ecc::verify(page_user, page_spare));
        let decoded = PageMetadata::decode(geometry.variant, page_spare, LbaForm::Canonical)?;
        assert_eq!((decoded.lba, decoded.block_type), (0x42, 0x31));
    }
    Ok(())
}
