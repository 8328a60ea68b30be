//! Reassembly of file contents by following the FSRoot cluster chain.

use std::collections::HashSet;
use std::ops::Range;

use super::fsroot::{FsEntry, FsRoot, CHAIN_END};
use super::lba::LbaMap;
use super::{ecc, ChainFault, Error, Issue, Result};
use crate::geometry::GeometryProfile;
use crate::nand::{Flash, PageUtil};

/// One cluster of a file and how many of its bytes belong to the file
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct ChainLink {
    pub cluster: u16,
    pub len: usize,
}

/// The clusters of a file, in order
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct ChainWalk {
    pub links: Vec<ChainLink>,

    /// Set when the chain ended before the file size was covered: the sentinel cluster reached,
    /// and the number of bytes left unaccounted for
    pub truncated: Option<(u16, u32)>,
}

/// Follow a file's chain through the table, `unit` bytes per cluster.
///
/// Every hop consumes up to `unit` bytes of the file size, so the walk ends after at most
/// `size / unit + 1` hops. A chain that loops back or leaves the table before that is rejected.
pub fn walk_chain(root: &FsRoot, entry: &FsEntry, unit: usize) -> Result<ChainWalk> {
    let mut remaining = entry.size as usize;
    let mut visited = HashSet::new();
    let mut walk = ChainWalk::default();

    let mut cluster = entry.start_cluster;
    while remaining > 0 {
        if cluster >= CHAIN_END {
            walk.truncated = Some((cluster, remaining as u32));
            break;
        }

        let fault = if !visited.insert(cluster) {
            Some(ChainFault::Cycle)
        } else if cluster as usize >= root.chain_len() {
            Some(ChainFault::OutOfTable)
        } else {
            None
        };
        if let Some(fault) = fault {
            return Err(Error::CorruptChain { cluster, fault });
        }

        let len = remaining.min(unit);
        walk.links.push(ChainLink { cluster, len });
        remaining -= len;

        if remaining > 0 {
            cluster = root.next_cluster(cluster).ok_or(Error::CorruptChain {
                cluster,
                fault: ChainFault::OutOfTable,
            })?;
        }
    }

    Ok(walk)
}

/// Where one piece of an extracted file came from
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Segment {
    pub cluster: u16,
    pub block: u32,
    /// Byte offset within the block's user data
    pub offset: usize,
    pub len: usize,
}

/// The recovered contents of one file
#[derive(Debug, Default, Clone)]
pub struct ExtractedFile {
    pub data: Vec<u8>,
    pub segments: Vec<Segment>,
    pub issues: Vec<Issue>,
}

impl ExtractedFile {
    /// Did every byte of the file get recovered?
    pub fn is_complete(&self) -> bool {
        !self.issues.iter().any(|x| {
            matches!(
                x,
                Issue::TruncatedChain { .. } | Issue::UnmappedCluster { .. }
            )
        })
    }
}

/// Reads files out of a flash part, given its LBA map and FSRoot
#[derive(Debug)]
pub struct FileExtractor<'a> {
    geometry: &'a GeometryProfile,
    lba: &'a LbaMap,
    root: &'a FsRoot,
    fs_start_offset: u16,
    verify_ecc: bool,
}

impl<'a> FileExtractor<'a> {
    pub fn new(geometry: &'a GeometryProfile, lba: &'a LbaMap, root: &'a FsRoot) -> Self {
        Self {
            geometry,
            lba,
            root,
            fs_start_offset: 0,
            verify_ecc: true,
        }
    }

    /// Cluster index of the start of the filesystem
    pub fn fs_start_offset(mut self, offset: u16) -> Self {
        self.fs_start_offset = offset;
        self
    }

    /// Check every page read against its EDC (NAND only)
    pub fn verify_ecc(mut self, verify: bool) -> Self {
        self.verify_ecc = verify;
        self
    }

    /// Recover the contents of `entry`.
    ///
    /// Damage that only affects part of the file is recorded in the result's issues and as much
    /// data as possible is returned; only a corrupt chain or a failed read is an error.
    pub fn extract<F: Flash>(&self, flash: &mut F, entry: &FsEntry) -> Result<ExtractedFile> {
        let walk = walk_chain(self.root, entry, self.lba.cluster_size())?;
        let mut file = ExtractedFile::default();
        let mut cached: Option<(u32, Vec<u8>, Vec<u8>)> = None;

        for link in &walk.links {
            let Some(location) = self.lba.locate(link.cluster, self.fs_start_offset) else {
                file.issues.push(Issue::UnmappedCluster {
                    file: entry.name(),
                    cluster: link.cluster,
                });
                return Ok(file);
            };

            let block = location.block;
            let (user, spare) = match cached.take() {
                Some(x) if x.0 == block => (x.1, x.2),
                _ => flash
                    .read_block_separate(block)
                    .map_err(|source| Error::Io { block, source })?,
            };

            let end = location.offset + link.len;
            let data = user.get(location.offset..end).ok_or(Error::Truncated {
                what: "block data",
                len: user.len(),
                need: end,
            })?;
            file.data.extend_from_slice(data);

            if self.verify_ecc && !self.geometry.is_emmc() {
                let range = location.offset..end;
                file.issues.extend(verify_pages(self.geometry, block, &user, &spare, range));
            }

            file.segments.push(Segment {
                cluster: link.cluster,
                block,
                offset: location.offset,
                len: link.len,
            });
            cached = Some((block, user, spare));
        }

        if let Some((cluster, missing)) = walk.truncated {
            file.issues.push(Issue::TruncatedChain {
                file: entry.name(),
                cluster,
                missing,
            });
        }

        Ok(file)
    }
}

/// Check the EDC of every page of a block overlapping the byte range `range` of its user data.
///
/// Fully erased pages carry no code and are skipped.
pub fn verify_pages(
    geometry: &GeometryProfile,
    block: u32,
    user: &[u8],
    spare: &[u8],
    range: Range<usize>,
) -> Vec<Issue> {
    let page_size = geometry.page_size;
    let meta_size = geometry.meta_size;
    let mut issues = Vec::new();

    for page in range.start / page_size..range.end.div_ceil(page_size) {
        let page_user = user.get(page * page_size..(page + 1) * page_size);
        let page_spare = spare.get(page * meta_size..(page + 1) * meta_size);
        let (Some(page_user), Some(page_spare)) = (page_user, page_spare) else {
            continue;
        };

        if page_user.is_erased() && page_spare.is_erased() {
            continue;
        }

        if !ecc::verify(page_user, page_spare) {
            issues.push(Issue::EccMismatch {
                block,
                page: page as u32,
            });
        }
    }

    issues
}

#[cfg(test)]
use super::fsroot::FsTimestamp;

#[cfg(test)]
fn chained_root(links: &[(u16, u16)]) -> anyhow::Result<FsRoot> {
    let mut root = FsRoot::new();
    for &(cluster, next) in links {
        root.set_next(cluster, next)?;
    }
    Ok(root)
}

#[test]
fn test_chain_two_and_a_half_blocks() -> anyhow::Result<()> {
    let unit = 0x4000;
    let root = chained_root(&[(0x10, 0x11), (0x11, 0x20), (0x20, 0x1FFF)])?;
    let entry = FsEntry::new("file", 0x10, 0xA000, FsTimestamp::default());

    let walk = walk_chain(&root, &entry, unit)?;
    assert_eq!(
        walk.links,
        [
            ChainLink {
                cluster: 0x10,
                len: unit
            },
            ChainLink {
                cluster: 0x11,
                len: unit
            },
            ChainLink {
                cluster: 0x20,
                len: unit / 2
            },
        ]
    );
    assert_eq!(walk.truncated, None);
    Ok(())
}

#[test]
fn test_chain_stops_at_file_size() -> anyhow::Result<()> {
    // The table links on past the file's last cluster, and even loops there
    let root = chained_root(&[(0x10, 0x11), (0x11, 0x12), (0x12, 0x10)])?;
    let entry = FsEntry::new("short", 0x10, 0x4001, FsTimestamp::default());

    let walk = walk_chain(&root, &entry, 0x4000)?;
    let clusters: Vec<_> = walk.links.iter().map(|x| (x.cluster, x.len)).collect();
    assert_eq!(clusters, [(0x10, 0x4000), (0x11, 1)]);
    assert_eq!(walk.truncated, None);
    Ok(())
}

#[test]
fn test_chain_cycle() -> anyhow::Result<()> {
    let root = chained_root(&[(0x10, 0x11), (0x11, 0x10)])?;
    let entry = FsEntry::new("loop", 0x10, 0x4000 * 10, FsTimestamp::default());

    let err = walk_chain(&root, &entry, 0x4000).unwrap_err();
    assert!(matches!(
        err,
        Error::CorruptChain {
            cluster: 0x10,
            fault: ChainFault::Cycle
        }
    ));

    // A cluster linking to itself
    let root = chained_root(&[(0x30, 0x30)])?;
    let entry = FsEntry::new("self", 0x30, 0x8000, FsTimestamp::default());
    assert!(matches!(
        walk_chain(&root, &entry, 0x4000),
        Err(Error::CorruptChain { .. })
    ));
    Ok(())
}

#[test]
fn test_chain_leaves_table() -> anyhow::Result<()> {
    let root = chained_root(&[(0x10, 0x1800)])?;
    let entry = FsEntry::new("wild", 0x10, 0x8000, FsTimestamp::default());
    assert!(matches!(
        walk_chain(&root, &entry, 0x4000),
        Err(Error::CorruptChain {
            cluster: 0x1800,
            fault: ChainFault::OutOfTable
        })
    ));
    Ok(())
}

#[test]
fn test_chain_truncated() -> anyhow::Result<()> {
    let root = chained_root(&[(0x10, 0x1FFE)])?;
    let entry = FsEntry::new("short", 0x10, 0x5000, FsTimestamp::default());

    let walk = walk_chain(&root, &entry, 0x4000)?;
    assert_eq!(walk.links.len(), 1);
    assert_eq!(walk.truncated, Some((0x1FFE, 0x1000)));

    // An empty file has no clusters at all
    let entry = FsEntry::new("empty", 0x1FFF, 0, FsTimestamp::default());
    assert_eq!(walk_chain(&root, &entry, 0x4000)?, ChainWalk::default());
    Ok(())
}

#[test]
fn test_extract_with_ecc() -> anyhow::Result<()> {
    use super::lba::build_lba_map;
    use super::meta::{LbaForm, PageMetadata};
    use super::Report;
    use crate::{geometry::Profile, nand::DumpImage};

    let geometry = Profile::SmallBlock16M.geometry();
    let mut dump = DumpImage::new(geometry);
    let payload: Vec<u8> = (0..0x4000).map(|x| (x / 3) as u8).collect();
    let meta = PageMetadata {
        lba: 0x40,
        block_type: 0x01,
        ..Default::default()
    };
    dump.program_block(9, &payload, &meta)?;

    let mut report = Report::default();
    let lba = build_lba_map(&mut dump, LbaForm::Canonical, &mut report)?;
    let root = chained_root(&[(0x40, 0x1FFF)])?;
    let entry = FsEntry::new("config.bin", 0x40, 0x300, FsTimestamp::default());

    let extractor = FileExtractor::new(&geometry, &lba, &root);
    let file = extractor.extract(&mut dump, &entry)?;
    assert_eq!(file.data, payload[..0x300]);
    assert_eq!(
        file.segments,
        [Segment {
            cluster: 0x40,
            block: 9,
            offset: 0,
            len: 0x300
        }]
    );
    assert!(file.issues.is_empty());

    // Damage page 1 without touching its spare data
    let (user, spare) = dump.read_block_separate(9)?;
    let mut page = user[0x200..0x400].to_vec();
    page[5] ^= 0x40;
    dump.program_page(9, 1, &page, &spare[0x10..0x20])?;

    let file = extractor.extract(&mut dump, &entry)?;
    assert_eq!(file.data[0x205], payload[0x205] ^ 0x40);
    assert_eq!(file.issues, [Issue::EccMismatch { block: 9, page: 1 }]);
    assert!(file.is_complete());

    let file = extractor.verify_ecc(false).extract(&mut dump, &entry)?;
    assert!(file.issues.is_empty());

    // Nothing carries this cluster's address
    let entry = FsEntry::new("lost", 0x41, 0x10, FsTimestamp::default());
    let file = FileExtractor::new(&geometry, &lba, &root).extract(&mut dump, &entry)?;
    assert!(file.data.is_empty());
    assert!(!file.is_complete());
    Ok(())
}
