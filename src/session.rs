//! A decoding session: everything recovered from one flash part, built once when it is opened.

use log::{debug, info};

use crate::geometry::GeometryProfile;
use crate::nand::Flash;
use crate::xenonfs::extract::{verify_pages, ExtractedFile, FileExtractor};
use crate::xenonfs::fsroot::{FsEntry, FsRoot, FSROOT_BLOCK_LEN};
use crate::xenonfs::lba::{LbaMap, LbaMapBuilder};
use crate::xenonfs::meta::LbaForm;
use crate::xenonfs::scan::{scan_anchor, scan_surface, Containers, VersionedScanner};
use crate::xenonfs::{Error, Report, Result};

/// Knobs for decoding an image
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct SessionOptions {
    /// Logical block address formula for BigOnSmall parts
    pub lba_form: LbaForm,

    /// Cluster index at which the filesystem starts
    pub fs_start_offset: u16,

    /// Check the EDC of every page read
    pub verify_ecc: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            lba_form: LbaForm::Canonical,
            fs_start_offset: 0,
            verify_ecc: true,
        }
    }
}

impl SessionOptions {
    pub fn lba_form(mut self, form: LbaForm) -> Self {
        self.lba_form = form;
        self
    }

    pub fn fs_start_offset(mut self, offset: u16) -> Self {
        self.fs_start_offset = offset;
        self
    }

    pub fn verify_ecc(mut self, verify: bool) -> Self {
        self.verify_ecc = verify;
        self
    }
}

/// An opened flash part with its LBA map, containers and FSRoot
#[derive(Debug)]
pub struct DecodingSession<F> {
    flash: F,
    geometry: GeometryProfile,
    options: SessionOptions,
    lba: LbaMap,
    containers: Containers,
    fsroot: FsRoot,
    report: Report,
}

impl<F: Flash> DecodingSession<F> {
    /// Scan a flash part and decode its FSRoot.
    ///
    /// On NAND this reads the spare data of every block once, building the LBA map and looking
    /// for containers in the same pass. Fails if no FSRoot can be found.
    pub fn open(mut flash: F, options: SessionOptions) -> Result<Self> {
        let geometry = *flash.geometry();
        let mut report = Report::default();

        let (lba, containers) = if geometry.is_emmc() {
            let containers = scan_anchor(&mut flash, &mut report)?;
            (LbaMap::identity(&geometry), containers)
        } else {
            let mut builder = LbaMapBuilder::new(&geometry, options.lba_form);
            let mut scanner = VersionedScanner::new(&geometry, options.lba_form);

            scan_surface(&mut flash, |block, spare| {
                builder.record(block, spare, &mut report)?;
                scanner.observe(block, spare)
            })?;

            let containers = scanner.finish(&mut report)?;
            (builder.finish(), containers)
        };
        debug!("LBA map: {}/{} slots mapped", lba.mapped_count(), lba.len());

        let block = containers.fsroot.block;
        let (user, spare) = flash
            .read_block_separate(block)
            .map_err(|source| Error::Io { block, source })?;
        if options.verify_ecc && !geometry.is_emmc() {
            report.extend(verify_pages(&geometry, block, &user, &spare, 0..FSROOT_BLOCK_LEN));
        }
        let fsroot = FsRoot::decode(&user)?;
        info!("FSRoot holds {} entries", fsroot.entries().len());

        Ok(Self {
            flash,
            geometry,
            options,
            lba,
            containers,
            fsroot,
            report,
        })
    }

    pub fn geometry(&self) -> &GeometryProfile {
        &self.geometry
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn lba_map(&self) -> &LbaMap {
        &self.lba
    }

    pub fn containers(&self) -> &Containers {
        &self.containers
    }

    pub fn fsroot(&self) -> &FsRoot {
        &self.fsroot
    }

    /// Every issue found so far
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Every directory entry, deleted ones included
    pub fn list_files(&self) -> Vec<FsEntry> {
        self.fsroot.entries().to_vec()
    }

    /// Recover a file. Its issues are added to the session report as well.
    pub fn extract_file(&mut self, entry: &FsEntry) -> Result<ExtractedFile> {
        let file = FileExtractor::new(&self.geometry, &self.lba, &self.fsroot)
            .fs_start_offset(self.options.fs_start_offset)
            .verify_ecc(self.options.verify_ecc)
            .extract(&mut self.flash, entry)?;

        self.report.extend(file.issues.iter().cloned());
        Ok(file)
    }

    /// Read the current copy of a Mobile container, or None if the image has none
    pub fn read_mobile(&mut self, id: u8) -> Result<Option<Vec<u8>>> {
        let Some(mobile) = self.containers.mobile(id).copied() else {
            return Ok(None);
        };
        let block = mobile.block;
        let size = mobile.size as usize;

        if self.geometry.is_emmc() {
            let offset = block * self.geometry.block_size as u32;
            let data = self
                .flash
                .read_mapped_region(offset, size)
                .map_err(|source| Error::Io { block, source })?;
            return Ok(Some(data));
        }

        let (user, spare) = self
            .flash
            .read_block_separate(block)
            .map_err(|source| Error::Io { block, source })?;

        let start = mobile.page as usize * self.geometry.page_size;
        let end = start + size;
        if self.options.verify_ecc {
            self.report
                .extend(verify_pages(&self.geometry, block, &user, &spare, start..end));
        }

        user.get(start..end)
            .map(|x| Some(x.to_vec()))
            .ok_or(Error::Truncated {
                what: "mobile block",
                len: user.len(),
                need: end,
            })
    }

    /// Give back the flash part
    pub fn into_inner(self) -> F {
        self.flash
    }
}

#[test]
fn test_options_builder() {
    let options = SessionOptions::default();
    assert_eq!(options.lba_form, LbaForm::Canonical);
    assert!(options.verify_ecc);

    let options = options
        .lba_form(LbaForm::Legacy)
        .fs_start_offset(0x20)
        .verify_ecc(false);
    assert_eq!(
        options,
        SessionOptions {
            lba_form: LbaForm::Legacy,
            fs_start_offset: 0x20,
            verify_ecc: false,
        }
    );
}

#[test]
fn test_open_blank_image() {
    use crate::{geometry::Profile, nand::DumpImage};

    let dump = DumpImage::new(Profile::SmallBlock16M.geometry());
    assert!(matches!(
        DecodingSession::open(dump, SessionOptions::default()),
        Err(Error::NoFsRootFound)
    ));
}
