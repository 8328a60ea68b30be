//! Flash access over the Linux MTD subsystem

use super::Flash;
use crate::geometry::GeometryProfile;

use anyhow::{bail, ensure, Context};
use log::debug;

use std::fs::File;
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Read-only flash that wraps an open /dev/mtdX file.
///
/// eMMC parts show up as ordinary block devices rather than MTD devices; those are opened as
/// plain files and read without any ioctls.
#[derive(Debug)]
pub struct MtdFlash {
    file: File,
    geometry: GeometryProfile,
}

impl MtdFlash {
    /// Open a device by path (e.g. "/dev/mtd0"), checking that it matches `geometry`
    pub fn open<P: AsRef<Path>>(path: P, geometry: GeometryProfile) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

        if !geometry.is_emmc() {
            let info = unsafe {
                let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
                ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
                info.assume_init()
            };
            info.check(&geometry)?;
            debug!(
                "{}: {:#x} bytes, erase size {:#x}, oob size {:#x}",
                path.display(),
                info.size,
                info.erasesize,
                info.oobsize
            );
        }

        Ok(Self { file, geometry })
    }

    /// Read the spare bytes of one page
    fn read_oob(&self, page: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut oob = ioctl::mtd_oob_buf {
            start: page * self.geometry.page_size as u32,
            length: buf.len() as u32,
            ptr: buf.as_mut_ptr(),
        };
        unsafe {
            ioctl::memreadoob(self.file.as_raw_fd(), &mut oob)?;
        }
        ensure!(
            oob.length as usize == buf.len(),
            "short OOB read on page {page:#x}"
        );
        Ok(())
    }
}

impl Flash for MtdFlash {
    fn geometry(&self) -> &GeometryProfile {
        &self.geometry
    }

    fn read_block_separate(&mut self, block: u32) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        ensure!(
            block < self.geometry.total_blocks,
            "block {block:#x} out of range"
        );

        let mut user = vec![0; self.geometry.block_size];
        let offset = u64::from(block) * self.geometry.block_size as u64;
        self.file.read_exact_at(&mut user, offset)?;

        let mut spare = vec![0; self.geometry.spare_size()];
        if self.geometry.meta_size > 0 {
            let first_page = block * self.geometry.pages_per_block;
            for (page, chunk) in (first_page..).zip(spare.chunks_mut(self.geometry.meta_size)) {
                self.read_oob(page, chunk)?;
            }
        }

        Ok((user, spare))
    }

    fn read_mapped_region(&mut self, offset: u32, len: usize) -> anyhow::Result<Vec<u8>> {
        if !self.geometry.is_emmc() {
            bail!("only eMMC parts have a mapped region");
        }

        let mut buf = vec![0; len];
        self.file.read_exact_at(&mut buf, offset.into())?;
        Ok(buf)
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use crate::geometry::GeometryProfile;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl mtd_info_user {
        /// Does the device look like the part described by `geometry`?
        pub fn check(&self, geometry: &GeometryProfile) -> anyhow::Result<()> {
            ensure!(
                self.writesize as usize == geometry.page_size,
                "MTD page size {:#x} does not match {:#x}",
                self.writesize,
                geometry.page_size
            );
            ensure!(
                self.erasesize as usize == geometry.block_size,
                "MTD erase size {:#x} does not match {:#x}",
                self.erasesize,
                geometry.block_size
            );
            ensure!(
                self.oobsize as usize >= geometry.meta_size,
                "MTD OOB size {:#x} too small",
                self.oobsize
            );
            ensure!(
                self.size / self.erasesize >= geometry.total_blocks,
                "MTD device holds only {:#x} blocks",
                self.size / self.erasesize
            );
            Ok(())
        }
    }

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);
}
