// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel and initramfs extraction from a bootable disk image.
//!
//! The image carries a GPT whose first partition is a FAT boot partition
//! with a syslinux layout: `/syslinux/syslinux.cfg` names a default label,
//! and `/<label>/vmlinuz` and `/<label>/initramfs.xz` hold the boot assets.
//! The kernel is a bzImage and is decompressed on the way out so it can be
//! handed to a hypervisor directly.

pub mod bzimage;
pub mod gpt;
mod section;

pub use section::SectionReader;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use fatfs::{FileSystem, FsOptions};
use regex::Regex;
use tempfile::{NamedTempFile, TempPath};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error reading disk image")]
    Io(#[source] io::Error),

    #[error("invalid partition table: {0}")]
    Gpt(String),

    #[error("boot partition not found")]
    NoBootPartition,

    #[error("boot partition is not a FAT filesystem")]
    NotFat,

    #[error("failed to read {path} from boot partition")]
    Fat {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("no DEFAULT entry in syslinux.cfg")]
    NoDefaultLabel,

    #[error("no compressed payload found in kernel image")]
    NoKernelPayload,

    #[error("failed to decompress kernel")]
    Decompress(#[source] io::Error),
}

const BOOT_PARTITION: usize = 1;
const SYSLINUX_CFG: &str = "syslinux/syslinux.cfg";

/// Extracted boot assets. The files are removed by [`BootFiles::close`] or
/// when dropped.
#[derive(Debug)]
pub struct BootFiles {
    kernel: TempPath,
    initramfs: TempPath,
}

impl BootFiles {
    pub fn kernel_path(&self) -> &Path {
        &self.kernel
    }

    pub fn initramfs_path(&self) -> &Path {
        &self.initramfs
    }

    pub fn close(self) -> io::Result<()> {
        self.kernel.close()?;
        self.initramfs.close()
    }
}

/// The label named by the `DEFAULT` line of a syslinux config.
pub fn default_label(cfg: &str) -> Option<String> {
    let re = Regex::new(r"(?mi)^\s*DEFAULT\s+(\S+)").ok()?;
    re.captures(cfg).map(|c| c[1].to_string())
}

fn check_fat_signature<R: Read + Seek>(part: &mut R) -> Result<(), Error> {
    let mut boot = [0u8; 512];
    part.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
    part.read_exact(&mut boot).map_err(|_| Error::NotFat)?;
    if boot[510..512] != [0x55, 0xaa] {
        return Err(Error::NotFat);
    }
    // FAT12/16 keep the type string at 54, FAT32 at 82.
    if &boot[54..57] != b"FAT" && &boot[82..87] != b"FAT32" {
        return Err(Error::NotFat);
    }
    part.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
    Ok(())
}

/// Extract the default kernel (decompressed) and initramfs from the disk
/// image at `image` into temporary files.
pub fn extract(image: &Path) -> Result<BootFiles, Error> {
    let mut disk = File::open(image).map_err(Error::Io)?;
    extract_from(&mut disk)
}

pub fn extract_from<R: Read + Seek>(disk: &mut R) -> Result<BootFiles, Error> {
    let table = gpt::Table::read(disk)?;
    let (start, len) =
        table.partition(BOOT_PARTITION).ok_or(Error::NoBootPartition)?.extent();

    let mut part = SectionReader::new(disk, start, len);
    check_fat_signature(&mut part)?;
    let fs = FileSystem::new(part, FsOptions::new()).map_err(|_| Error::NotFat)?;
    let root = fs.root_dir();

    let fat_err = |path: &str| {
        let path = path.to_string();
        move |source: io::Error| Error::Fat { path, source }
    };

    let mut cfg = String::new();
    root.open_file(SYSLINUX_CFG)
        .and_then(|mut f| f.read_to_string(&mut cfg))
        .map_err(fat_err(SYSLINUX_CFG))?;
    let label = default_label(&cfg).ok_or(Error::NoDefaultLabel)?;

    let kernel_name = format!("{label}/vmlinuz");
    let vmlinuz =
        root.open_file(&kernel_name).map_err(fat_err(&kernel_name))?;
    let mut kernel = NamedTempFile::new().map_err(Error::Io)?;
    io::copy(&mut bzimage::decompressor(vmlinuz)?, &mut kernel)
        .map_err(Error::Decompress)?;

    let initramfs_name = format!("{label}/initramfs.xz");
    let mut src =
        root.open_file(&initramfs_name).map_err(fat_err(&initramfs_name))?;
    let mut initramfs = NamedTempFile::new().map_err(Error::Io)?;
    io::copy(&mut src, &mut initramfs).map_err(fat_err(&initramfs_name))?;

    Ok(BootFiles {
        kernel: kernel.into_temp_path(),
        initramfs: initramfs.into_temp_path(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use fatfs::FormatVolumeOptions;
    use std::io::{Cursor, Write};

    const FAT_SECTORS: u64 = 4096;
    const PART_START: u64 = 34;

    fn fat_volume(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut vol =
            Cursor::new(vec![0u8; (FAT_SECTORS * gpt::SECTOR_SIZE) as usize]);
        fatfs::format_volume(&mut vol, FormatVolumeOptions::new()).unwrap();
        {
            let fs = FileSystem::new(&mut vol, FsOptions::new()).unwrap();
            let root = fs.root_dir();
            for (path, contents) in files {
                if let Some((dir, _)) = path.rsplit_once('/') {
                    if root.open_dir(dir).is_err() {
                        root.create_dir(dir).unwrap();
                    }
                }
                root.create_file(path).unwrap().write_all(contents).unwrap();
            }
        }
        vol.into_inner()
    }

    fn disk_image(files: &[(&str, &[u8])]) -> Vec<u8> {
        let total = PART_START + FAT_SECTORS + 34;
        let mut disk = gpt::test::build_disk(
            total,
            &[(PART_START, PART_START + FAT_SECTORS - 1)],
        );
        let vol = fat_volume(files);
        let off = (PART_START * gpt::SECTOR_SIZE) as usize;
        disk[off..off + vol.len()].copy_from_slice(&vol);
        disk
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut e = flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    #[test]
    fn parses_default_label() {
        let cfg = "SERIAL 0 115200\nDEFAULT A\n\nLABEL A\n  KERNEL /A/vmlinuz\n";
        assert_eq!(default_label(cfg).as_deref(), Some("A"));
        assert_eq!(default_label("default  B  \n").as_deref(), Some("B"));
        assert_eq!(default_label("LABEL A\n"), None);
    }

    #[test]
    fn extracts_kernel_and_initramfs() {
        let mut vmlinuz = vec![0x90u8; 1024];
        vmlinuz.extend(gzip(b"decompressed kernel"));
        let disk = disk_image(&[
            ("syslinux/syslinux.cfg", b"DEFAULT B\nLABEL B\n"),
            ("B/vmlinuz", &vmlinuz),
            ("B/initramfs.xz", b"initramfs bytes"),
        ]);

        let files = extract_from(&mut Cursor::new(disk)).unwrap();
        assert_eq!(
            std::fs::read(files.kernel_path()).unwrap(),
            b"decompressed kernel"
        );
        assert_eq!(
            std::fs::read(files.initramfs_path()).unwrap(),
            b"initramfs bytes"
        );
        let kernel = files.kernel_path().to_path_buf();
        files.close().unwrap();
        assert!(!kernel.exists());
    }

    #[test]
    fn missing_default_label() {
        let disk = disk_image(&[("syslinux/syslinux.cfg", b"LABEL A\n")]);
        assert!(matches!(
            extract_from(&mut Cursor::new(disk)),
            Err(Error::NoDefaultLabel)
        ));
    }

    #[test]
    fn non_fat_partition_rejected() {
        let disk = gpt::test::build_disk(200, &[(34, 99)]);
        assert!(matches!(
            extract_from(&mut Cursor::new(disk)),
            Err(Error::NotFat)
        ));
    }
}
