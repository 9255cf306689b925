// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UEFI firmware flash images.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use provision_types::Arch;

use crate::Error;

/// One flash device: optionally sized, optionally seeded from the first
/// existing source path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PflashSpec {
    pub size: u64,
    pub source_paths: Vec<PathBuf>,
}

fn paths(list: &[&str]) -> Vec<PathBuf> {
    list.iter().map(PathBuf::from).collect()
}

/// Flash devices a VM of `arch` needs. arm64 always boots through UEFI.
pub fn specs(arch: Arch, uefi_enabled: bool) -> Vec<PflashSpec> {
    match arch {
        Arch::Arm64 => vec![
            PflashSpec {
                size: 64 << 20,
                source_paths: paths(&[
                    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
                    "/usr/share/AAVMF/AAVMF_CODE.fd",
                    "/usr/share/edk2/aarch64/QEMU_EFI.fd",
                    "/usr/share/qemu/edk2-aarch64-code.fd",
                ]),
            },
            PflashSpec { size: 64 << 20, source_paths: Vec::new() },
        ],
        Arch::Amd64 if uefi_enabled => vec![
            PflashSpec {
                size: 0,
                source_paths: paths(&[
                    "/usr/share/OVMF/OVMF_CODE_4M.secboot.fd",
                    "/usr/share/OVMF/OVMF_CODE.secboot.fd",
                    "/usr/share/edk2/ovmf/OVMF_CODE.secboot.fd",
                    "/usr/share/OVMF/OVMF_CODE_4M.fd",
                    "/usr/share/OVMF/OVMF_CODE.fd",
                    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
                    "/usr/share/qemu/ovmf-x86_64-code.bin",
                ]),
            },
            PflashSpec {
                size: 0,
                source_paths: paths(&[
                    "/usr/share/OVMF/OVMF_VARS_4M.fd",
                    "/usr/share/OVMF/OVMF_VARS.fd",
                    "/usr/share/edk2/ovmf/OVMF_VARS.fd",
                    "/usr/share/qemu/ovmf-x86_64-vars.bin",
                ]),
            },
        ],
        Arch::Amd64 => Vec::new(),
    }
}

impl PflashSpec {
    /// First source that exists on this host.
    pub fn find_source(&self) -> Option<&Path> {
        self.source_paths.iter().map(PathBuf::as_path).find(|p| p.exists())
    }
}

/// Fail when a flash device needs seeding but none of its sources exist.
pub fn check_sources(specs: &[PflashSpec]) -> Result<()> {
    for spec in specs {
        if !spec.source_paths.is_empty() && spec.find_source().is_none() {
            return Err(Error::Preflight(format!(
                "UEFI firmware not found, looked in {:?}",
                spec.source_paths
            ))
            .into());
        }
    }
    Ok(())
}

/// Write `<state>/<node>-flash<i>.img` for every spec.
pub fn create_images(
    state_path: &Path,
    node: &str,
    specs: &[PflashSpec],
) -> Result<Vec<PathBuf>> {
    let mut images = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let path = state_path.join(format!("{node}-flash{i}.img"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        if spec.size > 0 {
            file.set_len(spec.size)
                .with_context(|| format!("failed to size {}", path.display()))?;
        }
        drop(file);

        if !spec.source_paths.is_empty() {
            let Some(source) = spec.find_source() else {
                return Err(Error::Preflight(format!(
                    "UEFI firmware not found, looked in {:?}",
                    spec.source_paths
                ))
                .into());
            };
            let contents = fs::read(source)
                .with_context(|| format!("failed to read {}", source.display()))?;
            let mut out = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            std::io::Write::write_all(&mut out, &contents)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        images.push(path);
    }
    Ok(images)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn amd64_without_uefi_has_no_flash() {
        assert!(specs(Arch::Amd64, false).is_empty());
        assert_eq!(specs(Arch::Amd64, true).len(), 2);
        assert_eq!(specs(Arch::Arm64, false).len(), 2);
    }

    #[test]
    fn images_are_seeded_and_padded() {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join("CODE.fd");
        fs::write(&code, b"firmware").unwrap();

        let specs = vec![
            PflashSpec {
                size: 4096,
                source_paths: vec![dir.path().join("missing.fd"), code],
            },
            PflashSpec { size: 8192, source_paths: Vec::new() },
        ];
        check_sources(&specs).unwrap();
        let images = create_images(dir.path(), "cp0", &specs).unwrap();
        assert_eq!(
            images,
            [dir.path().join("cp0-flash0.img"), dir.path().join("cp0-flash1.img")]
        );

        let flash0 = fs::read(&images[0]).unwrap();
        assert_eq!(flash0.len(), 4096);
        assert_eq!(&flash0[..8], b"firmware");
        assert_eq!(fs::metadata(&images[1]).unwrap().len(), 8192);
    }

    #[test]
    fn missing_firmware_is_a_preflight_error() {
        let specs = vec![PflashSpec {
            size: 0,
            source_paths: vec![PathBuf::from("/no/such/OVMF_CODE.fd")],
        }];
        let err = check_sources(&specs).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Preflight(_))));
    }
}
