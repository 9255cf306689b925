// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backing files of VM disks.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use provision_types::{DiskDriver, NodeRequest};

/// `<state>/<node>-<i>.disk`
pub fn disk_path(state_path: &Path, node: &str, index: usize) -> PathBuf {
    state_path.join(format!("{node}-{index}.disk"))
}

/// Create a backing file per non-virtiofs disk of `node`. Returns the paths
/// in disk order; virtiofs disks get no file and no entry.
pub fn create_disks(state_path: &Path, node: &NodeRequest) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(node.disks.len());
    for (i, disk) in node.disks.iter().enumerate() {
        if disk.driver_at(i) == DiskDriver::Virtiofs {
            continue;
        }
        let path = disk_path(state_path, &node.name, i);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        if disk.preallocate {
            // SAFETY: the descriptor stays open for the duration of the call.
            let rc = unsafe {
                libc::posix_fallocate(
                    file.as_raw_fd(),
                    0,
                    disk.size as libc::off_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc)).with_context(
                    || format!("failed to allocate {}", path.display()),
                );
            }
        } else {
            file.set_len(disk.size).with_context(|| {
                format!("failed to size {}", path.display())
            })?;
        }
        paths.push(path);
    }
    Ok(paths)
}

/// Copy a pre-built image onto the boot disk. Images named `*.zst` are
/// decompressed on the way. The disk keeps its size if the image is
/// smaller.
pub fn populate_system_disk(disk: &Path, image: &Path) -> Result<u64> {
    let src = File::open(image)
        .with_context(|| format!("failed to open {}", image.display()))?;
    let mut reader: Box<dyn Read> =
        if image.extension().is_some_and(|ext| ext == "zst") {
            Box::new(zstd::stream::read::Decoder::new(src).with_context(
                || format!("failed to open zstd stream {}", image.display()),
            )?)
        } else {
            Box::new(BufReader::new(src))
        };

    let mut dst = OpenOptions::new()
        .write(true)
        .open(disk)
        .with_context(|| format!("failed to open {}", disk.display()))?;
    let len = dst.metadata()?.len();
    let copied = io::copy(&mut reader, &mut dst).with_context(|| {
        format!("failed to copy {} to {}", image.display(), disk.display())
    })?;
    if copied < len {
        dst.set_len(len)?;
    }
    Ok(copied)
}
