// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content checks of an extension's root filesystem.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::Error;

/// Paths under which extensions may place regular files.
pub const ALLOWED_PATHS: &[&str] = &[
    "/etc/cri/conf.d",
    "/lib/firmware",
    "/lib/modules",
    "/lib64/ld-linux-x86-64.so.2",
    "/sbin/ldconfig",
    "/usr/etc/udev/rules.d",
    "/usr/local",
    "/usr/share/glvnd",
    "/usr/share/egl",
    "/etc/vulkan",
];

/// Whether the absolute in-image `path` lies under an allowlisted prefix.
pub fn is_allowed(path: &str) -> bool {
    ALLOWED_PATHS.iter().any(|prefix| {
        path == *prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// The absolute in-image path of `entry` below `rootfs`.
fn image_path(rootfs: &Path, entry: &Path) -> Option<String> {
    let rel = entry.strip_prefix(rootfs).ok()?;
    let mut out = String::new();
    for comp in rel.components() {
        match comp {
            std::path::Component::Normal(c) => {
                out.push('/');
                out.push_str(c.to_str()?);
            }
            _ => return None,
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

/// Walk `rootfs` and reject world-writable entries, special files, and
/// regular files outside [`ALLOWED_PATHS`]. Symlinks are not followed.
pub fn validate_contents(name: &str, rootfs: &Path) -> Result<(), Error> {
    let content_err = |path: PathBuf, reason: &str| Error::Content {
        extension: name.to_string(),
        path,
        reason: reason.to_string(),
    };

    for entry in WalkDir::new(rootfs).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_default(),
            source: e.into(),
        })?;
        let ft = entry.file_type();
        if ft.is_symlink() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| Error::Io {
            path: entry.path().to_path_buf(),
            source: e.into(),
        })?;
        if meta.permissions().mode() & 0o002 != 0 {
            return Err(content_err(entry.into_path(), "world-writable"));
        }
        if ft.is_dir() {
            continue;
        }
        if !ft.is_file() {
            return Err(content_err(entry.into_path(), "special file"));
        }
        let Some(path) = image_path(rootfs, entry.path()) else {
            return Err(content_err(entry.into_path(), "invalid path"));
        };
        if !is_allowed(&path) {
            return Err(content_err(
                PathBuf::from(path),
                "path is not allowed for extensions",
            ));
        }
    }
    Ok(())
}
