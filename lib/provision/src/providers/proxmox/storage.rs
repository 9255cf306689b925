// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Picking where VM disks and ISOs go.

use super::client::StorageInfo;

/// Pools that are typically too small for VM disks.
const EXCLUDED: &[&str] = &["local"];

/// Most preferred first.
const PREFERRED_TYPES: &[&str] = &["zfspool", "lvmthin", "lvm", "dir", "nfs", "cifs"];

const MIN_FREE: u64 = 10 << 30;

const FULL_PERCENT: u64 = 90;

fn type_score(kind: &str) -> usize {
    PREFERRED_TYPES
        .iter()
        .position(|t| *t == kind)
        .map(|i| PREFERRED_TYPES.len() - i)
        .unwrap_or(0)
}

/// Best pool for VM disks: able to hold images, not a known-tiny pool, at
/// least 10 GiB free when the size is known. Ranked by type, then by free
/// space.
pub fn select_best(storages: &[StorageInfo]) -> Option<&StorageInfo> {
    storages
        .iter()
        .filter(|s| !EXCLUDED.contains(&s.storage.as_str()))
        .filter(|s| s.supports("images"))
        .filter(|s| s.total == 0 || s.free() >= MIN_FREE)
        .fold(None, |best: Option<&StorageInfo>, s| match best {
            Some(b)
                if (type_score(&b.kind), b.free())
                    >= (type_score(&s.kind), s.free()) =>
            {
                Some(b)
            }
            _ => Some(s),
        })
}

/// Pool for ISO uploads: the first ISO-capable pool, else the first
/// image-capable one, else `default`.
pub fn select_upload(storages: &[StorageInfo], default: &str) -> String {
    storages
        .iter()
        .find(|s| s.supports("iso"))
        .or_else(|| storages.iter().find(|s| s.supports("images")))
        .map(|s| s.storage.clone())
        .unwrap_or_else(|| default.to_string())
}

/// Problems worth a warning about the chosen pools. A pool missing from
/// `storages` is not checked.
pub fn warnings(storages: &[StorageInfo], disks: &str, uploads: &str) -> Vec<String> {
    let find = |name: &str| storages.iter().find(|s| s.storage == name);
    let mut out = Vec::new();
    if let Some(s) = find(disks) {
        if !s.supports("images") {
            out.push(format!("storage {disks} does not list images content"));
        }
        if s.total > 0 && s.used * 100 / s.total > FULL_PERCENT {
            out.push(format!(
                "storage {disks} is {}% full",
                s.used * 100 / s.total
            ));
        }
    }
    if let Some(s) = find(uploads) {
        if !s.supports("iso") {
            out.push(format!("storage {uploads} does not list iso content"));
        }
    }
    out
}
