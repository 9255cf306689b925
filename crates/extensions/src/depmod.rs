// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Regeneration of the kernel module dependency tree across the base root
//! filesystem and every extension that ships modules.
//!
//! This mounts a loop device, a tmpfs and an overlay, and therefore needs
//! CAP_SYS_ADMIN.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use slog::{info, warn, Logger};

use crate::manifest::{Manifest, Metadata, MANIFEST_VERSION};
use crate::{cpio, run, Error};

pub const EXTENSION_NAME: &str = "modules.dep";
pub const DEPMOD_CONFIG: &str = "/etc/modules.d/10-extra-modules.conf";
const ROOTFS_SQUASHFS: &str = "rootfs.sqsh";

/// Mount points unmounted in reverse order when dropped.
struct Mounts {
    log: Logger,
    points: Vec<PathBuf>,
}

impl Drop for Mounts {
    fn drop(&mut self) {
        for point in self.points.drain(..).rev() {
            if let Err(e) = umount2(&point, MntFlags::MNT_DETACH) {
                warn!(self.log, "failed to unmount";
                    "path" => %point.display(), "error" => %e);
            }
        }
    }
}

/// `lowerdir=...,upperdir=...,workdir=...`, with the first lower layer
/// taking precedence.
pub fn overlay_options(lowers: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lower = lowers
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={lower},upperdir={},workdir={}",
        upper.display(),
        work.display()
    )
}

pub fn depmod_args(basedir: &Path, kernel_version: &str) -> Vec<OsString> {
    vec![
        "--basedir".into(),
        basedir.into(),
        "--config".into(),
        DEPMOD_CONFIG.into(),
        kernel_version.into(),
    ]
}

/// Copy `rootfs.sqsh` out of the (xz-compressed, possibly multi-stream)
/// initramfs into `dest`.
pub fn extract_rootfs(initramfs: &Path, dest: &Path) -> Result<(), Error> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| Error::Io { path, source }
    };
    let src = File::open(initramfs).map_err(io_err(initramfs))?;
    let mut out = File::create(dest).map_err(io_err(dest))?;
    let decoder = xz2::read::XzDecoder::new_multi_decoder(BufReader::new(src));
    let found = cpio::extract_file(decoder, ROOTFS_SQUASHFS, &mut out)
        .map_err(io_err(initramfs))?;
    if !found {
        return Err(Error::Initramfs(format!(
            "{ROOTFS_SQUASHFS} not found in {}",
            initramfs.display()
        )));
    }
    Ok(())
}

fn kernel_version(modules_dir: &Path) -> Result<String, Error> {
    let mut versions = fs::read_dir(modules_dir)
        .map_err(|source| Error::Io { path: modules_dir.to_path_buf(), source })?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect::<Vec<_>>();
    match versions.len() {
        1 => Ok(versions.remove(0)),
        n => Err(Error::Initramfs(format!(
            "expected one kernel version in {}, found {n}",
            modules_dir.display()
        ))),
    }
}

fn mkdir(path: &Path) -> Result<(), Error> {
    fs::create_dir_all(path)
        .map_err(|source| Error::Io { path: path.to_path_buf(), source })
}

/// Build the synthetic `modules.dep` extension under `work` and return its
/// directory (laid out like any other extension).
pub fn generate(
    log: &Logger,
    initramfs: &Path,
    extension_roots: &[PathBuf],
    work: &Path,
) -> Result<PathBuf, Error> {
    let sqsh = work.join(ROOTFS_SQUASHFS);
    extract_rootfs(initramfs, &sqsh)?;

    let mut mounts = Mounts { log: log.clone(), points: Vec::new() };

    let base = work.join("rootfs");
    mkdir(&base)?;
    run(Command::new("mount")
        .args(["-t", "squashfs", "-o", "loop,ro"])
        .arg(&sqsh)
        .arg(&base))?;
    mounts.points.push(base.clone());

    let scratch = work.join("tmpfs");
    mkdir(&scratch)?;
    mount(
        Some("tmpfs"),
        &scratch,
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|source| Error::Mount { path: scratch.clone(), source })?;
    mounts.points.push(scratch.clone());

    let upper = scratch.join("upper");
    let overlay_work = scratch.join("work");
    let merged = work.join("merged");
    for dir in [&upper, &overlay_work, &merged] {
        mkdir(dir)?;
    }

    let mut lowers = extension_roots.to_vec();
    lowers.push(base.clone());
    let opts = overlay_options(&lowers, &upper, &overlay_work);
    mount(
        Some("overlay"),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|source| Error::Mount { path: merged.clone(), source })?;
    mounts.points.push(merged.clone());

    let kver = kernel_version(&base.join("lib/modules"))?;
    info!(log, "regenerating module dependencies"; "kernel" => &kver);
    run(Command::new("depmod").args(depmod_args(&merged, &kver)))?;

    let ext_dir = work.join(EXTENSION_NAME);
    let dest = ext_dir.join("rootfs/lib/modules").join(&kver);
    mkdir(&dest)?;
    let generated = merged.join("lib/modules").join(&kver);
    let entries = fs::read_dir(&generated)
        .map_err(|source| Error::Io { path: generated.clone(), source })?;
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("modules.") {
            continue;
        }
        fs::copy(entry.path(), dest.join(&name))
            .map_err(|source| Error::Io { path: entry.path(), source })?;
    }
    drop(mounts);

    let manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        metadata: Metadata {
            name: EXTENSION_NAME.to_string(),
            version: kver,
            author: "Talos Machinery".to_string(),
            description: "Combined modules.dep for all extensions".to_string(),
            compatibility: Default::default(),
        },
    };
    let path = ext_dir.join("manifest.yaml");
    let yaml = serde_yaml::to_string(&manifest)
        .map_err(|source| Error::Manifest { path: path.clone(), source })?;
    fs::write(&path, yaml).map_err(|source| Error::Io { path, source })?;

    Ok(ext_dir)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn overlay_lower_order() {
        let opts = overlay_options(
            &["/ext/a/rootfs".into(), "/work/rootfs".into()],
            Path::new("/work/tmpfs/upper"),
            Path::new("/work/tmpfs/work"),
        );
        assert_eq!(
            opts,
            "lowerdir=/ext/a/rootfs:/work/rootfs,\
             upperdir=/work/tmpfs/upper,workdir=/work/tmpfs/work"
        );
    }

    #[test]
    fn depmod_invocation() {
        let args = depmod_args(Path::new("/merged"), "6.6.1-talos");
        assert_eq!(
            args,
            ["--basedir", "/merged", "--config", DEPMOD_CONFIG, "6.6.1-talos"]
                .map(OsString::from)
        );
    }

    #[test]
    fn rootfs_extracted_from_second_stream() {
        let dir = tempfile::tempdir().unwrap();
        let initramfs = dir.path().join("initramfs.xz");
        let mut file = File::create(&initramfs).unwrap();
        for (name, data) in [("init", &b"#!"[..]), (ROOTFS_SQUASHFS, &b"hsqs"[..])]
        {
            let mut w = cpio::Writer::new(Vec::new());
            w.append_file(name, 0o644, data.len() as u64, data).unwrap();
            let archive = w.finish().unwrap();
            let mut enc = xz2::write::XzEncoder::new(Vec::new(), 0);
            enc.write_all(&archive).unwrap();
            file.write_all(&enc.finish().unwrap()).unwrap();
        }
        drop(file);

        let out = dir.path().join("rootfs.sqsh");
        extract_rootfs(&initramfs, &out).unwrap();
        assert_eq!(fs::read(out).unwrap(), b"hsqs");
    }
}
