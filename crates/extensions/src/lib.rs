// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System extension packaging.
//!
//! Each extension lives in `<root>/<ext>/` with a `manifest.yaml` and a
//! `rootfs/` tree. A build validates every extension, compresses each one
//! into a squashfs layer, optionally adds a synthetic layer carrying a
//! combined `modules.dep`, and appends the layers plus an `extensions.yaml`
//! index to the initramfs as one more xz-compressed cpio stream.

pub mod cpio;
pub mod depmod;
pub mod manifest;
pub mod validate;

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Command;

use semver::Version;
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use xz2::stream::{Check, Stream};

pub use manifest::Manifest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error(
        "extension {name} requires OS version {constraint}, running {version}"
    )]
    Incompatible { name: String, constraint: String, version: String },

    #[error("extension {extension}: {path}: {reason}")]
    Content { extension: String, path: PathBuf, reason: String },

    #[error("{command} failed ({status}): {stderr}")]
    Command { command: String, status: String, stderr: String },

    #[error("failed to mount {path}")]
    Mount {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("initramfs: {0}")]
    Initramfs(String),

    #[error("xz encoder")]
    Xz(#[source] xz2::stream::Error),
}

pub const INDEX_FILE: &str = "extensions.yaml";

/// Preset passed to the xz encoder: level 0 with the extreme flag set.
const XZ_PRESET: u32 = 0x8000_0000;

/// Run `cmd` to completion, turning a failed exit into an error carrying
/// its stderr.
pub(crate) fn run(cmd: &mut Command) -> Result<(), Error> {
    let program = PathBuf::from(cmd.get_program());
    let command = program.display().to_string();
    let output = cmd
        .output()
        .map_err(|source| Error::Io { path: program, source })?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::Command {
        command,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// One extension found on disk.
#[derive(Clone, Debug)]
pub struct Extension {
    pub dir: PathBuf,
    pub manifest: Manifest,
}

impl Extension {
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let manifest = Manifest::load(&dir.join("manifest.yaml"))?;
        Ok(Self { dir: dir.to_path_buf(), manifest })
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    pub fn name(&self) -> &str {
        &self.manifest.metadata.name
    }

    pub fn provides_modules(&self) -> bool {
        self.rootfs().join("lib/modules").is_dir()
    }

    pub fn validate(&self, os_version: &Version) -> Result<(), Error> {
        self.manifest.validate()?;
        self.manifest.validate_constraints(os_version)?;
        validate::validate_contents(self.name(), &self.rootfs())
    }
}

/// Extensions under `root`, one per subdirectory, ordered by directory
/// name.
pub fn discover(root: &Path) -> Result<Vec<Extension>, Error> {
    let mut dirs = fs::read_dir(root)
        .map_err(|source| Error::Io { path: root.to_path_buf(), source })?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect::<Vec<_>>();
    dirs.sort();
    dirs.iter().map(|d| Extension::load(d)).collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub image: String,
    pub metadata: manifest::Metadata,
}

/// Contents of `extensions.yaml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerIndex {
    pub layers: Vec<Layer>,
}

pub fn layer_file_name(index: usize, name: &str) -> String {
    format!("{index:03}-{name}.sqsh")
}

pub fn mksquashfs_args(rootfs: &Path, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![rootfs.into(), out.into()];
    args.extend(
        [
            "-all-root",
            "-noappend",
            "-comp",
            "xz",
            "-Xdict-size",
            "100%",
            "-no-progress",
        ]
        .map(OsString::from),
    );
    args
}

/// Append a cpio archive of every file in `dir` (non-recursive, sorted) to
/// `initramfs` as a new xz stream with CRC32 checks.
pub fn append_to_initramfs(dir: &Path, initramfs: &Path) -> Result<(), Error> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| Error::Io { path, source }
    };

    let mut files = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect::<Vec<_>>();
    files.sort();

    let out = OpenOptions::new()
        .append(true)
        .open(initramfs)
        .map_err(io_err(initramfs))?;
    let stream =
        Stream::new_easy_encoder(XZ_PRESET, Check::Crc32).map_err(Error::Xz)?;
    let encoder = xz2::write::XzEncoder::new_stream(out, stream);
    let mut archive = cpio::Writer::new(encoder);

    for path in &files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Initramfs(format!("bad file name {}", path.display()))
            })?;
        let src = File::open(path).map_err(io_err(path))?;
        let size = src.metadata().map_err(io_err(path))?.len();
        archive
            .append_file(name, 0o644, size, src)
            .map_err(io_err(initramfs))?;
    }

    archive
        .finish()
        .and_then(|enc| enc.finish())
        .map_err(io_err(initramfs))?;
    Ok(())
}

/// Inputs of an extension build.
pub struct Builder {
    pub extensions_dir: PathBuf,
    pub initramfs_path: PathBuf,
    pub os_version: Version,
    /// Keep the scratch directory instead of removing it.
    pub keep_temp: bool,
    pub log: Logger,
}

impl Builder {
    pub fn build(&self) -> Result<(), Error> {
        let mut extensions = discover(&self.extensions_dir)?;
        for ext in &extensions {
            info!(self.log, "validating extension";
                "name" => ext.name(), "version" => &ext.manifest.metadata.version);
            ext.validate(&self.os_version)?;
        }

        let scratch = tempfile::Builder::new()
            .prefix("extensions")
            .tempdir()
            .map_err(|source| Error::Io { path: std::env::temp_dir(), source })?;
        let result = self.build_in(scratch.path(), &mut extensions);
        if self.keep_temp {
            let kept = scratch.into_path();
            info!(self.log, "keeping scratch directory"; "path" => %kept.display());
        }
        result
    }

    fn build_in(
        &self,
        scratch: &Path,
        extensions: &mut Vec<Extension>,
    ) -> Result<(), Error> {
        if extensions.iter().any(Extension::provides_modules) {
            let roots: Vec<_> = extensions
                .iter()
                .filter(|e| e.provides_modules())
                .map(Extension::rootfs)
                .collect();
            let dir = depmod::generate(
                &self.log,
                &self.initramfs_path,
                &roots,
                scratch,
            )?;
            extensions.push(Extension::load(&dir)?);
        }

        let out = scratch.join("initramfs");
        fs::create_dir_all(&out)
            .map_err(|source| Error::Io { path: out.clone(), source })?;

        let mut index = LayerIndex::default();
        for (i, ext) in extensions.iter().enumerate() {
            let image = layer_file_name(i, ext.name());
            info!(self.log, "compressing extension"; "name" => ext.name(), "image" => &image);
            run(Command::new("mksquashfs")
                .args(mksquashfs_args(&ext.rootfs(), &out.join(&image))))?;
            index.layers.push(Layer {
                image,
                metadata: ext.manifest.metadata.clone(),
            });
        }

        let index_path = out.join(INDEX_FILE);
        let yaml = serde_yaml::to_string(&index).map_err(|source| {
            Error::Manifest { path: index_path.clone(), source }
        })?;
        fs::write(&index_path, yaml)
            .map_err(|source| Error::Io { path: index_path, source })?;

        append_to_initramfs(&out, &self.initramfs_path)?;
        info!(self.log, "appended extensions to initramfs";
            "count" => index.layers.len(),
            "initramfs" => %self.initramfs_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn squashfs_flags() {
        let args = mksquashfs_args(Path::new("/e/rootfs"), Path::new("/o/000-a.sqsh"));
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "/e/rootfs",
                "/o/000-a.sqsh",
                "-all-root",
                "-noappend",
                "-comp",
                "xz",
                "-Xdict-size",
                "100%",
                "-no-progress"
            ]
        );
        assert_eq!(layer_file_name(3, "gvisor"), "003-gvisor.sqsh");
    }

    #[test]
    fn discovers_in_name_order() {
        let root = tempfile::tempdir().unwrap();
        for name in ["zfs", "gvisor"] {
            let dir = root.path().join(name);
            fs::create_dir_all(dir.join("rootfs")).unwrap();
            fs::write(
                dir.join("manifest.yaml"),
                format!(
                    "version: v1alpha1\nmetadata:\n  name: {name}\n  version: 1.0.0\n  author: a\n  description: d\n"
                ),
            )
            .unwrap();
        }
        let exts = discover(root.path()).unwrap();
        let names: Vec<_> = exts.iter().map(Extension::name).collect();
        assert_eq!(names, ["gvisor", "zfs"]);
        assert!(!exts[0].provides_modules());
        assert!(exts[0].validate(&Version::new(1, 8, 0)).is_ok());
    }

    #[test]
    fn appended_stream_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let initramfs = dir.path().join("initramfs.xz");
        let mut base = xz2::write::XzEncoder::new(Vec::new(), 1);
        let mut w = cpio::Writer::new(Vec::new());
        w.append_file("init", 0o755, 2, &b"#!"[..]).unwrap();
        base.write_all(&w.finish().unwrap()).unwrap();
        fs::write(&initramfs, base.finish().unwrap()).unwrap();

        let layers = dir.path().join("layers");
        fs::create_dir_all(&layers).unwrap();
        fs::write(layers.join("000-a.sqsh"), b"layer").unwrap();
        fs::write(layers.join(INDEX_FILE), b"layers: []\n").unwrap();
        append_to_initramfs(&layers, &initramfs).unwrap();

        let mut decoded = Vec::new();
        xz2::read::XzDecoder::new_multi_decoder(File::open(&initramfs).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        let mut out = Vec::new();
        assert!(cpio::extract_file(&decoded[..], "000-a.sqsh", &mut out).unwrap());
        assert_eq!(out, b"layer");
        let mut out = Vec::new();
        assert!(cpio::extract_file(&decoded[..], "init", &mut out).unwrap());
    }
}
