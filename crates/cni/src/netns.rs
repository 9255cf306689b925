// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named network namespaces pinned by a bind mount.

use std::fs::File;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};

use crate::Error;

/// Directory holding the bind mounts that keep namespaces alive.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
}

impl NetNs {
    /// Create a new namespace pinned at `<NETNS_RUN_DIR>/<name>`.
    ///
    /// The namespace is created by a short-lived thread so the calling
    /// thread stays in its own namespace.
    pub fn create(name: &str) -> Result<Self, Error> {
        Self::create_in(Path::new(NETNS_RUN_DIR), name)
    }

    pub fn create_in(run_dir: &Path, name: &str) -> Result<Self, Error> {
        std::fs::create_dir_all(run_dir).map_err(|source| Error::Io {
            path: run_dir.to_path_buf(),
            source,
        })?;
        let path = run_dir.join(name);
        File::create(&path)
            .map_err(|source| Error::Io { path: path.clone(), source })?;

        let target = path.clone();
        let pinned = std::thread::spawn(move || -> Result<(), Error> {
            unshare(CloneFlags::CLONE_NEWNET).map_err(|source| {
                Error::Sys { op: "unshare", source }
            })?;
            mount(
                Some("/proc/thread-self/ns/net"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|source| Error::Sys { op: "bind mount", source })
        })
        .join()
        .map_err(|_| Error::Result("namespace thread panicked".to_string()))?;

        if let Err(e) = pinned {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(Self { path })
    }

    /// Reopen a namespace previously pinned at `path`.
    pub fn open(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arrange for `cmd` to run inside this namespace.
    pub fn apply_to(
        &self,
        cmd: &mut tokio::process::Command,
    ) -> Result<(), Error> {
        let file = File::open(&self.path)
            .map_err(|source| Error::Io { path: self.path.clone(), source })?;
        // SAFETY: setns(2) is a single syscall and does not allocate.
        unsafe {
            cmd.pre_exec(move || {
                setns(&file, CloneFlags::CLONE_NEWNET)
                    .map_err(std::io::Error::from)
            });
        }
        Ok(())
    }

    /// Unmount and delete the namespace pin.
    pub fn remove(self) -> Result<(), Error> {
        match umount2(&self.path, MntFlags::MNT_DETACH) {
            Ok(()) | Err(nix::errno::Errno::EINVAL) => {}
            Err(nix::errno::Errno::ENOENT) => return Ok(()),
            Err(source) => {
                return Err(Error::Sys { op: "unmount", source })
            }
        }
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(Error::Io { path: self.path, source: e })
            }
            _ => Ok(()),
        }
    }
}
