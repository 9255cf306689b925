// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{File, OpenOptions};
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};

use crate::Error;

/// An exclusive advisory lock on a file, held until dropped.
pub struct FileLock {
    _lock: Flock<File>,
}

impl FileLock {
    /// Block until the lock on `path` is acquired, creating the file if
    /// needed.
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, source)| Error::Sys { op: "flock", source })?;
        Ok(Self { _lock: lock })
    }

    /// Acquire without blocking the async runtime.
    pub async fn acquire_async(path: &Path) -> Result<Self, Error> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire(&path))
            .await
            .map_err(|e| Error::Result(format!("lock task failed: {e}")))?
    }
}
