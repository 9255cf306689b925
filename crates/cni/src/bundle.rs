// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Download of a plugin bundle when required plugins are missing.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::Error;

/// Plugins every cluster network needs.
pub const REQUIRED_PLUGINS: &[&str] =
    &["bridge", "firewall", "static", "tc-redirect-tap"];

/// Fetch the gzipped tarball at `url` and unpack it into `dest`.
pub async fn download(url: &str, dest: &Path) -> Result<(), Error> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(Error::Download)?;
    let bytes = response.bytes().await.map_err(Error::Download)?;

    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack(&bytes, &dest))
        .await
        .map_err(|e| Error::Result(format!("unpack task failed: {e}")))?
}

/// Unpack a gzipped tarball held in memory into `dest`.
pub fn unpack(tgz: &[u8], dest: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(dest)
        .map_err(|source| Error::Io { path: dest.to_path_buf(), source })?;
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(tgz)));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|source| Error::Io { path: dest.to_path_buf(), source })
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn unpacks_plugins() {
        let mut builder =
            tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let body = b"#!/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "bridge", &body[..]).unwrap();
        let tgz = builder.into_inner().unwrap().finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        unpack(&tgz, dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("bridge")).unwrap(), body);
    }
}
