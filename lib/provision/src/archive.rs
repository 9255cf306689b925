// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Log archives collected before a cluster is torn down.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

/// `*.log` files of the state directory, sorted by name.
pub fn log_files(state_path: &Path) -> Result<Vec<PathBuf>> {
    let pattern = state_path.join("*.log");
    let pattern = pattern.to_string_lossy();
    let mut files = glob::glob(&pattern)
        .with_context(|| format!("bad glob {pattern}"))?
        .collect::<Result<Vec<_>, _>>()?;
    files.sort();
    Ok(files)
}

/// Write the given files into a gzipped tarball at `dest`, each under
/// `<prefix>/<file name>`. Returns the number of files archived.
pub fn write_tar_gz(dest: &Path, prefix: &str, files: &[PathBuf]) -> Result<usize> {
    let out = File::create(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    let mut count = 0;
    for file in files {
        let Some(name) = file.file_name() else { continue };
        let name = Path::new(prefix).join(name);
        builder
            .append_path_with_name(file, &name)
            .with_context(|| format!("failed to archive {}", file.display()))?;
        count += 1;
    }
    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .with_context(|| format!("failed to finish {}", dest.display()))?;
    Ok(count)
}

/// Archive every log of the cluster (launchers and auxiliary services).
pub fn save_cluster_logs(state_path: &Path, cluster: &str, dest: &Path) -> Result<usize> {
    write_tar_gz(dest, cluster, &log_files(state_path)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn archives_only_logs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cp0.log"), "booting\n").unwrap();
        std::fs::write(dir.path().join("dhcpd.log"), "lease\n").unwrap();
        std::fs::write(dir.path().join("state.yaml"), "x: 1\n").unwrap();

        let dest = dir.path().join("logs.tar.gz");
        assert_eq!(save_cluster_logs(dir.path(), "c1", &dest).unwrap(), 2);

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&dest).unwrap()));
        let mut names: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["c1/cp0.log", "c1/dhcpd.log"]);
    }
}
