// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers shared by the tasks.

use std::process::Command;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Trees under the workspace root that are not part of the provisioner.
pub(crate) const FOREIGN_TREES: &[&str] = &["target/**", "examples/**"];

pub(crate) fn metadata() -> Result<cargo_metadata::Metadata> {
    cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("failed to run cargo metadata")
}

pub(crate) fn workspace_root() -> Result<Utf8PathBuf> {
    Ok(metadata()?.workspace_root)
}

/// `cargo <subcommand>` started from the workspace root.
pub(crate) fn cargo(subcommand: &str) -> Result<Command> {
    let mut cmd = Command::new("cargo");
    cmd.arg(subcommand).current_dir(workspace_root()?);
    Ok(cmd)
}

/// Run `cmd` to completion, failing with `failure` if it does not succeed.
pub(crate) fn run(mut cmd: Command, failure: &str) -> Result<()> {
    let status = cmd.spawn()?.wait()?;
    if !status.success() {
        bail!("{failure}")
    }
    Ok(())
}

pub(crate) fn glob_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        builder.add(
            Glob::new(pattern)
                .with_context(|| format!("'{pattern}' is not a valid glob"))?,
        );
    }
    Ok(builder.build()?)
}

/// Files under `root` matching `pattern`, relative to `root`, skipping
/// foreign trees and anything in `ignore`.
pub(crate) fn workspace_files(
    root: &Utf8Path,
    pattern: &str,
    ignore: &GlobSet,
) -> Result<Vec<Utf8PathBuf>> {
    let foreign = glob_set(FOREIGN_TREES)?;
    let mut files = Vec::new();
    for entry in glob::glob(root.join(pattern).as_str())? {
        let path = Utf8PathBuf::try_from(entry.context("unreadable path")?)?;
        let short = path.strip_prefix(root)?.to_path_buf();
        if foreign.is_match(&short) || ignore.is_match(&short) {
            continue;
        }
        files.push(short);
    }
    Ok(files)
}
