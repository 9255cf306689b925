// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Result};

use crate::{task_clippy, task_fmt, task_license, task_style};

type Check = fn(bool) -> Result<()>;

/// Cheap checks first so that a header or style slip is reported before
/// clippy has built the workspace.
const CHECKS: &[(&str, Check)] = &[
    ("license", |_| task_license::cmd_license()),
    ("style", |_| task_style::cmd_style()),
    ("fmt", |_| task_fmt::cmd_fmt(false)),
    ("clippy", |quiet| task_clippy::cmd_clippy(true, quiet)),
];

pub(crate) fn cmd_prepush(quiet: bool) -> Result<()> {
    let mut failed = Vec::new();
    for (name, check) in CHECKS {
        if !quiet {
            println!("Checking {name}...");
        }
        if let Err(e) = check(quiet) {
            eprintln!("{name}: {e:#}");
            failed.push(*name);
        }
    }
    if !failed.is_empty() {
        bail!("pre-push checks failed: {}", failed.join(", "))
    }
    Ok(())
}
