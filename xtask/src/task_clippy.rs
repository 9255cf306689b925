// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::Stdio;

use anyhow::{bail, Result};

use crate::util::cargo;

pub(crate) fn cmd_clippy(strict: bool, quiet: bool) -> Result<()> {
    let run_clippy = |args: &[&str]| -> Result<bool> {
        let mut cmd = cargo("clippy")?;
        cmd.arg("--no-deps").args(args);

        if quiet {
            cmd.arg("--quiet").stderr(Stdio::null()).stdout(Stdio::null());
        }
        if strict {
            cmd.args(["--", "-Dwarnings"]);
        }

        let status = cmd.spawn()?.wait()?;
        Ok(!status.success())
    };

    let mut failed = false;

    // Everything in the workspace (including tests, etc)
    failed |= run_clippy(&["--workspace", "--all-targets"])?;

    // The binary on its own, as it is shipped
    failed |= run_clippy(&["-p", "provisioner", "--release"])?;

    if failed {
        bail!("Clippy failures detected")
    }

    Ok(())
}
