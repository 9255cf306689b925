// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;

use crate::util::{cargo, run};

/// Check every workspace crate against `rustfmt.toml`, or rewrite them in
/// place with `fix`.
pub(crate) fn cmd_fmt(fix: bool) -> Result<()> {
    let mut cmd = cargo("fmt")?;
    cmd.arg("--all");
    if !fix {
        cmd.arg("--check");
    }
    run(cmd, "unformatted code found; `cargo xtask fmt --fix` rewrites it")
}
