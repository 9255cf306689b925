// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source headers and manifest `license` fields, both against
//! `.licenserc.yaml`.

use std::fs;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use serde::Deserialize;

use crate::util::{glob_set, metadata, workspace_files};

#[derive(Deserialize, Debug)]
struct LicenseRc {
    header: HeaderRc,
}

#[derive(Deserialize, Debug)]
struct HeaderRc {
    license: LicenseRcEntry,
    paths: Vec<String>,
    #[serde(rename = "paths-ignore", default)]
    paths_ignore: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct LicenseRcEntry {
    #[serde(rename = "spdx-id")]
    spdx_id: String,
    content: String,
}

impl LicenseRc {
    fn load(root: &Utf8Path) -> Result<Self> {
        let path = root.join(".licenserc.yaml");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {path}"))?;
        let rc: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("cannot parse {path}"))?;
        if rc.header.paths.is_empty() {
            bail!("{path} configures no file paths")
        }
        Ok(rc)
    }

    /// The header as it opens a Rust source file.
    fn comment_lines(&self) -> Vec<String> {
        self.header
            .license
            .content
            .lines()
            .map(|l| format!("// {l}"))
            .collect()
    }
}

/// First line (1-based) at which `text` stops carrying `header`.
fn header_mismatch(text: &str, header: &[String]) -> Option<usize> {
    let mut lines = text.lines();
    header
        .iter()
        .position(|want| lines.next() != Some(want.as_str()))
        .map(|i| i + 1)
}

pub(crate) fn cmd_license() -> Result<()> {
    let meta = metadata()?;
    let root = meta.workspace_root.as_path();
    let rc = LicenseRc::load(root)?;
    let header = rc.comment_lines();
    let ignore = glob_set(&rc.header.paths_ignore)?;

    let mut failures = 0;
    for pattern in &rc.header.paths {
        for file in workspace_files(root, pattern, &ignore)? {
            let text = fs::read_to_string(root.join(&file))
                .with_context(|| format!("cannot read {file}"))?;
            if let Some(line) = header_mismatch(&text, &header) {
                eprintln!("{file}: expected license header not found at line {line}");
                failures += 1;
            }
        }
    }

    let spdx = rc.header.license.spdx_id.as_str();
    for package in meta.workspace_packages() {
        if package.license.as_deref() != Some(spdx) {
            eprintln!("{}: `license` should be {spdx:?}", package.manifest_path);
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} license error(s) detected")
    }
    println!("License checks happy!");
    Ok(())
}
