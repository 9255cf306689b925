// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod task_clippy;
mod task_fmt;
mod task_license;
mod task_prepush;
mod task_style;
mod util;

#[derive(Parser)]
#[command(name = "cargo xtask", about = "Developer tasks for the provisioner")]
struct Args {
    #[command(subcommand)]
    cmd: Cmds,
}

#[derive(Subcommand)]
enum Cmds {
    /// Run suite of clippy checks
    Clippy {
        /// Treat warnings as errors
        #[arg(short, long)]
        strict: bool,

        /// Suppress non-essential output
        #[arg(short, long)]
        quiet: bool,
    },
    /// Check formatting against `rustfmt.toml`
    Fmt {
        /// Rewrite unformatted files instead of failing
        #[arg(long)]
        fix: bool,
    },
    /// Check source license headers and manifest `license` fields
    License,
    /// Perform pre-push checks (license, style, fmt, clippy)
    Prepush {
        /// Suppress non-essential output
        #[arg(short, long)]
        quiet: bool,
    },
    /// Check test module names and stray printing in library code
    Style,
}

fn main() -> Result<()> {
    match Args::parse().cmd {
        Cmds::Clippy { strict, quiet } => task_clippy::cmd_clippy(strict, quiet),
        Cmds::Fmt { fix } => task_fmt::cmd_fmt(fix),
        Cmds::License => task_license::cmd_license(),
        Cmds::Prepush { quiet } => task_prepush::cmd_prepush(quiet),
        Cmds::Style => task_style::cmd_style(),
    }
}
