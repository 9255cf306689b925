// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor of the virtiofsd daemons backing virtiofs disks.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::select_all;
use slog::{info, warn, Logger};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// A host directory exported on a vhost-user socket, written `share:sock`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Share {
    pub dir: PathBuf,
    pub socket: PathBuf,
}

impl FromStr for Share {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (dir, socket) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("share {s:?} is not of the form dir:socket"))?;
        if dir.is_empty() || socket.is_empty() {
            bail!("share {s:?} is not of the form dir:socket");
        }
        Ok(Self { dir: dir.into(), socket: socket.into() })
    }
}

impl std::fmt::Display for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dir.display(), self.socket.display())
    }
}

pub fn virtiofsd_args(share: &Share) -> Vec<String> {
    vec![
        format!("--socket-path={}", share.socket.display()),
        format!("--shared-dir={}", share.dir.display()),
        "--cache=auto".to_string(),
        "--sandbox=none".to_string(),
    ]
}

/// Run one virtiofsd per share until `cancel` fires or any of them exits,
/// then terminate the rest.
pub async fn run(
    log: Logger,
    bin: &Path,
    shares: &[Share],
    cancel: CancellationToken,
) -> Result<()> {
    if shares.is_empty() {
        bail!("no virtiofs shares given");
    }
    let mut children = Vec::with_capacity(shares.len());
    for share in shares {
        let child = Command::new(bin)
            .args(virtiofsd_args(share))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {} for {share}", bin.display()))?;
        info!(log, "virtiofsd started"; "share" => %share, "pid" => child.id());
        children.push(child);
    }

    let exited = {
        let waits = children.iter_mut().map(|c| Box::pin(c.wait()));
        tokio::select! {
            _ = cancel.cancelled() => None,
            (res, index, _) = select_all(waits) => Some((index, res)),
        }
    };

    for child in children.iter_mut() {
        terminate(&log, child).await;
    }

    match exited {
        None => Ok(()),
        Some((index, res)) => {
            let status = res.context("failed to wait for virtiofsd")?;
            Err(anyhow!("virtiofsd for {} exited: {status}", shares[index]))
        }
    }
}

async fn terminate(log: &Logger, child: &mut Child) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            warn!(log, "failed to signal virtiofsd"; "pid" => %pid, "error" => %e);
        }
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_share() {
        let share: Share = "/srv/data:/run/c1/w0-1.sock".parse().unwrap();
        assert_eq!(share.dir, PathBuf::from("/srv/data"));
        assert_eq!(share.socket, PathBuf::from("/run/c1/w0-1.sock"));
        assert_eq!(share.to_string(), "/srv/data:/run/c1/w0-1.sock");
        assert!("nocolon".parse::<Share>().is_err());
        assert!(":/sock".parse::<Share>().is_err());
    }

    #[test]
    fn args() {
        let share: Share = "/srv:/tmp/s.sock".parse().unwrap();
        let args = virtiofsd_args(&share);
        assert_eq!(args[0], "--socket-path=/tmp/s.sock");
        assert_eq!(args[1], "--shared-dir=/srv");
    }

    #[tokio::test]
    async fn child_exit_is_reported() {
        // `true` ignores its arguments and exits at once.
        let share: Share = "/srv:/tmp/s.sock".parse().unwrap();
        let err = run(
            crate::test_logger(),
            Path::new("true"),
            &[share],
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exited"), "{err}");
    }
}
