// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software TPM backing a VM's emulated TPM device.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};

use crate::process;

const SOCKET_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmConfig {
    pub state_dir: PathBuf,
    pub tpm2: bool,
}

impl TpmConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join("swtpm.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("swtpm.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join("swtpm.log")
    }
}

pub fn swtpm_args(tpm: &TpmConfig) -> Vec<String> {
    let mut args = vec![
        "socket".to_string(),
        "--tpmstate".to_string(),
        format!("dir={},mode=0644", tpm.state_dir.display()),
        "--ctrl".to_string(),
        format!("type=unixio,path={}", tpm.socket_path().display()),
        "--pid".to_string(),
        format!("file={}", tpm.pid_path().display()),
        "--log".to_string(),
        format!("file={},level=20", tpm.log_path().display()),
    ];
    if tpm.tpm2 {
        args.push("--tpm2".to_string());
    }
    args
}

/// Start swtpm unless one already serves this state directory, and wait
/// for its control socket.
pub async fn ensure_running(log: &Logger, tpm: &TpmConfig) -> Result<()> {
    if process::pidfile_alive(&tpm.pid_path()) && tpm.socket_path().exists() {
        return Ok(());
    }
    tokio::fs::create_dir_all(&tpm.state_dir)
        .await
        .with_context(|| format!("failed to create {}", tpm.state_dir.display()))?;

    // swtpm writes its own PID file; the handle is only kept for reaping.
    let child = tokio::process::Command::new("swtpm")
        .args(swtpm_args(tpm))
        .spawn()
        .context("failed to start swtpm")?;
    info!(log, "started swtpm"; "pid" => child.id(), "dir" => %tpm.state_dir.display());
    drop(child);

    wait_for_socket(&tpm.socket_path(), SOCKET_WAIT).await
}

pub(crate) async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {}", path.display());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tpm2_args() {
        let tpm = TpmConfig { state_dir: PathBuf::from("/s/cp0-tpm"), tpm2: true };
        assert_eq!(
            swtpm_args(&tpm).join(" "),
            "socket --tpmstate dir=/s/cp0-tpm,mode=0644 \
             --ctrl type=unixio,path=/s/cp0-tpm/swtpm.sock \
             --pid file=/s/cp0-tpm/swtpm.pid \
             --log file=/s/cp0-tpm/swtpm.log,level=20 --tpm2"
        );
        let tpm12 = TpmConfig { tpm2: false, ..tpm };
        assert!(!swtpm_args(&tpm12).contains(&"--tpm2".to_string()));
    }

    #[tokio::test]
    async fn socket_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("swtpm.sock");
        let err = wait_for_socket(&sock, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        std::fs::write(&sock, "").unwrap();
        wait_for_socket(&sock, Duration::from_millis(200)).await.unwrap();
    }
}
