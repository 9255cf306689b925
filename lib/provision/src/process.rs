// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Detached child processes tracked through PID files.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use slog::{debug, info, Logger};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// A child re-executing the provisioning binary with a hidden sub-command.
pub struct Detached<'a> {
    pub executable: &'a Path,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
    /// Replayed on the child's stdin.
    pub stdin: Option<PathBuf>,
}

impl Detached<'_> {
    /// Spawn in a new session with stdout/stderr appended to the log file,
    /// and record the PID. The child is not waited on.
    pub fn spawn(self, log: &Logger) -> Result<u32> {
        let logfile = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| {
                format!("failed to open {}", self.log_path.display())
            })?;
        let stderr = logfile.try_clone().context("failed to dup log file")?;
        let stdin = match &self.stdin {
            Some(path) => Stdio::from(File::open(path).with_context(|| {
                format!("failed to open {}", path.display())
            })?),
            None => Stdio::null(),
        };

        let mut cmd = Command::new(self.executable);
        cmd.args(&self.args)
            .stdin(stdin)
            .stdout(logfile)
            .stderr(stderr);
        // SAFETY: setsid(2) is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map(drop).map_err(std::io::Error::from)
            });
        }
        let child = cmd.spawn().with_context(|| {
            format!("failed to spawn {}", display_cmd(self.executable, &self.args))
        })?;
        let pid = child.id();
        fs::write(&self.pid_path, pid.to_string()).with_context(|| {
            format!("failed to write {}", self.pid_path.display())
        })?;
        debug!(log, "spawned detached process";
            "pid" => pid,
            "cmd" => display_cmd(self.executable, &self.args));
        Ok(pid)
    }
}

fn display_cmd(exe: &Path, args: &[String]) -> String {
    std::iter::once(exe.as_os_str())
        .chain(args.iter().map(OsStr::new))
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A token cancelled on SIGTERM or SIGINT. SIGHUP is swallowed so a
/// detached child survives its session going away.
pub fn cancel_on_signals(log: &Logger) -> Result<CancellationToken> {
    let mut term = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut hup = signal(SignalKind::hangup()).context("SIGHUP handler")?;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let log = log.clone();
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
                _ = hup.recv() => continue,
            };
            info!(log, "received signal, stopping"; "signal" => name);
            token.cancel();
        }
    });
    Ok(cancel)
}

/// First match for `name` on `$PATH`; names with a slash are checked as
/// given.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if name.contains('/') {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Run `program` to completion and return its stdout. A non-zero exit is
/// an error carrying stderr.
pub async fn run<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> =
        args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let output = tokio::process::Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !output.status.success() {
        let args: Vec<_> =
            args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        bail!(
            "{} failed ({}): {}",
            display_cmd(Path::new(program), &args),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// PID recorded in `path`, or `None` when the file does not exist.
pub fn read_pidfile(path: &Path) -> Result<Option<Pid>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let pid: i32 = contents
        .trim()
        .parse()
        .with_context(|| format!("malformed PID file {}", path.display()))?;
    Ok(Some(Pid::from_raw(pid)))
}

pub fn is_alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

/// True when `path` names a process that is still running.
pub fn pidfile_alive(path: &Path) -> bool {
    matches!(read_pidfile(path), Ok(Some(pid)) if is_alive(pid))
}

/// Send SIGTERM to the process in `path` and wait for it to go away.
///
/// A missing PID file or an already-exited process counts as stopped.
pub async fn stop_process_by_pidfile(path: &Path) -> Result<()> {
    let Some(pid) = read_pidfile(path)? else {
        return Ok(());
    };
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => bail!("failed to signal process {pid}: {e}"),
    }
    wait_for_exit(pid).await;
    Ok(())
}

/// Wait for `pid` to exit, reaping it when it is our child.
async fn wait_for_exit(pid: Pid) {
    use nix::sys::wait::{waitpid, WaitPidFlag};

    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            // Not our child: fall back to polling for existence.
            Err(Errno::ECHILD) => {
                if !is_alive(pid) {
                    return;
                }
            }
            Ok(nix::sys::wait::WaitStatus::StillAlive) => {}
            Ok(_) | Err(_) => return,
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
