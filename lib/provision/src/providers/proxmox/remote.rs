// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Work done on the hypervisor host itself, over SSH.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ipam::MacAddr;
use regex::Regex;
use serde::Deserialize;
use slog::{debug, info, Logger};
use tokio_util::sync::CancellationToken;

use super::client::Client;
use super::vm::serial_log_path;
use crate::process;
use crate::services;
use crate::state::State;
use crate::Error;

/// Local file holding the PID of the DHCP server on the hypervisor.
pub const REMOTE_DHCPD_PID_FILE: &str = "dhcpd.remote.pid";

/// Parent of the per-cluster directories copied to the hypervisor.
const REMOTE_ROOT: &str = "/tmp/talos-provision";

const LEASE_FILES: &[&str] = &[
    "/var/lib/dhcp/dhcpd.leases",
    "/var/lib/dhcpd/dhcpd.leases",
    "/var/db/dhcpd.leases",
];

const SERIAL_POLL_START: Duration = Duration::from_secs(2);
const SERIAL_POLL_MAX: Duration = Duration::from_secs(10);
const FINGERPRINT_WAIT: Duration = Duration::from_secs(30);

/// `'...'` quoting for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The hypervisor host, reached as root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remote {
    host: String,
}

impl Remote {
    /// The host named by the API URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::UserInput(format!("invalid PROXMOX_URL {url:?}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::UserInput(format!("PROXMOX_URL {url:?} has no host")))?;
        Ok(Self { host: host.to_string() })
    }

    fn target(&self) -> String {
        format!("root@{}", self.host)
    }

    fn ssh_opts() -> [&'static str; 4] {
        ["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]
    }

    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args: Vec<String> = Self::ssh_opts().iter().map(|s| s.to_string()).collect();
        args.push(self.target());
        args.push(command.to_string());
        args
    }

    pub async fn run(&self, command: &str) -> Result<String> {
        process::run("ssh", self.ssh_args(command)).await
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        let mut args: Vec<String> = Self::ssh_opts().iter().map(|s| s.to_string()).collect();
        args.push("-r".to_string());
        args.push(local.display().to_string());
        args.push(format!("{}:{remote}", self.target()));
        process::run("scp", args).await.map(drop)
    }
}

fn remote_dir(state: &State) -> String {
    format!("{REMOTE_ROOT}/{}", state.cluster_name())
}

/// Shell line that starts the DHCP server in the background on the
/// hypervisor and prints its PID.
pub fn dhcpd_command(state: &State) -> Result<String> {
    let dir = remote_dir(state);
    let mut args = services::dhcpd_args(state, None)?;
    if let Some(i) = args.iter().position(|a| a == "--state-path") {
        args[i + 1] = dir.clone();
    }
    let mut cmd = vec![
        "nohup".to_string(),
        shell_quote(&format!("{dir}/provisioner")),
        "dhcpd-launch".to_string(),
    ];
    cmd.extend(args.iter().map(|a| shell_quote(a)));
    Ok(format!(
        "{} > {} 2>&1 < /dev/null & echo $!",
        cmd.join(" "),
        shell_quote(&format!("{dir}/dhcpd.log"))
    ))
}

/// Copy the cluster state and this executable to the hypervisor and run
/// the DHCP server there. The remote PID is recorded locally.
pub async fn start_dhcpd(log: &Logger, remote: &Remote, state: &State) -> Result<u32> {
    let exe = state.self_executable.clone();
    remote
        .run(&format!("mkdir -p {}", shell_quote(REMOTE_ROOT)))
        .await
        .context("failed to prepare remote directory")?;
    remote
        .copy(state.state_path(), REMOTE_ROOT)
        .await
        .context("failed to copy cluster state to the hypervisor")?;
    remote
        .copy(&exe, &format!("{}/provisioner", remote_dir(state)))
        .await
        .context("failed to copy executable to the hypervisor")?;

    let out = remote.run(&dhcpd_command(state)?).await?;
    let pid: u32 = out
        .trim()
        .parse()
        .map_err(|_| anyhow!("unexpected output starting remote DHCP server: {out:?}"))?;
    std::fs::write(state.path(REMOTE_DHCPD_PID_FILE), pid.to_string())
        .context("failed to record remote DHCP server PID")?;
    info!(log, "remote DHCP server started"; "pid" => pid);
    Ok(pid)
}

/// Kill the remote DHCP server, if one was started, and remove its files.
pub async fn stop_dhcpd(remote: &Remote, state: &State) -> Result<()> {
    let pid_path = state.path(REMOTE_DHCPD_PID_FILE);
    let pid = match std::fs::read_to_string(&pid_path) {
        Ok(p) => p.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("failed to read remote DHCP server PID"),
    };
    let pid: u32 = pid
        .parse()
        .map_err(|_| anyhow!("malformed PID {pid:?} in {}", pid_path.display()))?;
    remote
        .run(&format!(
            "kill {pid} 2>/dev/null; rm -rf {}",
            shell_quote(&remote_dir(state))
        ))
        .await
        .context("failed to stop remote DHCP server")?;
    std::fs::remove_file(&pid_path).context("failed to remove PID file")
}

/// What a booting node announced on its console.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialDiscovery {
    pub node_ip: Option<IpAddr>,
    pub fingerprint: Option<String>,
}

impl SerialDiscovery {
    pub fn is_complete(&self) -> bool {
        self.node_ip.is_some() && self.fingerprint.is_some()
    }
}

/// Scan console output for the node address and TLS fingerprint lines.
/// Later lines win.
pub fn parse_serial_log(text: &str) -> Result<SerialDiscovery> {
    let ip_re = Regex::new(r"this machine is reachable at:\s*(\d+\.\d+\.\d+\.\d+)")?;
    let fp_re = Regex::new(r#"server certificate issued.*?fingerprint:\s*"([^"]+)""#)?;
    let mut found = SerialDiscovery::default();
    for line in text.lines() {
        if let Some(ip) = ip_re
            .captures(line)
            .and_then(|c| c[1].parse::<Ipv4Addr>().ok())
        {
            found.node_ip = Some(IpAddr::V4(ip));
        }
        if let Some(c) = fp_re.captures(line) {
            found.fingerprint = Some(c[1].to_string());
        }
    }
    Ok(found)
}

#[derive(Deserialize)]
struct AgentInterface {
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
}

/// The agent endpoint answers either with the list or wrapped in `result`.
#[derive(Deserialize)]
#[serde(untagged)]
enum AgentResponse {
    Wrapped { result: Vec<AgentInterface> },
    Bare(Vec<AgentInterface>),
}

fn first_agent_ipv4(resp: AgentResponse) -> Option<IpAddr> {
    let ifaces = match resp {
        AgentResponse::Wrapped { result } => result,
        AgentResponse::Bare(list) => list,
    };
    ifaces
        .iter()
        .flat_map(|i| &i.ip_addresses)
        .filter(|a| a.ip_address_type == "ipv4")
        .filter_map(|a| a.ip_address.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback())
        .map(IpAddr::V4)
}

fn parse_addr(out: &str) -> Option<IpAddr> {
    out.lines().rev().find_map(|l| l.trim().parse().ok())
}

/// Finds the address a VM got, trying the guest agent, the ARP table,
/// the serial console and DHCP leases in turn.
pub struct Discovery<'a> {
    pub log: &'a Logger,
    pub client: &'a Client,
    pub remote: &'a Remote,
    pub node: &'a str,
    pub cancel: &'a CancellationToken,
}

impl Discovery<'_> {
    async fn via_agent(&self, vmid: u32) -> Result<IpAddr> {
        let resp: AgentResponse = self
            .client
            .get(&format!(
                "/nodes/{}/qemu/{vmid}/agent/network-get-interfaces",
                self.node
            ))
            .await?;
        first_agent_ipv4(resp).ok_or_else(|| anyhow!("guest agent reports no IPv4 address"))
    }

    async fn via_arp(&self, mac: &MacAddr) -> Result<IpAddr> {
        let out = self
            .remote
            .run(&format!(
                "arp -an | grep -i {} | awk '{{print $2}}' | tr -d '()'",
                shell_quote(&mac.to_string())
            ))
            .await?;
        parse_addr(&out).ok_or_else(|| anyhow!("{mac} not in ARP table"))
    }

    async fn via_leases(&self, mac: &MacAddr) -> Result<IpAddr> {
        for file in LEASE_FILES {
            // Leases are `lease <ip> {` blocks followed by the hardware line.
            let cmd = format!(
                "grep -i -B 8 {} {file} 2>/dev/null | grep '^lease' | tail -1 | awk '{{print $2}}'",
                shell_quote(&format!("hardware ethernet {mac}"))
            );
            match self.remote.run(&cmd).await {
                Ok(out) => {
                    if let Some(ip) = parse_addr(&out) {
                        return Ok(ip);
                    }
                }
                Err(e) => debug!(self.log, "lease lookup failed"; "file" => file, "error" => %e),
            }
        }
        Err(anyhow!("{mac} not in DHCP leases"))
    }

    async fn read_serial(&self, vmid: u32, secs: u64) -> Result<String> {
        let socket = format!("/var/run/qemu-server/{vmid}.serial0");
        self.remote
            .run(&format!(
                "cat {log} 2>/dev/null || timeout {secs} socat -u UNIX-CONNECT:{socket} - 2>/dev/null || true",
                log = shell_quote(&serial_log_path(vmid)),
                socket = shell_quote(&socket),
            ))
            .await
    }

    async fn via_serial(&self, vmid: u32, timeout: Duration) -> Result<SerialDiscovery> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = SERIAL_POLL_START;
        let mut last = SerialDiscovery::default();
        while tokio::time::Instant::now() < deadline {
            match self.read_serial(vmid, 5).await {
                Ok(out) => {
                    last = parse_serial_log(&out)?;
                    if last.is_complete() {
                        return Ok(last);
                    }
                }
                Err(e) => debug!(self.log, "serial read failed"; "vmid" => vmid, "error" => %e),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Stopped.into()),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(SERIAL_POLL_MAX);
        }
        if last.node_ip.is_some() {
            return Ok(last);
        }
        Err(anyhow!("timed out reading serial output of VM {vmid}"))
    }

    async fn fingerprint(&self, vmid: u32) -> Option<String> {
        let out = self.read_serial(vmid, FINGERPRINT_WAIT.as_secs()).await.ok()?;
        parse_serial_log(&out).ok()?.fingerprint
    }

    pub async fn discover(
        &self,
        vmid: u32,
        mac: &MacAddr,
        timeout: Duration,
    ) -> Result<SerialDiscovery> {
        let quick = match self.via_agent(vmid).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!(self.log, "guest agent lookup failed"; "vmid" => vmid, "error" => %e);
                self.via_arp(mac).await.ok()
            }
        };
        if let Some(ip) = quick {
            return Ok(SerialDiscovery {
                node_ip: Some(ip),
                fingerprint: self.fingerprint(vmid).await,
            });
        }

        match self.via_serial(vmid, timeout).await {
            Ok(found) => return Ok(found),
            Err(e) if crate::is_stopped(&e) => return Err(e),
            Err(e) => debug!(self.log, "serial discovery failed"; "vmid" => vmid, "error" => %e),
        }

        let ip = self
            .via_leases(mac)
            .await
            .with_context(|| format!("failed to discover the address of VM {vmid}"))?;
        Ok(SerialDiscovery { node_ip: Some(ip), fingerprint: self.fingerprint(vmid).await })
    }
}
