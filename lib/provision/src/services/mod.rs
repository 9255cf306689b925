// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Auxiliary services the cluster bootstraps from.
//!
//! Each service runs as a detached child re-executing the provisioning
//! binary with a hidden sub-command, and is tracked by a PID file in the
//! cluster state directory.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use slog::{info, Logger};

use crate::process::{self, Detached};
use crate::state::{DnsConfig, LoadBalancerConfig, State};

pub mod dhcpd;
pub mod dnsd;
pub mod httpd;
pub mod ipxe;
pub mod json_logs;
pub mod kms;
pub mod loadbalancer;
pub mod tftp;
pub mod virtiofsd;

pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumIter)]
pub enum AuxService {
    #[strum(serialize = "lb")]
    LoadBalancer,
    #[strum(serialize = "dhcpd")]
    Dhcpd,
    #[strum(serialize = "dnsd")]
    Dnsd,
    #[strum(serialize = "kms")]
    Kms,
    #[strum(serialize = "json-logs")]
    JsonLogs,
    #[strum(serialize = "virtiofsd")]
    Virtiofsd,
}

impl AuxService {
    pub fn subcommand(&self) -> &'static str {
        match self {
            AuxService::LoadBalancer => "loadbalancer-launch",
            AuxService::Dhcpd => "dhcpd-launch",
            AuxService::Dnsd => "dnsd-launch",
            AuxService::Kms => "kms-launch",
            AuxService::JsonLogs => "json-logs-launch",
            AuxService::Virtiofsd => "virtiofsd-launch",
        }
    }

    pub fn pid_path(&self, state: &State) -> PathBuf {
        state.path(format!("{self}.pid"))
    }

    pub fn log_path(&self, state: &State) -> PathBuf {
        state.path(format!("{self}.log"))
    }

    pub fn is_running(&self, state: &State) -> bool {
        process::pidfile_alive(&self.pid_path(state))
    }

    fn spawn(&self, log: &Logger, state: &State, args: Vec<String>) -> Result<u32> {
        if state.self_executable.as_os_str().is_empty() {
            bail!("state has no executable to launch {self} with");
        }
        let mut argv = vec![self.subcommand().to_string()];
        argv.extend(args);
        let pid = Detached {
            executable: &state.self_executable,
            args: argv,
            log_path: self.log_path(state),
            pid_path: self.pid_path(state),
            stdin: None,
        }
        .spawn(log)?;
        info!(log, "started service"; "service" => %self, "pid" => pid);
        Ok(pid)
    }

    /// SIGTERM the service and wait for it. Not running is not an error.
    pub async fn stop(&self, state: &State) -> Result<()> {
        process::stop_process_by_pidfile(&self.pid_path(state)).await
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

pub fn load_balancer_args(cfg: &LoadBalancerConfig) -> Vec<String> {
    vec![
        "--addr".to_string(),
        cfg.bind_address.to_string(),
        "--upstreams".to_string(),
        join(&cfg.upstreams),
        "--ports".to_string(),
        join(&cfg.ports),
    ]
}

pub fn start_load_balancer(log: &Logger, state: &State) -> Result<u32> {
    let Some(cfg) = &state.lb_config else {
        bail!("cluster has no load balancer configuration");
    };
    AuxService::LoadBalancer.spawn(log, state, load_balancer_args(cfg))
}

pub fn dhcpd_args(state: &State, ipxe_dir: Option<&Path>) -> Result<Vec<String>> {
    let Some(cfg) = &state.dhcp_config else {
        bail!("cluster has no DHCP configuration");
    };
    let mut args = vec![
        "--state-path".to_string(),
        state.state_path().display().to_string(),
        "--addr".to_string(),
        join(&cfg.gateway_addrs),
        "--interface".to_string(),
        cfg.interface.clone(),
    ];
    if let Some(next) = &cfg.ipxe_boot_script {
        args.extend(["--ipxe-next-handler".to_string(), next.clone()]);
        if let Some(dir) = ipxe_dir {
            args.extend(["--ipxe-dir".to_string(), dir.display().to_string()]);
        }
    }
    Ok(args)
}

pub fn start_dhcpd(log: &Logger, state: &State, ipxe_dir: Option<&Path>) -> Result<u32> {
    AuxService::Dhcpd.spawn(log, state, dhcpd_args(state, ipxe_dir)?)
}

pub fn dnsd_args(cfg: &DnsConfig) -> Vec<String> {
    vec![
        "--addr".to_string(),
        join(&cfg.bind_addrs),
        "--resolv-conf".to_string(),
        cfg.resolv_conf.display().to_string(),
    ]
}

pub fn start_dnsd(log: &Logger, state: &State) -> Result<u32> {
    let Some(cfg) = &state.dns_config else {
        bail!("cluster has no DNS configuration");
    };
    AuxService::Dnsd.spawn(log, state, dnsd_args(cfg))
}

pub fn start_kms(log: &Logger, state: &State, addr: SocketAddr, key: &str) -> Result<u32> {
    let args = vec![
        "--addr".to_string(),
        addr.to_string(),
        "--key".to_string(),
        key.to_string(),
    ];
    AuxService::Kms.spawn(log, state, args)
}

pub fn start_json_logs(log: &Logger, state: &State, addr: SocketAddr) -> Result<u32> {
    AuxService::JsonLogs.spawn(log, state, vec!["--addr".to_string(), addr.to_string()])
}

pub fn start_virtiofsd(
    log: &Logger,
    state: &State,
    bin: &Path,
    shares: &[virtiofsd::Share],
) -> Result<u32> {
    let args = vec![
        "--bin".to_string(),
        bin.display().to_string(),
        "--virtiofs".to_string(),
        join(shares),
    ];
    AuxService::Virtiofsd.spawn(log, state, args)
}

/// Default DNS listener config: the gateways, forwarding to the host
/// resolver.
pub fn dns_config(gateways: &[IpAddr]) -> DnsConfig {
    DnsConfig {
        bind_addrs: gateways.to_vec(),
        resolv_conf: PathBuf::from(DEFAULT_RESOLV_CONF),
    }
}
