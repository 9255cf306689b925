// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sub-commands the provisioner re-executes itself with. Services run until
//! SIGTERM or SIGINT, which is a clean exit.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures::future::try_join_all;
use provision::process::cancel_on_signals;
use provision::services::{
    dhcpd, dnsd, json_logs, kms, loadbalancer, tftp::FirmwareStore, virtiofsd,
};
use provision::{launcher, providers::qemu::DEFAULT_IPXE_DIR};
use slog::{info, o, Logger};

const DNS_PORT: u16 = 53;

#[derive(Debug, clap::Subcommand)]
pub enum Internal {
    /// Rebuild an initramfs with system extensions appended.
    #[clap(hide = true)]
    ExtensionsBuild {
        #[clap(long)]
        extensions_dir: PathBuf,

        #[clap(long)]
        initramfs: PathBuf,

        #[clap(long)]
        os_version: semver::Version,

        #[clap(long)]
        keep_temp: bool,
    },

    #[clap(flatten)]
    Service(Service),
}

/// Long-running children, stopped by signal.
#[derive(Debug, clap::Subcommand)]
pub enum Service {
    /// Supervise one VM; the launch config is read from stdin.
    #[clap(hide = true)]
    QemuLaunch,

    #[clap(hide = true)]
    DhcpdLaunch {
        #[clap(long)]
        state_path: PathBuf,

        #[clap(long, value_delimiter = ',', required = true)]
        addr: Vec<IpAddr>,

        #[clap(long)]
        interface: String,

        /// URL PXE-booted nodes are chained to
        #[clap(long)]
        ipxe_next_handler: Option<String>,

        #[clap(long, default_value = DEFAULT_IPXE_DIR)]
        ipxe_dir: PathBuf,
    },

    #[clap(hide = true)]
    DnsdLaunch {
        #[clap(long, value_delimiter = ',', required = true)]
        addr: Vec<IpAddr>,

        #[clap(long, default_value = provision::services::DEFAULT_RESOLV_CONF)]
        resolv_conf: PathBuf,
    },

    #[clap(hide = true)]
    LoadbalancerLaunch {
        #[clap(long)]
        addr: IpAddr,

        #[clap(long, value_delimiter = ',', required = true)]
        upstreams: Vec<IpAddr>,

        #[clap(long, value_delimiter = ',', required = true)]
        ports: Vec<u16>,
    },

    #[clap(hide = true)]
    KmsLaunch {
        #[clap(long)]
        addr: SocketAddr,

        /// Base64 AES-256 key
        #[clap(long)]
        key: String,
    },

    #[clap(hide = true)]
    JsonLogsLaunch {
        #[clap(long)]
        addr: SocketAddr,
    },

    #[clap(hide = true)]
    VirtiofsdLaunch {
        #[clap(long)]
        bin: PathBuf,

        /// `dir:socket` pairs
        #[clap(long, value_delimiter = ',', required = true)]
        virtiofs: Vec<virtiofsd::Share>,
    },
}

async fn serve_dns(
    log: Logger,
    addrs: &[IpAddr],
    resolv_conf: PathBuf,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let upstreams = dnsd::load_upstreams(&resolv_conf)?;
    info!(log, "forwarding DNS"; "upstreams" => ?upstreams);
    let forwarder =
        Arc::new(dnsd::Forwarder::new(log, upstreams, Box::new(dnsd::NetExchange)));
    let servers = addrs.iter().flat_map(|ip| {
        let addr = SocketAddr::new(*ip, DNS_PORT);
        [
            tokio::spawn(dnsd::serve_udp(forwarder.clone(), addr, cancel.clone())),
            tokio::spawn(dnsd::serve_tcp(forwarder.clone(), addr, cancel.clone())),
        ]
    });
    for res in try_join_all(servers).await.context("DNS task panicked")? {
        res?;
    }
    Ok(())
}

pub async fn run(log: Logger, cmd: Internal) -> anyhow::Result<()> {
    match cmd {
        Internal::ExtensionsBuild {
            extensions_dir,
            initramfs,
            os_version,
            keep_temp,
        } => {
            let builder = extensions::Builder {
                extensions_dir,
                initramfs_path: initramfs,
                os_version,
                keep_temp,
                log: log.new(o!("component" => "extensions")),
            };
            tokio::task::spawn_blocking(move || builder.build())
                .await
                .context("extension build panicked")?
                .context("extension build failed")
        }
        Internal::Service(service) => serve(log, service).await,
    }
}

async fn serve(log: Logger, service: Service) -> anyhow::Result<()> {
    let cancel = cancel_on_signals(&log)?;
    match service {
        Service::QemuLaunch => {
            let config = launcher::read_config(std::io::stdin().lock())?;
            launcher::launch(log, config, cancel).await
        }
        Service::DhcpdLaunch {
            state_path,
            addr,
            interface,
            ipxe_next_handler,
            ipxe_dir,
        } => {
            let tftp = ipxe_next_handler
                .map(|next| Arc::new(FirmwareStore::new(ipxe_dir, &next)));
            let cfg = dhcpd::DhcpdConfig { state_path, addrs: addr, interface };
            dhcpd::run(log.new(o!("component" => "dhcpd")), cfg, tftp, cancel).await
        }
        Service::DnsdLaunch { addr, resolv_conf } => {
            serve_dns(log.new(o!("component" => "dnsd")), &addr, resolv_conf, cancel)
                .await
        }
        Service::LoadbalancerLaunch { addr, upstreams, ports } => {
            let log = log.new(o!("component" => "lb"));
            loadbalancer::serve(log, addr, &upstreams, &ports, cancel).await
        }
        Service::KmsLaunch { addr, key } => {
            let kms = kms::Kms::new(&key)?;
            kms::serve(log.new(o!("component" => "kms")), addr, kms, cancel).await
        }
        Service::JsonLogsLaunch { addr } => {
            json_logs::serve(log.new(o!("component" => "json-logs")), addr, cancel)
                .await
        }
        Service::VirtiofsdLaunch { bin, virtiofs } => {
            let log = log.new(o!("component" => "virtiofsd"));
            virtiofsd::run(log, &bin, &virtiofs, cancel).await
        }
    }
}
