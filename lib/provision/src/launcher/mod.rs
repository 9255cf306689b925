// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-VM supervisor.
//!
//! A launcher owns exactly one VM for its whole life. It reads a
//! [`LaunchConfig`] from stdin, attaches the VM to the cluster network
//! through the CNI chain, serves the node config and the power endpoints
//! over HTTP, and then starts the hypervisor again every time it exits
//! until it is told to stop.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cni::NetworkConfigList;
use ipnetwork::IpNetwork;
use provision_types::{Arch, BootOrder, CniConfig, DiskDriver};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::controller::{Commands, Controller, PowerState, VmCommand};
use crate::launcher::attachment::Attachment;
use crate::services::httpd::{HttpServer, Router, CONFIG_PATH};
use crate::Error;

pub mod attachment;
pub mod qemu_args;
pub mod tpm;

pub use qemu_args::Boot;
pub use tpm::TpmConfig;

/// Token in the kernel command line replaced by the config URL.
pub const CONFIG_URL_PLACEHOLDER: &str = "{TALOS_CONFIG_URL}";

/// Pause between two starts of the hypervisor.
const RESTART_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub driver: DiskDriver,
    pub block_size: u32,
}

/// A vhost-user-fs share exported by virtiofsd.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtiofsConfig {
    pub socket: PathBuf,
    pub tag: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bridge_name: String,
    pub cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub no_masquerade_cidrs: Vec<IpNetwork>,
    /// One per CIDR.
    pub ips: Vec<IpAddr>,
    pub gateway_addrs: Vec<IpAddr>,
    pub mtu: u32,
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    /// Handed out over DHCP unless suppressed.
    #[serde(default)]
    pub hostname: Option<String>,
    pub cni: CniConfig,
    pub vm_cni_config: NetworkConfigList,
}

/// Everything a launcher needs, snapshotted at node creation so the
/// launcher never reads the cluster state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub state_path: PathBuf,
    pub node_name: String,
    pub arch: Arch,
    pub enable_kvm: bool,
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub virtiofs: Vec<VirtiofsConfig>,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub kernel_args: String,
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    #[serde(default)]
    pub iso_path: Option<PathBuf>,
    /// `metal-iso` volume carrying the config.
    #[serde(default)]
    pub extra_iso_path: Option<PathBuf>,
    #[serde(default)]
    pub usb_path: Option<PathBuf>,
    #[serde(default)]
    pub uki_path: Option<PathBuf>,
    #[serde(default)]
    pub pflash_images: Vec<PathBuf>,
    pub monitor_path: PathBuf,
    pub bootloader_enabled: bool,
    #[serde(default)]
    pub iommu_enabled: bool,
    #[serde(default)]
    pub tpm: Option<TpmConfig>,
    pub node_uuid: Uuid,
    #[serde(default)]
    pub bad_rtc: bool,
    pub default_boot_order: BootOrder,
    #[serde(default)]
    pub with_debug_shell: bool,
    pub network: NetworkConfig,
    #[serde(default)]
    pub tftp_server: Option<String>,
    #[serde(default)]
    pub ipxe_boot_filename: Option<String>,
    pub api_bind: SocketAddr,
    /// Encoded machine config served at `/config.yaml`; empty when not
    /// injected.
    #[serde(default)]
    pub config: String,
}

pub fn read_config<R: Read>(reader: R) -> Result<LaunchConfig> {
    serde_json::from_reader(reader).context("failed to decode launch config")
}

/// Kernel command line with the config URL filled in, and the fragments
/// handed to systemd-stub through SMBIOS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelCmdline {
    pub args: String,
    pub sd_stub: String,
    /// Appended to `sd_stub` when the VM boots a kernel or UKI directly.
    pub sd_stub_config: String,
}

impl KernelCmdline {
    pub fn new(kernel_args: &str, arch: Arch, http: SocketAddr) -> Self {
        let sd_stub = format!("console={}", arch.console());
        if !kernel_args.contains(CONFIG_URL_PLACEHOLDER) {
            return Self {
                args: kernel_args.to_string(),
                sd_stub,
                sd_stub_config: String::new(),
            };
        }
        let url = format!("http://{http}{CONFIG_PATH}");
        Self {
            args: kernel_args.replace(CONFIG_URL_PLACEHOLDER, &url),
            sd_stub,
            sd_stub_config: format!(" talos.config={url}"),
        }
    }
}

/// True when the first disk carries a GPT with at least one partition.
pub fn first_disk_bootable(config: &LaunchConfig) -> bool {
    let Some(disk) = config.disks.first() else {
        return false;
    };
    match std::fs::File::open(&disk.path) {
        Ok(mut f) => bootloader::gpt::has_partitions(&mut f),
        Err(_) => false,
    }
}

/// Run the VM described by `config` until `cancel` fires.
///
/// Cancellation is a clean exit; CNI failures and a vanished controller
/// are errors.
pub async fn launch(
    log: Logger,
    config: LaunchConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let log = log.new(o!("node" => config.node_name.clone()));
    let (ctl, commands) = Controller::new();
    let ctl = Arc::new(ctl);

    let mut router = Router::new(log.new(o!("component" => "httpd")))
        .with_controller(ctl.clone());
    if !config.config.is_empty() {
        router = router.with_file(CONFIG_PATH, config.config.clone());
    }
    let server = HttpServer::bind(config.api_bind, router).await?;
    let http_addr = server.local_addr()?;
    let http_stop = CancellationToken::new();
    let http = tokio::spawn(server.run(http_stop.clone()));
    info!(log, "serving node API"; "addr" => %http_addr);

    let cmdline = KernelCmdline::new(&config.kernel_args, config.arch, http_addr);

    let attachment = match attachment::attach(&log, &config).await {
        Ok(a) => a,
        Err(e) => {
            http_stop.cancel();
            let _ = http.await;
            return Err(e);
        }
    };

    let mut vm = QemuVm { log: log.clone(), config: &config, cmdline: &cmdline, attachment };
    let res = run_loop(&log, &config, &ctl, commands, &mut vm, &cancel).await;

    // The config endpoint outlives the VM.
    http_stop.cancel();
    let _ = http.await;
    if let Err(e) = vm.attachment.detach(&log).await {
        warn!(log, "failed to detach from cluster network"; "error" => %e);
    }

    match res {
        Err(e) if crate::is_stopped(&e) => {
            info!(log, "process stopped");
            Ok(())
        }
        other => other,
    }
}

/// The hypervisor side of the run loop.
#[async_trait]
pub(crate) trait Vm: Send {
    fn spawn(&mut self, boot: &Boot) -> Result<Child>;

    /// Called before every start but the first.
    async fn reset_network(&mut self, log: &Logger) -> Result<()>;
}

struct QemuVm<'a> {
    log: Logger,
    config: &'a LaunchConfig,
    cmdline: &'a KernelCmdline,
    attachment: Attachment,
}

#[async_trait]
impl Vm for QemuVm<'_> {
    fn spawn(&mut self, boot: &Boot) -> Result<Child> {
        let nic = qemu_args::Nic { tap: &self.attachment.tap, mac: &self.attachment.mac };
        let args = qemu_args::qemu_args(self.config, self.cmdline, boot, nic);
        debug!(self.log, "starting hypervisor"; "args" => args.join(" "));
        let mut cmd = Command::new(qemu_args::qemu_binary(self.config.arch));
        cmd.args(&args).kill_on_drop(true);
        self.attachment.netns.apply_to(&mut cmd)?;
        cmd.spawn().context("failed to start hypervisor")
    }

    async fn reset_network(&mut self, log: &Logger) -> Result<()> {
        self.attachment
            .reassign(log, self.config)
            .await
            .context("failed to reattach to cluster network")
    }
}

/// Start the VM whenever it is powered on, until cancelled.
///
/// Network failures between runs end the loop.
pub(crate) async fn run_loop<V: Vm>(
    log: &Logger,
    config: &LaunchConfig,
    ctl: &Controller,
    mut commands: Commands,
    vm: &mut V,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut first = true;
    loop {
        wait_for_power_on(ctl, &mut commands, cancel).await?;
        if !std::mem::take(&mut first) {
            vm.reset_network(log).await?;
        }
        launch_vm(log, config, ctl, &mut commands, vm, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Stopped.into()),
            _ = tokio::time::sleep(RESTART_DEBOUNCE) => {}
        }
    }
}

async fn wait_for_power_on(
    ctl: &Controller,
    commands: &mut Commands,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Stopped.into());
        }
        if ctl.power_state() == PowerState::On {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Stopped.into()),
            cmd = commands.recv() => if cmd.is_none() {
                bail!("VM controller is gone");
            },
        }
    }
}

/// One run of the hypervisor. Returns once it exits or is stopped by a
/// command; a signal yields [`Error::Stopped`].
async fn launch_vm<V: Vm>(
    log: &Logger,
    config: &LaunchConfig,
    ctl: &Controller,
    commands: &mut Commands,
    vm: &mut V,
    cancel: &CancellationToken,
) -> Result<()> {
    let order = if ctl.take_force_pxe_boot() {
        BootOrder::network_first()
    } else {
        config.default_boot_order.clone()
    };
    let boot = Boot {
        order: order.to_string(),
        disk_bootable: config.bootloader_enabled && first_disk_bootable(config),
    };
    if let Some(tpm) = &config.tpm {
        tpm::ensure_running(log, tpm).await?;
    }

    let mut child = vm.spawn(&boot)?;
    info!(log, "VM started";
        "pid" => child.id(), "boot_order" => &boot.order,
        "disk_bootable" => boot.disk_bootable);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                kill(log, &mut child).await;
                return Err(Error::Stopped.into());
            }
            status = child.wait() => {
                let status = status.context("failed to wait for hypervisor")?;
                if status.success() {
                    info!(log, "VM exited");
                } else {
                    warn!(log, "VM exited"; "status" => %status);
                }
                return Ok(());
            }
            cmd = commands.recv() => match cmd {
                Some(VmCommand::Stop) => {
                    info!(log, "stopping VM");
                    kill(log, &mut child).await;
                    return Ok(());
                }
                // Already running.
                Some(VmCommand::Start) => {}
                None => {
                    kill(log, &mut child).await;
                    bail!("VM controller is gone");
                }
            },
        }
    }
}

async fn kill(log: &Logger, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(log, "failed to kill hypervisor"; "error" => %e);
    }
}
