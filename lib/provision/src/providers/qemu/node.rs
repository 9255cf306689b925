// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Materializing a single node: disks, firmware, launch config and the
//! detached launcher process.

use std::fs;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use provision_types::{
    Arch, BootAssets, ClusterRequest, ConfigInjection, DiskDriver, NodeInfo,
    NodeRequest, Options, TpmVersion,
};
use slog::{info, Logger};
use socket2::{Domain, Socket, Type};

use crate::disks;
use crate::launcher::{
    DiskConfig, LaunchConfig, NetworkConfig, TpmConfig, VirtiofsConfig,
    CONFIG_URL_PLACEHOLDER,
};
use crate::process::{self, Detached};
use crate::state::State;
use crate::Error;

use super::pflash;

/// Replaced in asset paths by the target architecture.
pub const ARCH_VARIABLE: &str = "${ARCH}";

/// Hardening defaults every node boots with.
const DEFAULT_KERNEL_ARGS: &[&str] = &[
    "init_on_alloc=1",
    "slab_nomerge",
    "pti=on",
    "consoleblank=0",
    "nvme_core.io_timeout=4294967295",
    "printk.devkmsg=on",
    "ima_template=ima-ng",
    "ima_appraise=fix",
    "ima_hash=sha512",
];

/// An ordered kernel command line. Setting a key that is already present
/// replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cmdline(Vec<(String, Option<String>)>);

impl Cmdline {
    pub fn set(&mut self, key: &str, value: Option<&str>) {
        let value = value.map(str::to_string);
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn delete(&mut self, key: &str) {
        self.0.retain(|(k, _)| k != key);
    }

    /// Apply `key=value`, bare `key` and `-key` (removal) arguments.
    pub fn apply(&mut self, arg: &str) {
        if let Some(key) = arg.strip_prefix('-') {
            self.delete(key);
            return;
        }
        match arg.split_once('=') {
            Some((k, v)) => self.set(k, Some(v)),
            None => self.set(arg, None),
        }
    }
}

impl std::fmt::Display for Cmdline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match v {
                Some(v) => write!(f, "{k}={v}")?,
                None => f.write_str(k)?,
            }
        }
        Ok(())
    }
}

pub fn kernel_cmdline(
    arch: Arch,
    extra_args: &[String],
    debug_shell: bool,
    config: Option<ConfigInjection>,
) -> Cmdline {
    let mut cmdline = Cmdline::default();
    for arg in DEFAULT_KERNEL_ARGS {
        cmdline.apply(arg);
    }
    cmdline.set("console", Some(arch.console()));
    cmdline.set("reboot", Some("k"));
    cmdline.set("panic", Some("1"));
    cmdline.set("talos.shutdown", Some("halt"));
    cmdline.set("talos.platform", Some("metal"));
    for arg in extra_args {
        cmdline.apply(arg);
    }
    if debug_shell {
        cmdline.set("talos.debugshell", None);
    }
    match config {
        Some(ConfigInjection::Http) => {
            cmdline.set("talos.config", Some(CONFIG_URL_PLACEHOLDER))
        }
        Some(ConfigInjection::MetalIso) => {
            cmdline.set("talos.config", Some("metal-iso"))
        }
        None => {}
    }
    cmdline
}

/// Substitute the target architecture into an asset path.
pub fn arch_path(path: &Path, arch: Arch) -> PathBuf {
    PathBuf::from(
        path.to_string_lossy().replace(ARCH_VARIABLE, &arch.to_string()),
    )
}

/// API ports handed out to launchers during one provisioning run.
///
/// Each port stays bound, but not listening, until the set is dropped:
/// the kernel will not give it to another socket and a later node cannot
/// pick it, while the launcher's `SO_REUSEADDR` listener can still take
/// it over.
#[derive(Default)]
pub(super) struct ApiPorts {
    held: Mutex<Vec<Socket>>,
}

impl ApiPorts {
    pub(super) fn reserve(&self, gateway: IpAddr) -> Result<SocketAddr> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let taken: HashSet<u16> = held
            .iter()
            .filter_map(|s| s.local_addr().ok()?.as_socket())
            .map(|a| a.port())
            .collect();
        for _ in 0..16 {
            let (socket, addr) = bind_unlistened(gateway).with_context(|| {
                format!("error finding listen address for the API on {gateway}")
            })?;
            if !taken.contains(&addr.port()) {
                held.push(socket);
                return Ok(addr);
            }
        }
        Err(Error::Resource(format!("no free API port on {gateway}")).into())
    }
}

fn bind_unlistened(ip: IpAddr) -> std::io::Result<(Socket, SocketAddr)> {
    let addr = SocketAddr::new(ip, 0);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    let local = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| std::io::Error::other("bound to a non-IP address"))?;
    Ok((socket, local))
}

/// Build the `metal-iso` volume carrying `config.yaml`.
async fn create_metal_config_iso(
    state: &State,
    node: &str,
    config: &str,
) -> Result<PathBuf> {
    let iso_path = state.path(format!("{node}-metal-config.iso"));
    let dir = tempfile::Builder::new()
        .prefix("talos-metal-config-iso")
        .tempdir()
        .context("failed to create temporary directory")?;
    fs::write(dir.path().join("config.yaml"), config)
        .context("failed to write config.yaml")?;
    let iso_arg = iso_path.display().to_string();
    let dir_arg = dir.path().display().to_string();
    process::run(
        "mkisofs",
        ["-joliet", "-rock", "-volid", "metal-iso", "-output", &iso_arg, &dir_arg],
    )
    .await
    .context("error creating metal-iso")?;
    Ok(iso_path)
}

/// What the nodes of one provisioning run share.
pub(super) struct NodeContext<'a> {
    pub log: &'a Logger,
    pub state: &'a State,
    pub request: &'a ClusterRequest,
    pub opts: &'a Options,
    /// Boot assets with the architecture substituted.
    pub assets: &'a BootAssets,
    pub api_ports: &'a ApiPorts,
}

pub fn config_path(state: &State, node: &str) -> PathBuf {
    state.path(format!("{node}.config"))
}

pub fn pid_path(state: &State, node: &str) -> PathBuf {
    state.path(format!("{node}.pid"))
}

pub fn log_path(state: &State, node: &str) -> PathBuf {
    state.path(format!("{node}.log"))
}

/// `<state>/<node>-<i>.sock` for the `i`th disk when it is a virtiofs
/// share.
pub fn virtiofs_socket(state: &State, node: &str, index: usize) -> PathBuf {
    state.path(format!("{node}-{index}.sock"))
}

/// Prepare the launch config of `node`. Touches the state directory
/// (disks, firmware, TPM, metal ISO) but spawns nothing.
pub(super) async fn prepare(
    ctx: &NodeContext<'_>,
    node: &NodeRequest,
) -> Result<(LaunchConfig, NodeInfo)> {
    let NodeContext { state, request, opts, assets, api_ports, .. } = ctx;
    let arch = opts.target_arch;
    let gateway = *request.network.gateway_addrs.first().ok_or_else(|| {
        Error::UserInput("network has no gateway address".to_string())
    })?;

    let pflash_images = pflash::create_images(
        state.state_path(),
        &node.name,
        &pflash::specs(arch, opts.uefi_enabled),
    )
    .context("error creating flash images")?;

    let disk_paths = disks::create_disks(state.state_path(), node)?;
    if let (Some(image), Some(first)) =
        (&assets.disk_image_path, disk_paths.first())
    {
        let (image, first) = (image.clone(), first.clone());
        tokio::task::spawn_blocking(move || {
            disks::populate_system_disk(&first, &image)
        })
        .await
        .context("disk population task failed")??;
    }

    let mut file_disks = disk_paths.into_iter();
    let mut disks = Vec::new();
    let mut virtiofs = Vec::new();
    for (i, disk) in node.disks.iter().enumerate() {
        let driver = disk.driver_at(i);
        if driver == DiskDriver::Virtiofs {
            virtiofs.push(VirtiofsConfig {
                socket: virtiofs_socket(state, &node.name, i),
                tag: disk.tag.clone().unwrap_or_else(|| format!("virtiofs{i}")),
            });
            continue;
        }
        let Some(path) = file_disks.next() else { break };
        disks.push(DiskConfig { path, driver, block_size: disk.block_size() });
    }

    let injection = match (&node.config, node.skip_injecting_config) {
        (Some(_), false) => Some(opts.config_injection),
        _ => None,
    };
    let cmdline = kernel_cmdline(
        arch,
        &node.extra_kernel_args,
        opts.with_debug_shell,
        injection,
    );
    let config = match injection {
        Some(_) => node.config.clone().unwrap_or_default(),
        None => String::new(),
    };
    let extra_iso_path = match injection {
        Some(ConfigInjection::MetalIso) => {
            Some(create_metal_config_iso(state, &node.name, &config).await?)
        }
        _ => None,
    };

    let node_uuid = node.uuid.unwrap_or_else(uuid::Uuid::new_v4);
    let api_bind = api_ports.reserve(gateway)?;

    let (tftp_server, ipxe_boot_filename) = if request.ipxe_boot_script.is_some()
    {
        (Some(gateway.to_string()), Some(format!("ipxe/{arch}/snp.efi")))
    } else {
        (
            node.tftp_server.map(|ip| ip.to_string()),
            node.ipxe_boot_filename.clone(),
        )
    };

    let tpm = match opts.tpm {
        Some(version) => {
            let state_dir = state.path(format!("{}-tpm", node.name));
            fs::create_dir_all(&state_dir).with_context(|| {
                format!("failed to create {}", state_dir.display())
            })?;
            Some(TpmConfig { state_dir, tpm2: version == TpmVersion::V2_0 })
        }
        None => None,
    };

    let vm_cni_config = state.vm_cni_config.clone().ok_or_else(|| {
        anyhow::anyhow!("cluster state has no VM network configuration")
    })?;
    let network = NetworkConfig {
        bridge_name: state.bridge_name.clone(),
        cidrs: request.network.cidrs.clone(),
        no_masquerade_cidrs: request.network.no_masquerade_cidrs.clone(),
        ips: node.ips.clone(),
        gateway_addrs: request.network.gateway_addrs.clone(),
        mtu: request.network.mtu,
        nameservers: request.network.nameservers.clone(),
        hostname: (!request.network.dhcp_skip_hostname)
            .then(|| node.name.clone()),
        cni: request.network.cni.clone(),
        vm_cni_config,
    };

    let boots_assets = !node.pxe_booted && ipxe_boot_filename.is_none();
    let asset = |p: &Option<PathBuf>| if boots_assets { p.clone() } else { None };

    let launch = LaunchConfig {
        state_path: state.state_path().to_path_buf(),
        node_name: node.name.clone(),
        arch,
        enable_kvm: opts.use_kvm,
        disks,
        virtiofs,
        vcpus: node.vcpus(),
        memory_mib: node.memory_mib(),
        kernel_args: cmdline.to_string(),
        kernel_path: asset(&assets.kernel_path),
        initrd_path: asset(&assets.initramfs_path),
        iso_path: asset(&assets.iso_path),
        extra_iso_path,
        usb_path: asset(&assets.usb_path),
        uki_path: asset(&assets.uki_path),
        pflash_images,
        monitor_path: state.path(format!("{}.monitor", node.name)),
        bootloader_enabled: opts.bootloader_enabled,
        iommu_enabled: opts.iommu_enabled,
        tpm: tpm.clone(),
        node_uuid,
        bad_rtc: node.bad_rtc,
        default_boot_order: node.default_boot_order.clone(),
        with_debug_shell: opts.with_debug_shell,
        network,
        tftp_server,
        ipxe_boot_filename,
        api_bind,
        config,
    };

    let info = NodeInfo {
        id: pid_path(state, &node.name).display().to_string(),
        uuid: node_uuid,
        name: node.name.clone(),
        node_type: node.node_type,
        nano_cpus: node.nano_cpus,
        memory: node.memory,
        disk_size: node.boot_disk_size(),
        ips: node.ips.clone(),
        api_port: api_bind.port(),
        tpm_state_dir: tpm.map(|t| t.state_dir),
    };
    Ok((launch, info))
}

/// Persist `<node>.config` and start `qemu-launch` on it.
pub(super) fn spawn_launcher(
    log: &Logger,
    state: &State,
    launch: &LaunchConfig,
) -> Result<u32> {
    let path = config_path(state, &launch.node_name);
    let json = serde_json::to_vec(launch)?;
    fs::write(&path, json)
        .with_context(|| format!("failed to write {}", path.display()))?;
    respawn_launcher(log, state, &launch.node_name)
}

/// Start `qemu-launch` on an existing `<node>.config`.
pub(super) fn respawn_launcher(
    log: &Logger,
    state: &State,
    node: &str,
) -> Result<u32> {
    let pid = Detached {
        executable: &state.self_executable,
        args: vec!["qemu-launch".to_string()],
        log_path: log_path(state, node),
        pid_path: pid_path(state, node),
        stdin: Some(config_path(state, node)),
    }
    .spawn(log)?;
    info!(log, "started launcher"; "node" => node, "pid" => pid);
    Ok(pid)
}

pub(super) async fn create(
    ctx: &NodeContext<'_>,
    node: &NodeRequest,
) -> Result<NodeInfo> {
    let (launch, info) = prepare(ctx, node)
        .await
        .with_context(|| format!("failed to create node {}", node.name))?;
    spawn_launcher(ctx.log, ctx.state, &launch)?;
    Ok(info)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cmdline_order_and_overrides() {
        let extra = vec![
            "console=ttyS1".to_string(),
            "-pti".to_string(),
            "talos.dashboard.disabled=1".to_string(),
        ];
        let cmdline =
            kernel_cmdline(Arch::Amd64, &extra, true, Some(ConfigInjection::Http))
                .to_string();
        assert!(cmdline.starts_with("init_on_alloc=1 slab_nomerge consoleblank=0"));
        assert!(!cmdline.contains("pti=on"));
        assert!(cmdline.contains(
            "console=ttyS1 reboot=k panic=1 talos.shutdown=halt talos.platform=metal"
        ));
        assert!(cmdline.ends_with(
            "talos.dashboard.disabled=1 talos.debugshell talos.config={TALOS_CONFIG_URL}"
        ));
    }

    #[test]
    fn cmdline_metal_iso() {
        let cmdline =
            kernel_cmdline(Arch::Arm64, &[], false, Some(ConfigInjection::MetalIso))
                .to_string();
        assert!(cmdline.contains("console=ttyAMA0"));
        assert!(cmdline.ends_with("talos.config=metal-iso"));
        assert!(!cmdline.contains("talos.debugshell"));

        let none = kernel_cmdline(Arch::Amd64, &[], false, None).to_string();
        assert!(!none.contains("talos.config"));
    }

    #[test]
    fn arch_is_substituted() {
        assert_eq!(
            arch_path(Path::new("_out/vmlinuz-${ARCH}"), Arch::Arm64),
            PathBuf::from("_out/vmlinuz-arm64")
        );
    }

    #[tokio::test]
    async fn reserved_api_ports_stay_taken_until_the_launcher_listens() {
        let ports = ApiPorts::default();
        let gateway: IpAddr = "127.0.0.1".parse().unwrap();
        let a = ports.reserve(gateway).unwrap();
        let b = ports.reserve(gateway).unwrap();
        assert_ne!(a.port(), 0);
        assert_ne!(a.port(), b.port());

        // Plain binds are refused while the reservation is held.
        assert!(std::net::TcpListener::bind(a).is_err());
        let server = crate::services::httpd::HttpServer::bind(
            a,
            crate::services::httpd::Router::new(crate::test_logger()),
        )
        .await
        .unwrap();
        assert_eq!(server.local_addr().unwrap(), a);

        drop(ports);
        assert!(std::net::TcpListener::bind(b).is_ok());
    }
}
