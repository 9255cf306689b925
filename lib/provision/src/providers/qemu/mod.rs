// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local QEMU VMs on a CNI-managed bridge.
//!
//! Each node is supervised by its own detached launcher (`qemu-launch`),
//! and the cluster's load balancer, DHCP and DNS servers run as detached
//! children of the same executable. Everything needed to find them again
//! lives in the cluster state directory.

use std::fs::File;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use provision_types::{
    BootAssets, ClusterInfo, ClusterRequest, DestroyOptions, DiskDriver,
    NetworkRequest, NodeInfo, NodeRequest, NodeRequests, Options,
};
use slog::{info, o, warn, Logger};
use strum::IntoEnumIterator;

use crate::archive;
use crate::network;
use crate::process;
use crate::provisioner::{
    https_endpoint, virtio_dhcp, Cluster, GenOption, Provisioner,
};
use crate::services::{self, virtiofsd::Share, AuxService};
use crate::state::{DhcpConfig, LoadBalancerConfig, State};
use crate::{Error, MultiError};

mod node;
mod pflash;
mod preflight;

pub use node::{kernel_cmdline, Cmdline, ARCH_VARIABLE};

pub const NAME: &str = "qemu";

pub const DEFAULT_IPXE_DIR: &str = "/usr/share/ipxe";

const KUBERNETES_PORT: u16 = 6443;
const DEFAULT_LB_PORTS: [u16; 2] = [KUBERNETES_PORT, 50000];
const KMS_PORT: u16 = 4050;
const MIN_MEMORY: i64 = 2 << 30;
const MIN_BOOT_DISK: u64 = 10 << 30;

pub struct QemuProvisioner {
    log: Logger,
    ipxe_dir: PathBuf,
}

impl QemuProvisioner {
    pub fn new(log: Logger) -> Self {
        Self {
            log: log.new(o!("provisioner" => NAME)),
            ipxe_dir: PathBuf::from(DEFAULT_IPXE_DIR),
        }
    }

    /// Directory the DHCP server's TFTP side serves iPXE firmware from.
    pub fn with_ipxe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ipxe_dir = dir.into();
        self
    }

    async fn provision(
        &self,
        state: &mut State,
        request: &ClusterRequest,
        opts: &Options,
    ) -> Result<()> {
        let log = &self.log;
        let gateway = first_gateway(&request.network)?;

        info!(log, "creating network"; "network" => &request.network.name);
        network::create(log, state, &request.network).await?;
        state.save()?;

        info!(log, "creating load balancer");
        state.lb_config = Some(load_balancer_config(gateway, request));
        services::start_load_balancer(log, state)?;

        info!(log, "creating DHCP server");
        state.dhcp_config = Some(DhcpConfig {
            gateway_addrs: request.network.gateway_addrs.clone(),
            interface: state.bridge_name.clone(),
            ipxe_boot_script: request.ipxe_boot_script.clone(),
        });
        services::start_dhcpd(log, state, Some(self.ipxe_dir.as_path()))?;

        info!(log, "creating DNS server");
        state.dns_config = Some(services::dns_config(&request.network.gateway_addrs));
        services::start_dnsd(log, state)?;

        if let Some(key) = &opts.kms_key {
            info!(log, "creating KMS server");
            services::start_kms(log, state, SocketAddr::new(gateway, KMS_PORT), key)?;
        }
        if let Some(port) = opts.json_logs_port {
            info!(log, "creating JSON logs server");
            services::start_json_logs(log, state, SocketAddr::new(gateway, port))?;
        }
        if !request.mesh_endpoints.is_empty() {
            warn!(log, "mesh endpoints are not supported by this provisioner, ignoring";
                "endpoints" => ?request.mesh_endpoints);
        }

        let shares = virtiofs_shares(state, &request.nodes)?;
        if !shares.is_empty() {
            let bin = opts
                .virtiofsd_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("virtiofsd"));
            services::start_virtiofsd(log, state, &bin, &shares)?;
        }
        state.save()?;

        let assets = self.boot_assets(state, request, opts).await?;
        let mut nodes = Vec::new();
        let mut extra_nodes = Vec::new();
        let res = {
            let api_ports = node::ApiPorts::default();
            let ctx = node::NodeContext {
                log,
                state: &*state,
                request,
                opts,
                assets: &assets,
                api_ports: &api_ports,
            };
            create_all_nodes(&ctx, &request.nodes, &mut nodes, &mut extra_nodes)
                .await
        };

        // Nodes that did come up are recorded even on failure so that
        // cleanup stops their launchers.
        state.cluster_info.nodes = nodes;
        state.cluster_info.extra_nodes = extra_nodes;
        if res.is_ok() {
            state.cluster_info.kubernetes_endpoint =
                https_endpoint(gateway, KUBERNETES_PORT);
        }
        state.save()?;
        res
    }

    /// Boot assets with `${ARCH}` substituted. Without a bootloader, a
    /// kernel and initramfs are pulled out of the disk image when none were
    /// given.
    async fn boot_assets(
        &self,
        state: &State,
        request: &ClusterRequest,
        opts: &Options,
    ) -> Result<BootAssets> {
        let arch = opts.target_arch;
        let sub = |p: &Option<PathBuf>| p.as_deref().map(|p| node::arch_path(p, arch));
        let mut assets = BootAssets {
            kernel_path: sub(&request.assets.kernel_path),
            initramfs_path: sub(&request.assets.initramfs_path),
            iso_path: sub(&request.assets.iso_path),
            usb_path: sub(&request.assets.usb_path),
            uki_path: sub(&request.assets.uki_path),
            disk_image_path: sub(&request.assets.disk_image_path),
        };

        let needs_kernel = !opts.bootloader_enabled
            && assets.kernel_path.is_none()
            && assets.uki_path.is_none();
        if let (true, Some(image)) = (needs_kernel, assets.disk_image_path.clone()) {
            info!(self.log, "extracting kernel from disk image";
                "image" => %image.display());
            let dest = state.state_path().to_path_buf();
            let (kernel, initramfs) = tokio::task::spawn_blocking(move || {
                extract_boot_files(&image, &dest)
            })
            .await
            .context("boot file extraction task failed")??;
            assets.kernel_path = Some(kernel);
            assets.initramfs_path = Some(initramfs);
        }
        Ok(assets)
    }

    async fn cleanup(&self, state: State) {
        let opts = DestroyOptions {
            support_archive_path: None,
            cluster_logs_archive_path: None,
            delete_state_on_err: true,
        };
        if let Err(e) = self.destroy(&Cluster::new(state), &opts).await {
            warn!(self.log, "cleanup after failed create was incomplete";
                "error" => %e);
        }
    }
}

/// Every node needs 2 GiB of memory and a 10 GiB boot disk.
fn check_minimums(nodes: &[NodeRequest]) -> Result<()> {
    for n in nodes {
        if n.memory < MIN_MEMORY {
            return Err(Error::UserInput(format!(
                "node {}: memory must be at least {} MiB",
                n.name,
                MIN_MEMORY >> 20
            ))
            .into());
        }
        if let Some(boot) = n.disks.first() {
            if boot.driver_at(0) != DiskDriver::Virtiofs && boot.size < MIN_BOOT_DISK {
                return Err(Error::UserInput(format!(
                    "node {}: boot disk must be at least {} GiB",
                    n.name,
                    MIN_BOOT_DISK >> 30
                ))
                .into());
            }
        }
    }
    Ok(())
}

fn first_gateway(network: &NetworkRequest) -> Result<IpAddr> {
    network.gateway_addrs.first().copied().ok_or_else(|| {
        Error::UserInput("network has no gateway address".to_string()).into()
    })
}

fn load_balancer_config(
    gateway: IpAddr,
    request: &ClusterRequest,
) -> LoadBalancerConfig {
    let ports = if request.network.load_balancer_ports.is_empty() {
        DEFAULT_LB_PORTS.to_vec()
    } else {
        request.network.load_balancer_ports.clone()
    };
    LoadBalancerConfig {
        bind_address: gateway,
        upstreams: request
            .nodes
            .control_plane_nodes()
            .iter()
            .filter_map(|n| n.ips.first().copied())
            .collect(),
        ports,
    }
}

/// virtiofs shares of every node, each on its own vhost-user socket.
fn virtiofs_shares(state: &State, nodes: &[NodeRequest]) -> Result<Vec<Share>> {
    let mut shares = Vec::new();
    for n in nodes {
        for (i, disk) in n.disks.iter().enumerate() {
            if disk.driver_at(i) != DiskDriver::Virtiofs {
                continue;
            }
            let dir = disk.share.clone().ok_or_else(|| {
                Error::UserInput(format!(
                    "node {}: virtiofs disk {i} has no shared directory",
                    n.name
                ))
            })?;
            shares.push(Share { dir, socket: node::virtiofs_socket(state, &n.name, i) });
        }
    }
    Ok(shares)
}

/// Copy the default boot entry's kernel and initramfs out of `image` into
/// `dest`.
fn extract_boot_files(image: &Path, dest: &Path) -> Result<(PathBuf, PathBuf)> {
    let files = bootloader::extract(image)
        .with_context(|| format!("failed to extract boot files from {}", image.display()))?;
    let kernel = dest.join("vmlinuz");
    let initramfs = dest.join("initramfs.xz");
    std::fs::copy(files.kernel_path(), &kernel)
        .with_context(|| format!("failed to copy kernel to {}", kernel.display()))?;
    std::fs::copy(files.initramfs_path(), &initramfs).with_context(|| {
        format!("failed to copy initramfs to {}", initramfs.display())
    })?;
    files.close().context("failed to remove extracted boot files")?;
    Ok((kernel, initramfs))
}

/// Create control planes, then workers, then PXE nodes. Every node that
/// comes up is pushed to `nodes` or `extra_nodes`, also when a later batch
/// fails.
async fn create_all_nodes(
    ctx: &node::NodeContext<'_>,
    requests: &[NodeRequest],
    nodes: &mut Vec<NodeInfo>,
    extra_nodes: &mut Vec<NodeInfo>,
) -> Result<()> {
    info!(ctx.log, "creating control plane nodes");
    create_nodes(ctx, requests.control_plane_nodes(), nodes).await?;
    info!(ctx.log, "creating worker nodes");
    create_nodes(ctx, requests.worker_nodes(), nodes).await?;
    let pxe = requests.pxe_nodes();
    if !pxe.is_empty() {
        info!(ctx.log, "creating PXE nodes");
        create_nodes(ctx, pxe, extra_nodes).await?;
    }
    Ok(())
}

/// Create `nodes` concurrently, reporting every failure.
async fn create_nodes(
    ctx: &node::NodeContext<'_>,
    nodes: Vec<&NodeRequest>,
    created: &mut Vec<NodeInfo>,
) -> Result<()> {
    let results = join_all(nodes.into_iter().map(|n| node::create(ctx, n))).await;
    let mut errs = MultiError::new();
    created.extend(results.into_iter().filter_map(|r| errs.check(r)));
    errs.into_result()
}

/// PID files in the state directory that belong to neither a recorded node
/// nor an auxiliary service: launchers of a create that failed halfway.
fn stray_launcher_pidfiles(state: &State) -> Result<Vec<PathBuf>> {
    let pattern = state.path("*.pid");
    let pattern = pattern.to_string_lossy();
    let known: Vec<PathBuf> = all_nodes(&state.cluster_info)
        .map(|n| node::pid_path(state, &n.name))
        .chain(AuxService::iter().map(|svc| svc.pid_path(state)))
        .collect();
    let mut stray = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("bad glob {pattern}"))? {
        let path = entry.context("failed to list PID files")?;
        if !known.contains(&path) {
            stray.push(path);
        }
    }
    Ok(stray)
}

fn all_nodes(info: &ClusterInfo) -> impl Iterator<Item = &NodeInfo> {
    info.nodes.iter().chain(&info.extra_nodes)
}

/// Archive of the node logs plus the state the cluster was created from.
fn save_support_archive(state: &State, dest: &Path) -> Result<usize> {
    let mut files = archive::log_files(state.state_path())?;
    files.push(state.path(crate::state::STATE_FILE));
    files.push(state.ipam_path());
    files.retain(|f| f.exists());
    archive::write_tar_gz(dest, state.cluster_name(), &files)
}

#[async_trait]
impl Provisioner for QemuProvisioner {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn create(
        &self,
        request: &ClusterRequest,
        opts: &Options,
    ) -> Result<Cluster> {
        request.validate().map_err(Error::from)?;
        check_minimums(&request.nodes)?;
        if let Some(key) = &opts.kms_key {
            services::kms::Kms::new(key)
                .map_err(|e| Error::UserInput(format!("invalid KMS key: {e}")))?;
        }
        preflight::check(&self.log, request, opts).await?;

        let info = ClusterInfo {
            cluster_name: request.name.clone(),
            network: (&request.network).into(),
            nodes: Vec::new(),
            extra_nodes: Vec::new(),
            kubernetes_endpoint: String::new(),
        };
        let mut state = State::create(NAME, &request.state_directory, info)?;
        state.self_executable = request.self_executable.clone();

        match self.provision(&mut state, request, opts).await {
            Ok(()) => {
                info!(self.log, "cluster created"; "cluster" => &request.name);
                Ok(Cluster::new(state))
            }
            Err(e) => {
                if opts.delete_state_on_err {
                    warn!(self.log, "cluster creation failed, cleaning up";
                        "error" => %e);
                    self.cleanup(state).await;
                }
                Err(e)
            }
        }
    }

    async fn destroy(
        &self,
        cluster: &Cluster,
        opts: &DestroyOptions,
    ) -> Result<()> {
        let log = &self.log;
        let state = cluster.state();
        let mut errs = MultiError::new();

        if let Some(dest) = &opts.support_archive_path {
            info!(log, "saving support archive"; "path" => %dest.display());
            errs.check(save_support_archive(state, dest));
        }

        info!(log, "stopping VMs");
        for n in all_nodes(cluster.info()) {
            let res = process::stop_process_by_pidfile(&node::pid_path(state, &n.name))
                .await
                .with_context(|| format!("failed to stop node {}", n.name));
            errs.check(res);
        }

        match stray_launcher_pidfiles(state) {
            Ok(stray) => {
                for path in stray {
                    warn!(log, "stopping unrecorded launcher"; "pidfile" => %path.display());
                    let res = process::stop_process_by_pidfile(&path)
                        .await
                        .with_context(|| format!("failed to stop {}", path.display()));
                    errs.check(res);
                }
            }
            Err(e) => errs.push(e),
        }

        info!(log, "removing virtual TPMs");
        for dir in all_nodes(cluster.info()).filter_map(|n| n.tpm_state_dir.as_ref()) {
            let res = process::stop_process_by_pidfile(&dir.join("swtpm.pid"))
                .await
                .with_context(|| format!("failed to stop swtpm in {}", dir.display()));
            errs.check(res);
        }

        info!(log, "stopping auxiliary services");
        for svc in AuxService::iter() {
            let res = svc
                .stop(state)
                .await
                .with_context(|| format!("failed to stop {svc}"));
            errs.check(res);
        }

        if !state.bridge_name.is_empty() {
            info!(log, "removing network"; "bridge" => &state.bridge_name);
            errs.check(network::destroy(&state.bridge_name).await);
        }

        if let Some(dest) = &opts.cluster_logs_archive_path {
            info!(log, "saving cluster logs archive"; "path" => %dest.display());
            errs.check(archive::save_cluster_logs(
                state.state_path(),
                state.cluster_name(),
                dest,
            ));
        }

        if errs.is_empty() || opts.delete_state_on_err {
            info!(log, "removing state directory");
            errs.check(state.remove());
        } else {
            warn!(log, "keeping state directory after errors";
                "path" => %state.state_path().display());
        }
        errs.into_result()
    }

    async fn start(&self, cluster: &Cluster) -> Result<()> {
        let log = &self.log;
        let state = cluster.state();

        if !state.bridge_name.is_empty() && !network::link_exists(&state.bridge_name) {
            return Err(Error::Resource(format!(
                "bridge {} of cluster {} is gone; destroy and recreate the cluster",
                state.bridge_name,
                state.cluster_name()
            ))
            .into());
        }

        if state.lb_config.is_some() && !AuxService::LoadBalancer.is_running(state) {
            services::start_load_balancer(log, state)?;
        }
        if state.dhcp_config.is_some() && !AuxService::Dhcpd.is_running(state) {
            services::start_dhcpd(log, state, Some(self.ipxe_dir.as_path()))?;
        }
        if state.dns_config.is_some() && !AuxService::Dnsd.is_running(state) {
            services::start_dnsd(log, state)?;
        }

        for n in all_nodes(cluster.info()) {
            if process::pidfile_alive(&node::pid_path(state, &n.name)) {
                continue;
            }
            node::respawn_launcher(log, state, &n.name)?;
        }
        Ok(())
    }

    async fn reflect(
        &self,
        cluster_name: &str,
        state_directory: &Path,
    ) -> Result<Cluster> {
        super::load_cluster(NAME, cluster_name, state_directory)
    }

    async fn crash_dump(
        &self,
        cluster: &Cluster,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        for n in all_nodes(cluster.info()) {
            let path = node::log_path(cluster.state(), &n.name);
            writeln!(out, "==== node {} ({}) ====", n.name, path.display())?;
            match File::open(&path) {
                Ok(mut f) => {
                    io::copy(&mut f, out)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    writeln!(out, "(no log)")?;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to open {}", path.display()))
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn user_disk_name(&self, index: usize) -> String {
        vd_name(index)
    }

    fn external_kubernetes_endpoint(
        &self,
        network: &NetworkRequest,
        port: u16,
    ) -> String {
        match network.gateway_addrs.first() {
            Some(gw) => https_endpoint(*gw, port),
            None => String::new(),
        }
    }

    fn gen_options(&self, network: &NetworkRequest) -> Vec<GenOption> {
        vec![
            GenOption::InstallDisk { disk: vd_name(0) },
            virtio_dhcp(network),
        ]
    }
}

/// `/dev/vda`, `/dev/vdb`, ... `/dev/vdz`, `/dev/vdaa`, ...
pub(crate) fn vd_name(index: usize) -> String {
    let mut suffix = Vec::new();
    let mut i = index + 1;
    while i > 0 {
        i -= 1;
        suffix.push(b'a' + (i % 26) as u8);
        i /= 26;
    }
    suffix.reverse();
    format!("/dev/vd{}", String::from_utf8_lossy(&suffix))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use provision_types::{
        BootOrder, CniConfig, Disk, NetworkChaos, NodeType, DEFAULT_MTU,
    };

    use crate::state::test::cluster_info;

    pub(crate) fn request() -> ClusterRequest {
        let node = |name: &str, ip: &str, node_type| NodeRequest {
            name: name.to_string(),
            node_type,
            ips: vec![ip.parse().unwrap()],
            config: None,
            skip_injecting_config: false,
            nano_cpus: 2_000_000_000,
            memory: 2 << 30,
            disks: vec![Disk::new(10 << 30)],
            ports: vec![],
            default_boot_order: BootOrder::default(),
            extra_kernel_args: vec![],
            uuid: None,
            tftp_server: None,
            ipxe_boot_filename: None,
            pxe_booted: false,
            bad_rtc: false,
        };
        ClusterRequest {
            name: "c1".to_string(),
            network: NetworkRequest {
                name: "c1".to_string(),
                cidrs: vec!["10.5.0.0/24".parse().unwrap()],
                gateway_addrs: vec!["10.5.0.1".parse().unwrap()],
                mtu: DEFAULT_MTU,
                nameservers: vec![],
                load_balancer_ports: vec![],
                cni: CniConfig {
                    bin_path: vec!["/opt/cni/bin".into()],
                    conf_dir: "/etc/cni/conf.d".into(),
                    cache_dir: "/var/lib/cni".into(),
                    bundle_url: None,
                },
                no_masquerade_cidrs: vec![],
                dhcp_skip_hostname: false,
                chaos: NetworkChaos::default(),
            },
            nodes: vec![
                node("cp0", "10.5.0.2", NodeType::ControlPlane),
                node("w0", "10.5.0.3", NodeType::Worker),
            ],
            assets: BootAssets::default(),
            ipxe_boot_script: None,
            state_directory: "/tmp/clusters".into(),
            self_executable: "/usr/bin/provisioner".into(),
            mesh_endpoints: vec![],
            container_image: None,
        }
    }

    fn provisioner() -> QemuProvisioner {
        QemuProvisioner::new(crate::test_logger())
    }

    #[test]
    fn disk_names() {
        assert_eq!(vd_name(0), "/dev/vda");
        assert_eq!(vd_name(1), "/dev/vdb");
        assert_eq!(vd_name(25), "/dev/vdz");
        assert_eq!(vd_name(26), "/dev/vdaa");
    }

    #[test]
    fn capability_queries() {
        let p = provisioner();
        let req = request();
        assert_eq!(p.user_disk_name(2), "/dev/vdc");
        assert_eq!(p.first_interface(), "eth0");
        assert_eq!(
            p.external_kubernetes_endpoint(&req.network, 6443),
            "https://10.5.0.1:6443"
        );
        assert_eq!(
            p.in_cluster_kubernetes_endpoint(&req.network, 6443),
            "https://10.5.0.1:6443"
        );
        let opts = p.gen_options(&req.network);
        assert_eq!(opts[0], GenOption::InstallDisk { disk: "/dev/vda".to_string() });
        assert!(matches!(
            opts[1],
            GenOption::InterfaceDhcp { dhcp4: true, dhcp6: false, .. }
        ));
    }

    #[test]
    fn node_minimums() {
        let mut req = request();
        assert!(check_minimums(&req.nodes).is_ok());

        req.nodes[1].memory = 1 << 30;
        let err = check_minimums(&req.nodes).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UserInput(_))));
        assert!(err.to_string().contains("w0"), "{err}");

        req.nodes[1].memory = 2 << 30;
        req.nodes[0].disks[0] = Disk::new(5 << 30);
        let err = check_minimums(&req.nodes).unwrap_err();
        assert!(err.to_string().contains("boot disk"), "{err}");

        req.nodes[0].disks = vec![Disk::new(10 << 30), Disk::new(1 << 30)];
        assert!(check_minimums(&req.nodes).is_ok());
    }

    #[test]
    fn load_balancer_targets_control_planes() {
        let mut req = request();
        let gw = req.network.gateway_addrs[0];
        let lb = load_balancer_config(gw, &req);
        assert_eq!(lb.bind_address, gw);
        assert_eq!(lb.upstreams, ["10.5.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(lb.ports, [6443, 50000]);

        req.network.load_balancer_ports = vec![6443];
        assert_eq!(load_balancer_config(gw, &req).ports, [6443]);
    }

    #[test]
    fn virtiofs_share_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::create(NAME, dir.path(), cluster_info("c1")).unwrap();
        let mut req = request();
        assert!(virtiofs_shares(&state, &req.nodes).unwrap().is_empty());

        let mut share = Disk::new(0);
        share.driver = Some(DiskDriver::Virtiofs);
        req.nodes[1].disks.push(share.clone());
        assert!(virtiofs_shares(&state, &req.nodes).is_err());

        share.share = Some("/srv/data".into());
        req.nodes[1].disks[1] = share;
        let shares = virtiofs_shares(&state, &req.nodes).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].dir, PathBuf::from("/srv/data"));
        assert_eq!(shares[0].socket, state.path("w0-1.sock"));
    }

    #[tokio::test]
    async fn reflect_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = State::create(NAME, dir.path(), cluster_info("c1")).unwrap();
        state.bridge_name = "talosd0f631ca".to_string();
        state.save().unwrap();

        let p = provisioner();
        let cluster = p.reflect("c1", dir.path()).await.unwrap();
        assert_eq!(cluster.state(), &state);
        assert_eq!(cluster.provisioner(), NAME);

        let err = p.reflect("c2", dir.path()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Resource(_))));

        let mut other = State::create("docker", dir.path(), cluster_info("c3")).unwrap();
        other.save().unwrap();
        assert!(p.reflect("c3", dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn crash_dump_concatenates_logs() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::create(NAME, dir.path(), cluster_info("c1")).unwrap();
        let names: Vec<_> = all_nodes(&state.cluster_info).map(|n| n.name.clone()).collect();
        assert!(!names.is_empty());
        std::fs::write(state.path(format!("{}.log", names[0])), "kernel panic\n").unwrap();

        let cluster = Cluster::new(state);
        let mut out = Vec::new();
        provisioner().crash_dump(&cluster, &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains(&format!("==== node {} ", names[0])));
        assert!(out.contains("kernel panic"));
    }

    #[tokio::test]
    async fn destroy_removes_state_of_stopped_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::create(NAME, dir.path(), cluster_info("c1")).unwrap();
        state.save().unwrap();
        std::fs::write(state.path("cp0.log"), "booted\n").unwrap();
        let logs = dir.path().join("logs.tar.gz");

        let opts = DestroyOptions {
            support_archive_path: None,
            cluster_logs_archive_path: Some(logs.clone()),
            delete_state_on_err: false,
        };
        provisioner().destroy(&Cluster::new(state.clone()), &opts).await.unwrap();
        assert!(logs.exists());
        assert!(!state.state_path().exists());
    }

    #[test]
    fn stray_pidfiles_skip_nodes_and_services() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = State::create(NAME, dir.path(), cluster_info("c1")).unwrap();
        for f in ["cp0.pid", "w0.pid", "lb.pid", "dhcpd.pid"] {
            std::fs::write(state.path(f), "1\n").unwrap();
        }
        assert_eq!(stray_launcher_pidfiles(&state).unwrap(), [state.path("w0.pid")]);

        state.cluster_info.nodes.clear();
        let mut stray = stray_launcher_pidfiles(&state).unwrap();
        stray.sort();
        assert_eq!(stray, [state.path("cp0.pid"), state.path("w0.pid")]);
    }

    #[tokio::test]
    async fn cleanup_stops_launchers_missing_from_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = State::create(NAME, dir.path(), cluster_info("c1")).unwrap();
        state.cluster_info.nodes.clear();
        state.save().unwrap();

        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        std::fs::write(state.path("cp0.pid"), format!("{pid}\n")).unwrap();

        let path = state.state_path().to_path_buf();
        provisioner().cleanup(state).await;
        assert!(!process::is_alive(pid));
        assert!(!path.exists());
    }
}
