// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VMs on a remote Proxmox VE host.
//!
//! Nodes are created one at a time through the Proxmox API and attached to
//! an existing host bridge. There is no local network, load balancer or DNS;
//! when nodes boot over the network, the DHCP server runs on the hypervisor
//! itself (see [`remote`]).

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipam::{Family, IpamRecord, MacAddr};
use provision_types::{
    ClusterInfo, ClusterRequest, DestroyOptions, NetworkRequest, NodeInfo,
    NodeRequest, NodeRequests, Options,
};
use slog::{info, o, warn, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::provisioner::{
    https_endpoint, virtio_dhcp, Cluster, GenOption, Provisioner,
};
use crate::state::{DhcpConfig, State};
use crate::{archive, Error, MultiError};

mod client;
#[cfg(test)]
mod mock;
mod remote;
mod storage;
mod vm;

pub use client::{Client, Credentials};
pub use remote::{parse_serial_log, SerialDiscovery};

pub const NAME: &str = "proxmox";

pub const DEFAULT_BRIDGE: &str = "vmbr0";

const KUBERNETES_PORT: u16 = 6443;
const API_PORT: u16 = 50000;
const DEFAULT_CNI: &str = "cilium";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection settings, read from `PROXMOX_*` environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub url: String,
    pub credentials: Credentials,
    /// Compute node; the first one the API lists when unset.
    pub node: Option<String>,
    /// VM disk storage; picked automatically when unset.
    pub storage: Option<String>,
    pub bridge: String,
    pub insecure: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |k: &str| lookup(k).filter(|v| !v.is_empty());
        let url = get("PROXMOX_URL")
            .ok_or_else(|| Error::UserInput("PROXMOX_URL must be set".to_string()))?;

        let password = get("PROXMOX_USERNAME").zip(get("PROXMOX_PASSWORD"));
        let token = get("PROXMOX_TOKEN").zip(get("PROXMOX_SECRET"));
        let credentials = match (password, token) {
            (Some((username, password)), None) => {
                Credentials::Password { username, password }
            }
            (None, Some((id, secret))) => Credentials::Token { id, secret },
            (Some(_), Some(_)) => {
                return Err(Error::UserInput(
                    "cannot use both username/password and token authentication"
                        .to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::UserInput(
                    "either PROXMOX_USERNAME/PROXMOX_PASSWORD or \
                     PROXMOX_TOKEN/PROXMOX_SECRET must be set"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            url,
            credentials,
            node: get("PROXMOX_NODE"),
            storage: get("PROXMOX_STORAGE"),
            bridge: get("PROXMOX_BRIDGE").unwrap_or_else(|| DEFAULT_BRIDGE.to_string()),
            insecure: get("PROXMOX_INSECURE").as_deref() == Some("true"),
        })
    }
}

pub struct ProxmoxProvisioner {
    log: Logger,
    config: Config,
    client: Client,
    remote: remote::Remote,
    cancel: CancellationToken,
}

/// Where one cluster's VMs go.
struct Placement {
    node: String,
    storage: String,
    upload_storage: String,
}

/// What a node boots with, decided before any VM exists so the DHCP
/// server can be given every lease up front.
struct NodePlan<'a> {
    request: &'a NodeRequest,
    mac: MacAddr,
    tftp_server: Option<String>,
    ipxe_boot_filename: Option<String>,
}

impl NodePlan<'_> {
    fn network_boot(&self) -> bool {
        self.request.pxe_booted
            || (self.tftp_server.is_some() && self.ipxe_boot_filename.is_some())
    }
}

impl ProxmoxProvisioner {
    pub async fn new(log: Logger, config: Config) -> Result<Self> {
        let log = log.new(o!("provisioner" => NAME));
        let client = Client::connect(
            log.clone(),
            &config.url,
            &config.credentials,
            config.insecure,
        )
        .await?;
        let remote = remote::Remote::from_url(&config.url)?;
        Ok(Self { log, config, client, remote, cancel: CancellationToken::new() })
    }

    pub async fn from_env(log: Logger) -> Result<Self> {
        Self::new(log, Config::from_env()?).await
    }

    /// Abort API waits when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn host<'a>(&'a self, node: &'a str) -> vm::Host<'a> {
        vm::Host { log: &self.log, client: &self.client, node, cancel: &self.cancel }
    }

    async fn compute_node(&self) -> Result<String> {
        if let Some(node) = &self.config.node {
            return Ok(node.clone());
        }
        let nodes: Vec<client::NodeEntry> = self.client.get("/nodes").await?;
        nodes.into_iter().next().map(|n| n.node).ok_or_else(|| {
            Error::Resource("Proxmox API lists no nodes".to_string()).into()
        })
    }

    async fn placement(&self) -> Result<Placement> {
        let node = self.compute_node().await?;
        let storages: Vec<client::StorageInfo> =
            self.client.get(&format!("/nodes/{node}/storage")).await?;
        let storage = match &self.config.storage {
            Some(s) => s.clone(),
            None => storage::select_best(&storages)
                .map(|s| s.storage.clone())
                .ok_or_else(|| {
                    Error::Resource(format!(
                        "no storage on node {node} can hold VM disks, set PROXMOX_STORAGE"
                    ))
                })?,
        };
        let upload_storage = storage::select_upload(&storages, &storage);
        for w in storage::warnings(&storages, &storage, &upload_storage) {
            warn!(self.log, "{}", w);
        }
        info!(self.log, "using storage"; "node" => &node, "disks" => &storage,
            "uploads" => &upload_storage);
        Ok(Placement { node, storage, upload_storage })
    }

    async fn provision(
        &self,
        state: &mut State,
        request: &ClusterRequest,
        opts: &Options,
    ) -> Result<()> {
        let log = &self.log;
        let place = self.placement().await?;
        std::fs::write(state.path("proxmox.node"), &place.node)
            .context("failed to record compute node")?;

        let plans = plan_nodes(request, opts);
        for plan in &plans {
            for record in ipam_records(&request.network, plan) {
                ipam::append(&state.ipam_path(), &record)
                    .with_context(|| format!("failed to record lease of {}", plan.request.name))?;
            }
        }

        if let Some(script) = &request.ipxe_boot_script {
            info!(log, "starting DHCP server on the hypervisor");
            state.dhcp_config = Some(DhcpConfig {
                gateway_addrs: request.network.gateway_addrs.clone(),
                interface: self.config.bridge.clone(),
                ipxe_boot_script: Some(script.clone()),
            });
            state.save()?;
            remote::start_dhcpd(log, &self.remote, state).await?;
        }

        let order = request
            .nodes
            .control_plane_nodes()
            .into_iter()
            .chain(request.nodes.worker_nodes())
            .chain(request.nodes.pxe_nodes());
        for node in order {
            let Some(plan) = plans.iter().find(|p| p.request.name == node.name) else {
                continue;
            };
            info!(log, "creating node"; "node" => &node.name);
            let info = self.create_node(state, &place, request, opts, plan).await?;
            if node.pxe_booted {
                state.cluster_info.extra_nodes.push(info);
            } else {
                state.cluster_info.nodes.push(info);
            }
            state.save()?;
        }

        let gateway = request.network.gateway_addrs.first().copied().ok_or_else(|| {
            Error::UserInput("network has no gateway address".to_string())
        })?;
        let port = request
            .network
            .load_balancer_ports
            .first()
            .copied()
            .unwrap_or(KUBERNETES_PORT);
        state.cluster_info.kubernetes_endpoint = https_endpoint(gateway, port);
        state.save()
    }

    async fn create_node(
        &self,
        state: &State,
        place: &Placement,
        request: &ClusterRequest,
        opts: &Options,
        plan: &NodePlan<'_>,
    ) -> Result<NodeInfo> {
        let node = plan.request;
        let host = self.host(&place.node);
        let resources = vm::validate(node)?;
        let vmid = vm::allocate_vmid(&self.client, &place.node).await?;
        let uuid = node.uuid.unwrap_or_else(Uuid::new_v4);

        let boot = if plan.network_boot() {
            vm::BootMedia::Network
        } else {
            let file = host
                .resolve_iso(
                    &place.upload_storage,
                    request.assets.iso_path.as_deref(),
                    opts.remote_fallback_iso.as_deref(),
                )
                .await?;
            vm::BootMedia::Iso { storage: place.upload_storage.clone(), file }
        };
        let spec = vm::VmSpec {
            vmid,
            name: node.name.clone(),
            resources,
            mac: plan.mac,
            bridge: self.config.bridge.clone(),
            storage: place.storage.clone(),
            uuid,
            boot,
            tpm: opts.tpm,
            iommu: opts.iommu_enabled,
        };

        info!(self.log, "creating VM"; "node" => &node.name, "vmid" => vmid);
        if let Err(e) = self.boot_vm(&host, &spec).await {
            if let Err(cleanup) = host.remove(vmid).await {
                warn!(self.log, "failed to remove partially created VM";
                    "vmid" => vmid, "error" => %cleanup);
            }
            return Err(e.context(format!("failed to create node {}", node.name)));
        }

        std::fs::write(state.path(format!("{}.vmid", node.name)), vmid.to_string())
            .context("failed to record VM id")?;
        std::fs::write(state.path(format!("{}.node", node.name)), &place.node)
            .context("failed to record compute node")?;

        let mac = match host.config(vmid).await.map(|c| vm::mac_from_config(&c)) {
            Ok(Some(mac)) if mac != plan.mac => {
                warn!(self.log, "VM has a different MAC than requested";
                    "vmid" => vmid, "mac" => %mac);
                let actual = NodePlan {
                    request: plan.request,
                    mac,
                    tftp_server: plan.tftp_server.clone(),
                    ipxe_boot_filename: plan.ipxe_boot_filename.clone(),
                };
                for record in ipam_records(&request.network, &actual) {
                    ipam::append(&state.ipam_path(), &record)?;
                }
                mac
            }
            _ => plan.mac,
        };

        let mut ips = node.ips.clone();
        if ips.is_empty() {
            let discovery = remote::Discovery {
                log: &self.log,
                client: &self.client,
                remote: &self.remote,
                node: &place.node,
                cancel: &self.cancel,
            };
            match discovery.discover(vmid, &mac, DISCOVERY_TIMEOUT).await {
                Ok(found) => {
                    info!(self.log, "discovered node address"; "node" => &node.name,
                        "ip" => ?found.node_ip, "fingerprint" => ?found.fingerprint);
                    ips.extend(found.node_ip);
                }
                Err(e) if crate::is_stopped(&e) => return Err(e),
                Err(e) => warn!(self.log, "could not discover node address";
                    "node" => &node.name, "error" => %e),
            }
        }

        Ok(NodeInfo {
            id: vmid.to_string(),
            uuid,
            name: node.name.clone(),
            node_type: node.node_type,
            nano_cpus: node.nano_cpus,
            memory: node.memory,
            disk_size: node.boot_disk_size(),
            ips,
            api_port: API_PORT,
            tpm_state_dir: None,
        })
    }

    async fn boot_vm(&self, host: &vm::Host<'_>, spec: &vm::VmSpec) -> Result<()> {
        host.create(spec).await?;
        if let vm::BootMedia::Iso { storage, file } = &spec.boot {
            if let Err(e) = host.fix_boot_order(spec).await {
                warn!(self.log, "could not check boot order"; "vmid" => spec.vmid,
                    "error" => %e);
            }
            if let Err(e) = host.verify_iso(spec.vmid, storage, file).await {
                warn!(self.log, "ISO attachment looks wrong"; "vmid" => spec.vmid,
                    "error" => %e);
            }
        }
        host.start(spec.vmid).await
    }

    /// VM id and compute node of `node`.
    fn locate(&self, state: &State, node: &NodeInfo) -> Result<(u32, String)> {
        let vmid = node
            .id
            .parse()
            .with_context(|| format!("node {} has no VM id", node.name))?;
        let host = std::fs::read_to_string(state.path(format!("{}.node", node.name)))
            .ok()
            .map(|s| s.trim().to_string())
            .or_else(|| self.config.node.clone())
            .ok_or_else(|| {
                Error::Resource(format!("compute node of {} is unknown", node.name))
            })?;
        Ok((vmid, host))
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

/// MACs and boot files of every node. Network-booted clusters point every
/// node at the gateway's TFTP server.
fn plan_nodes<'a>(request: &'a ClusterRequest, opts: &Options) -> Vec<NodePlan<'a>> {
    let pxe = request
        .ipxe_boot_script
        .as_ref()
        .and(request.network.gateway_addrs.first());
    request
        .nodes
        .iter()
        .map(|n| match pxe {
            Some(gw) => NodePlan {
                request: n,
                mac: MacAddr::random_local(),
                tftp_server: Some(gw.to_string()),
                ipxe_boot_filename: Some(format!("ipxe/{}/snp.efi", opts.target_arch)),
            },
            None => NodePlan {
                request: n,
                mac: MacAddr::random_local(),
                tftp_server: n.tftp_server.map(|ip| ip.to_string()),
                ipxe_boot_filename: n.ipxe_boot_filename.clone(),
            },
        })
        .collect()
}

/// One lease per node address that falls inside a cluster CIDR.
fn ipam_records(network: &NetworkRequest, plan: &NodePlan<'_>) -> Vec<IpamRecord> {
    plan.request
        .ips
        .iter()
        .enumerate()
        .filter_map(|(i, ip)| {
            let (_, cidr) = network.cidr_for(*ip)?;
            let family = Family::of(ip);
            Some(IpamRecord {
                ip: *ip,
                netmask: cidr.prefix(),
                mac: plan.mac,
                hostname: if network.dhcp_skip_hostname {
                    String::new()
                } else {
                    plan.request.name.clone()
                },
                gateway: network
                    .gateway_addrs
                    .get(i)
                    .or(network.gateway_addrs.first())
                    .copied(),
                mtu: network.mtu,
                nameservers: network
                    .nameservers
                    .iter()
                    .filter(|ns| Family::of(ns) == family)
                    .copied()
                    .collect(),
                tftp_server: plan.tftp_server.clone(),
                ipxe_boot_filename: plan.ipxe_boot_filename.clone(),
            })
        })
        .collect()
}

fn save_support_archive(state: &State, dest: &Path) -> Result<usize> {
    let mut files = vec![state.path(crate::state::STATE_FILE), state.ipam_path()];
    files.retain(|f| f.exists());
    archive::write_tar_gz(dest, state.cluster_name(), &files)
}

#[async_trait]
impl Provisioner for ProxmoxProvisioner {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn create(
        &self,
        request: &ClusterRequest,
        opts: &Options,
    ) -> Result<Cluster> {
        request.validate().map_err(Error::from)?;
        for node in &request.nodes {
            vm::validate(node)?;
        }
        if !request.mesh_endpoints.is_empty() {
            warn!(self.log, "mesh endpoints are not supported by this provisioner, ignoring";
                "endpoints" => ?request.mesh_endpoints);
        }

        let info = ClusterInfo {
            cluster_name: request.name.clone(),
            network: (&request.network).into(),
            nodes: Vec::new(),
            extra_nodes: Vec::new(),
            kubernetes_endpoint: String::new(),
        };
        let mut state = State::create(NAME, &request.state_directory, info)?;
        state.bridge_name = self.config.bridge.clone();
        state.self_executable = request.self_executable.clone();
        state.save()?;

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

        let info = cluster.info();
        for node in info.nodes.iter().chain(&info.extra_nodes) {
            let Some((vmid, host)) = errs.check(self.locate(state, node)) else {
                continue;
            };
            info!(log, "removing VM"; "node" => &node.name, "vmid" => vmid);
            let res = self
                .host(&host)
                .remove(vmid)
                .await
                .with_context(|| format!("failed to remove VM {vmid} of {}", node.name));
            errs.check(res);
        }

        errs.check(remote::stop_dhcpd(&self.remote, state).await);

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
        let state = cluster.state();
        if state.dhcp_config.is_some()
            && !state.path(remote::REMOTE_DHCPD_PID_FILE).exists()
        {
            remote::start_dhcpd(&self.log, &self.remote, state).await?;
        }
        let info = cluster.info();
        for node in info.nodes.iter().chain(&info.extra_nodes) {
            let (vmid, host) = self.locate(state, node)?;
            let host = self.host(&host);
            if host.status(vmid).await? != "running" {
                info!(self.log, "starting VM"; "node" => &node.name, "vmid" => vmid);
                host.start(vmid).await?;
            }
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
        let info = cluster.info();
        for node in info.nodes.iter().chain(&info.extra_nodes) {
            let vmid = match self.locate(cluster.state(), node) {
                Ok((vmid, _)) => vmid,
                Err(e) => {
                    writeln!(out, "==== node {}: {e} ====", node.name)?;
                    continue;
                }
            };
            let path = vm::serial_log_path(vmid);
            writeln!(out, "==== node {} (VM {vmid}, {path}) ====", node.name)?;
            match self.remote.run(&format!("cat {}", remote::shell_quote(&path))).await {
                Ok(log) => out.write_all(log.as_bytes())?,
                Err(e) => writeln!(out, "(no log: {e})")?,
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn user_disk_name(&self, index: usize) -> String {
        super::qemu::vd_name(index)
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
            GenOption::InstallDisk { disk: super::qemu::vd_name(0) },
            GenOption::ClusterCni { name: DEFAULT_CNI.to_string() },
            virtio_dhcp(network),
        ]
    }
}
