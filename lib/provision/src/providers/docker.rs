// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nodes as privileged containers, driven through the `docker` CLI.

use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use provision_types::{
    ClusterInfo, ClusterRequest, DestroyOptions, NetworkRequest, NodeInfo,
    NodeRequest, NodeRequests, Options,
};
use slog::{info, o, warn, Logger};
use uuid::Uuid;

use crate::process;
use crate::provisioner::{https_endpoint, Cluster, GenOption, Provisioner};
use crate::state::State;
use crate::{Error, MultiError};

pub const NAME: &str = "docker";

const DOCKER: &str = "docker";
const KUBERNETES_PORT: u16 = 6443;
const API_PORT: u16 = 50000;

const LABEL_OWNED: &str = "talos.owned";
const LABEL_CLUSTER: &str = "talos.cluster.name";
const LABEL_TYPE: &str = "talos.type";

pub struct DockerProvisioner {
    log: Logger,
    program: String,
}

impl DockerProvisioner {
    pub fn new(log: Logger) -> Self {
        Self { log: log.new(o!("provisioner" => NAME)), program: DOCKER.to_string() }
    }

    async fn docker<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        process::run(&self.program, args).await
    }

    /// `(id, name)` of every container labelled with `cluster`.
    async fn containers(&self, cluster: &str) -> Result<Vec<(String, String)>> {
        let out = self.docker(list_args(cluster)).await?;
        Ok(parse_list(&out))
    }

    async fn run_nodes(
        &self,
        state: &mut State,
        request: &ClusterRequest,
        image: &str,
    ) -> Result<()> {
        self.docker(network_create_args(&request.name, &request.network)).await?;

        let order = request
            .nodes
            .control_plane_nodes()
            .into_iter()
            .chain(request.nodes.worker_nodes());
        for node in order {
            info!(self.log, "starting container"; "node" => &node.name);
            let id = self
                .docker(run_args(&request.name, &request.network, node, image))
                .await
                .with_context(|| format!("failed to start node {}", node.name))?;
            state.cluster_info.nodes.push(NodeInfo {
                id: id.trim().to_string(),
                uuid: node.uuid.unwrap_or_else(Uuid::new_v4),
                name: node.name.clone(),
                node_type: node.node_type,
                nano_cpus: node.nano_cpus,
                memory: node.memory,
                disk_size: 0,
                ips: node.ips.clone(),
                api_port: API_PORT,
                tpm_state_dir: None,
            });
            state.save()?;
        }

        let endpoint = in_cluster_address(&request.network).ok_or_else(|| {
            Error::UserInput("network has no CIDR".to_string())
        })?;
        state.cluster_info.kubernetes_endpoint =
            https_endpoint(endpoint, KUBERNETES_PORT);
        state.save()
    }
}

fn label(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

fn network_create_args(cluster: &str, network: &NetworkRequest) -> Vec<String> {
    let mut args = vec![
        "network".to_string(),
        "create".to_string(),
        "--driver".to_string(),
        "bridge".to_string(),
    ];
    for (i, cidr) in network.cidrs.iter().enumerate() {
        args.extend(["--subnet".to_string(), cidr.to_string()]);
        if let Some(gw) = network.gateway_addrs.get(i) {
            args.extend(["--gateway".to_string(), gw.to_string()]);
        }
    }
    if network.cidrs.iter().any(|c| c.is_ipv6()) {
        args.push("--ipv6".to_string());
    }
    args.extend([
        "--opt".to_string(),
        format!("com.docker.network.driver.mtu={}", network.mtu),
        "--label".to_string(),
        label(LABEL_OWNED, "true"),
        "--label".to_string(),
        label(LABEL_CLUSTER, cluster),
        network.name.clone(),
    ]);
    args
}

fn run_args(
    cluster: &str,
    network: &NetworkRequest,
    node: &NodeRequest,
    image: &str,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "run",
        "--detach",
        "--privileged",
        "--read-only",
        "--security-opt",
        "seccomp=unconfined",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    args.extend([
        "--name".to_string(),
        node.name.clone(),
        "--hostname".to_string(),
        node.name.clone(),
        "--network".to_string(),
        network.name.clone(),
        "--label".to_string(),
        label(LABEL_OWNED, "true"),
        "--label".to_string(),
        label(LABEL_CLUSTER, cluster),
        "--label".to_string(),
        label(LABEL_TYPE, &node.node_type.to_string()),
    ]);
    for ip in &node.ips {
        let flag = if ip.is_ipv4() { "--ip" } else { "--ip6" };
        args.extend([flag.to_string(), ip.to_string()]);
    }
    if node.nano_cpus > 0 {
        args.extend(["--cpus".to_string(), format!("{}", node.nano_cpus as f64 / 1e9)]);
    }
    if node.memory > 0 {
        args.extend(["--memory".to_string(), node.memory.to_string()]);
    }
    for port in &node.ports {
        args.extend(["--publish".to_string(), port.clone()]);
    }
    for dir in ["/run", "/system", "/tmp"] {
        args.extend(["--tmpfs".to_string(), dir.to_string()]);
    }
    for dir in ["/var", "/system/state"] {
        args.extend(["--volume".to_string(), dir.to_string()]);
    }
    args.extend(["--env".to_string(), "PLATFORM=container".to_string()]);
    if let Some(config) = node.config.as_ref().filter(|_| !node.skip_injecting_config) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(config);
        args.extend(["--env".to_string(), format!("USERDATA={encoded}")]);
    }
    args.push(image.to_string());
    args
}

fn list_args(cluster: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "--all".to_string(),
        "--filter".to_string(),
        format!("label={}", label(LABEL_CLUSTER, cluster)),
        "--format".to_string(),
        "{{.ID}}\t{{.Names}}".to_string(),
    ]
}

fn parse_list(out: &str) -> Vec<(String, String)> {
    out.lines()
        .filter_map(|l| l.split_once('\t'))
        .map(|(id, name)| (id.trim().to_string(), name.trim().to_string()))
        .collect()
}

/// Second host address of the first CIDR, where the first control plane
/// node conventionally sits.
fn in_cluster_address(network: &NetworkRequest) -> Option<IpAddr> {
    let cidr = network.cidrs.first()?;
    Some(match cidr.network() {
        IpAddr::V4(a) => IpAddr::V4(u32::from(a).wrapping_add(2).into()),
        IpAddr::V6(a) => IpAddr::V6(u128::from(a).wrapping_add(2).into()),
    })
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn create(
        &self,
        request: &ClusterRequest,
        opts: &Options,
    ) -> Result<Cluster> {
        request.validate().map_err(Error::from)?;
        let image = request.container_image.as_deref().ok_or_else(|| {
            Error::UserInput("a container image is required".to_string())
        })?;
        if !request.nodes.pxe_nodes().is_empty() {
            return Err(Error::UserInput(
                "containers cannot be network booted".to_string(),
            )
            .into());
        }

        let info = ClusterInfo {
            cluster_name: request.name.clone(),
            network: (&request.network).into(),
            nodes: Vec::new(),
            extra_nodes: Vec::new(),
            kubernetes_endpoint: String::new(),
        };
        let mut state = State::create(NAME, &request.state_directory, info)?;
        state.save()?;

        match self.run_nodes(&mut state, request, image).await {
            Ok(()) => Ok(Cluster::new(state)),
            Err(e) => {
                if opts.delete_state_on_err {
                    warn!(self.log, "cluster creation failed, cleaning up";
                        "error" => %e);
                    let cluster = Cluster::new(state);
                    if let Err(c) =
                        self.destroy(&cluster, &DestroyOptions::default()).await
                    {
                        warn!(self.log, "cleanup was incomplete"; "error" => %c);
                    }
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
        let state = cluster.state();
        let mut errs = MultiError::new();

        if let Some(dest) = &opts.cluster_logs_archive_path {
            let mut out = Vec::new();
            if errs.check(self.crash_dump(cluster, &mut out).await).is_some() {
                errs.check(
                    std::fs::write(dest, out)
                        .with_context(|| format!("failed to write {}", dest.display())),
                );
            }
        }

        if let Some(ids) = errs.check(self.containers(state.cluster_name()).await) {
            let ids: Vec<_> = ids.into_iter().map(|(id, _)| id).collect();
            if !ids.is_empty() {
                info!(self.log, "removing containers"; "count" => ids.len());
                let args = ["rm", "--force", "--volumes"]
                    .into_iter()
                    .map(str::to_string)
                    .chain(ids);
                errs.check(self.docker(args).await);
            }
        }

        info!(self.log, "removing network"; "network" => &state.cluster_info.network.name);
        let res = self
            .docker(["network", "rm", state.cluster_info.network.name.as_str()])
            .await;
        if let Err(e) = res {
            if !e.to_string().contains("not found") {
                errs.push(e);
            }
        }

        if errs.is_empty() || opts.delete_state_on_err {
            errs.check(state.remove());
        }
        errs.into_result()
    }

    async fn start(&self, cluster: &Cluster) -> Result<()> {
        let ids: Vec<_> = cluster.info().nodes.iter().map(|n| n.id.clone()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.docker(std::iter::once("start".to_string()).chain(ids)).await?;
        Ok(())
    }

    async fn reflect(
        &self,
        cluster_name: &str,
        state_directory: &Path,
    ) -> Result<Cluster> {
        let mut state =
            super::load_cluster(NAME, cluster_name, state_directory)?.into_state();
        let running = self.containers(cluster_name).await?;
        for node in &mut state.cluster_info.nodes {
            match running.iter().find(|(_, name)| *name == node.name) {
                Some((id, _)) => node.id = id.clone(),
                None => warn!(self.log, "container of node is gone"; "node" => &node.name),
            }
        }
        Ok(Cluster::new(state))
    }

    async fn crash_dump(
        &self,
        cluster: &Cluster,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        for node in &cluster.info().nodes {
            writeln!(out, "==== node {} ({}) ====", node.name, node.id)?;
            match self.docker(["logs", node.id.as_str()]).await {
                Ok(logs) => out.write_all(logs.as_bytes())?,
                Err(e) => writeln!(out, "(no log: {e})")?,
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Containers have no user disks.
    fn user_disk_name(&self, _index: usize) -> String {
        String::new()
    }

    fn external_kubernetes_endpoint(
        &self,
        _network: &NetworkRequest,
        port: u16,
    ) -> String {
        https_endpoint(IpAddr::from([127, 0, 0, 1]), port)
    }

    fn in_cluster_kubernetes_endpoint(
        &self,
        network: &NetworkRequest,
        port: u16,
    ) -> String {
        in_cluster_address(network)
            .map(|ip| https_endpoint(ip, port))
            .unwrap_or_default()
    }

    fn gen_options(&self, _network: &NetworkRequest) -> Vec<GenOption> {
        vec![GenOption::Persist { enabled: false }]
    }
}
