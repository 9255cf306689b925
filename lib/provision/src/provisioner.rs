// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract every backend implements.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use provision_types::{
    ClusterInfo, ClusterRequest, DestroyOptions, NetworkRequest, Options,
};
use serde::Serialize;

use crate::state::State;

/// How a generated machine config picks the primary interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceSelector {
    Name(String),
    KernelDriver(String),
}

/// A knob handed to the machine config generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "option")]
pub enum GenOption {
    InstallDisk { disk: String },
    InterfaceDhcp { selector: InterfaceSelector, dhcp4: bool, dhcp6: bool },
    ClusterCni { name: String },
    Persist { enabled: bool },
}

/// A cluster as seen by the provisioner that owns it.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    state: State,
}

impl Cluster {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.state.cluster_info
    }

    pub fn provisioner(&self) -> &str {
        &self.state.provisioner_name
    }

    pub fn state_path(&self) -> &Path {
        self.state.state_path()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn into_state(self) -> State {
        self.state
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(
        &self,
        request: &ClusterRequest,
        opts: &Options,
    ) -> Result<Cluster>;

    /// Tear the cluster down. Every step is attempted; failures are
    /// collected and reported together.
    async fn destroy(&self, cluster: &Cluster, opts: &DestroyOptions)
        -> Result<()>;

    /// Bring a previously created cluster back up.
    async fn start(&self, cluster: &Cluster) -> Result<()>;

    /// Rebuild the view of `cluster_name` from its persisted state.
    async fn reflect(
        &self,
        cluster_name: &str,
        state_directory: &Path,
    ) -> Result<Cluster>;

    async fn crash_dump(
        &self,
        cluster: &Cluster,
        out: &mut (dyn Write + Send),
    ) -> Result<()>;

    /// Device name of the `index`th disk inside the guest.
    fn user_disk_name(&self, index: usize) -> String;

    fn first_interface(&self) -> String {
        "eth0".to_string()
    }

    fn external_kubernetes_endpoint(
        &self,
        network: &NetworkRequest,
        port: u16,
    ) -> String;

    fn in_cluster_kubernetes_endpoint(
        &self,
        network: &NetworkRequest,
        port: u16,
    ) -> String {
        self.external_kubernetes_endpoint(network, port)
    }

    fn gen_options(&self, network: &NetworkRequest) -> Vec<GenOption>;
}

/// `https://<addr>:<port>` with IPv6 addresses bracketed.
pub fn https_endpoint(addr: std::net::IpAddr, port: u16) -> String {
    format!("https://{}", std::net::SocketAddr::new(addr, port))
}

/// DHCP on the first virtio NIC for every address family of the network.
pub(crate) fn virtio_dhcp(network: &NetworkRequest) -> GenOption {
    GenOption::InterfaceDhcp {
        selector: InterfaceSelector::KernelDriver("virtio_net".to_string()),
        dhcp4: network.cidrs.iter().any(|c| c.is_ipv4()),
        dhcp6: network.cidrs.iter().any(|c| c.is_ipv6()),
    }
}
