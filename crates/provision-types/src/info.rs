// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reflected view of a provisioned cluster.

use std::net::IpAddr;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{NetworkRequest, NodeType};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub no_masquerade_cidrs: Vec<IpNetwork>,
    pub gateway_addrs: Vec<IpAddr>,
    pub mtu: u32,
}

impl From<&NetworkRequest> for NetworkInfo {
    fn from(req: &NetworkRequest) -> Self {
        Self {
            name: req.name.clone(),
            cidrs: req.cidrs.clone(),
            no_masquerade_cidrs: req.no_masquerade_cidrs.clone(),
            gateway_addrs: req.gateway_addrs.clone(),
            mtu: req.mtu,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// PID file path of a local launcher, or the numeric VM id of a remote
    /// VM, or the container id.
    pub id: String,
    pub uuid: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub nano_cpus: i64,
    pub memory: i64,
    pub disk_size: u64,
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub api_port: u16,
    #[serde(default)]
    pub tpm_state_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub network: NetworkInfo,
    pub nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub extra_nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub kubernetes_endpoint: String,
}

impl ClusterInfo {
    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().chain(&self.extra_nodes).find(|n| n.name == name)
    }

    pub fn control_plane_ips(&self) -> Vec<IpAddr> {
        self.nodes
            .iter()
            .filter(|n| n.node_type.is_control_plane())
            .filter_map(|n| n.ips.first().copied())
            .collect()
    }
}
