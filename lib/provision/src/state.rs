// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent per-cluster state.

use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cni::NetworkConfigList;
use provision_types::ClusterInfo;
use serde::{Deserialize, Serialize};

use crate::Error;

pub const STATE_FILE: &str = "state.yaml";

/// Lock serializing CNI ADD/DEL calls of launchers within one cluster.
pub const CNI_LOCK_FILE: &str = "cni.lock";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub bind_address: IpAddr,
    pub upstreams: Vec<IpAddr>,
    pub ports: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub gateway_addrs: Vec<IpAddr>,
    pub interface: String,
    #[serde(default)]
    pub ipxe_boot_script: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub bind_addrs: Vec<IpAddr>,
    pub resolv_conf: PathBuf,
}

/// Everything a provisioner needs to find a cluster again after the
/// process that created it has exited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub provisioner_name: String,
    #[serde(default)]
    pub bridge_name: String,
    pub cluster_info: ClusterInfo,
    #[serde(default)]
    pub vm_cni_config: Option<NetworkConfigList>,
    #[serde(default)]
    pub lb_config: Option<LoadBalancerConfig>,
    #[serde(default)]
    pub dhcp_config: Option<DhcpConfig>,
    #[serde(default)]
    pub dns_config: Option<DnsConfig>,
    #[serde(default)]
    pub self_executable: PathBuf,

    #[serde(skip)]
    state_path: PathBuf,
}

impl State {
    /// Allocate the state directory of a new cluster. Fails when the
    /// directory already exists.
    pub fn create(
        provisioner_name: &str,
        state_directory: &Path,
        cluster_info: ClusterInfo,
    ) -> Result<Self> {
        let state_path = state_directory.join(&cluster_info.cluster_name);
        match fs::metadata(&state_path) {
            Ok(_) => {
                return Err(Error::Resource(format!(
                    "state directory {} already exists",
                    state_path.display()
                ))
                .into())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to stat {}", state_path.display())
                })
            }
        }
        fs::create_dir_all(&state_path).with_context(|| {
            format!("failed to create {}", state_path.display())
        })?;

        Ok(Self {
            provisioner_name: provisioner_name.to_string(),
            bridge_name: String::new(),
            cluster_info,
            vm_cni_config: None,
            lb_config: None,
            dhcp_config: None,
            dns_config: None,
            self_executable: PathBuf::new(),
            state_path,
        })
    }

    /// Read `<state_directory>/<cluster_name>/state.yaml`.
    pub fn load(state_directory: &Path, cluster_name: &str) -> Result<Self> {
        let state_path = state_directory.join(cluster_name);
        let file = state_path.join(STATE_FILE);
        let bytes = fs::read(&file).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                anyhow::Error::new(Error::Resource(format!(
                    "cluster {cluster_name:?} not found in {}",
                    state_directory.display()
                )))
            } else {
                anyhow::Error::new(e)
                    .context(format!("failed to read {}", file.display()))
            }
        })?;
        let mut state: State = serde_yaml::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", file.display()))?;
        state.state_path = state_path;
        Ok(state)
    }

    /// Rewrite `state.yaml` through a temporary file in the same directory.
    pub fn save(&self) -> Result<()> {
        let yaml =
            serde_yaml::to_string(self).context("failed to encode state")?;
        let tmp = self.state_path.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, yaml)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        let file = self.state_path.join(STATE_FILE);
        fs::rename(&tmp, &file)
            .with_context(|| format!("failed to replace {}", file.display()))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// `file` inside the state directory.
    pub fn path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.state_path.join(file)
    }

    pub fn ipam_path(&self) -> PathBuf {
        self.path(ipam::DB_FILE)
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_info.cluster_name
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.state_path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e)
                .with_context(|| {
                    format!("failed to remove {}", self.state_path.display())
                }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use provision_types::{NetworkInfo, NodeInfo, NodeType};

    pub(crate) fn cluster_info(name: &str) -> ClusterInfo {
        ClusterInfo {
            cluster_name: name.to_string(),
            network: NetworkInfo {
                name: name.to_string(),
                cidrs: vec!["10.5.0.0/24".parse().unwrap()],
                no_masquerade_cidrs: vec![],
                gateway_addrs: vec!["10.5.0.1".parse().unwrap()],
                mtu: 1500,
            },
            nodes: vec![NodeInfo {
                id: "/state/c1/cp0.pid".to_string(),
                uuid: uuid::Uuid::nil(),
                name: "cp0".to_string(),
                node_type: NodeType::Init,
                nano_cpus: 2_000_000_000,
                memory: 2 << 30,
                disk_size: 10 << 30,
                ips: vec!["10.5.0.2".parse().unwrap()],
                api_port: 40000,
                tpm_state_dir: None,
            }],
            extra_nodes: vec![],
            kubernetes_endpoint: "https://10.5.0.1:6443".to_string(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut state =
            State::create("qemu", dir.path(), cluster_info("c1")).unwrap();
        state.bridge_name = "talos1a2b3c4d".to_string();
        state.vm_cni_config =
            Some(cni::config::vm_chain("c1", "talos1a2b3c4d", 1500));
        state.lb_config = Some(LoadBalancerConfig {
            bind_address: "10.5.0.1".parse().unwrap(),
            upstreams: vec!["10.5.0.2".parse().unwrap()],
            ports: vec![6443, 50000],
        });
        state.dhcp_config = Some(DhcpConfig {
            gateway_addrs: vec!["10.5.0.1".parse().unwrap()],
            interface: "talos1a2b3c4d".to_string(),
            ipxe_boot_script: None,
        });
        state.self_executable = PathBuf::from("/usr/bin/provisioner");
        state.save().unwrap();

        let loaded = State::load(dir.path(), "c1").unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.state_path(), dir.path().join("c1"));
    }

    #[test]
    fn create_refuses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        State::create("qemu", dir.path(), cluster_info("c1")).unwrap();
        let err =
            State::create("qemu", dir.path(), cluster_info("c1")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Resource(_))));
    }

    #[test]
    fn load_missing_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let err = State::load(dir.path(), "nope").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
