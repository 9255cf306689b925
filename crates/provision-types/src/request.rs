// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative cluster, network and node requests.

use std::collections::HashSet;
use std::fmt::Display;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::ValidationError;

/// Default MTU of the cluster bridge.
pub const DEFAULT_MTU: u32 = 1500;

/// Logical and physical block size used when a disk does not specify one.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Role of a node in the cluster.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeType {
    Init,
    ControlPlane,
    Worker,
}

impl NodeType {
    pub fn is_control_plane(&self) -> bool {
        matches!(self, NodeType::Init | NodeType::ControlPlane)
    }
}

/// Attachment model of a VM disk.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskDriver {
    Virtio,
    Ide,
    Ahci,
    Scsi,
    Nvme,
    Megaraid,
    Virtiofs,
}

/// A partition the node's configuration should lay out on a disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub size: u64,
    #[serde(default)]
    pub mount_point: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Size in bytes. Ignored for virtiofs shares.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub driver: Option<DiskDriver>,
    #[serde(default)]
    pub block_size: Option<u32>,
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
    /// Allocate the backing file up front instead of leaving it sparse.
    #[serde(default)]
    pub preallocate: bool,
    /// Host directory exported to the guest by a virtiofs disk.
    #[serde(default)]
    pub share: Option<PathBuf>,
    /// Mount tag of a virtiofs disk.
    #[serde(default)]
    pub tag: Option<String>,
}

impl Disk {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            driver: None,
            block_size: None,
            partitions: Vec::new(),
            preallocate: false,
            share: None,
            tag: None,
        }
    }

    /// The driver used for the disk at `index` in a node's disk list: the
    /// boot disk defaults to virtio and subsequent disks to ide.
    pub fn driver_at(&self, index: usize) -> DiskDriver {
        match self.driver {
            Some(d) => d,
            None if index == 0 => DiskDriver::Virtio,
            None => DiskDriver::Ide,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
    }
}

/// Firmware boot order, as a sequence of `c` (disk), `d` (cdrom) and `n`
/// (network) devices. Supports conversion from strings such as "cn".
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BootOrder(String);

impl BootOrder {
    pub fn disk_first() -> Self {
        Self("cn".to_string())
    }

    pub fn network_first() -> Self {
        Self("nc".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BootOrder {
    fn default() -> Self {
        Self::disk_first()
    }
}

impl FromStr for BootOrder {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut seen = HashSet::new();
        let valid = !s.is_empty()
            && s.chars().all(|c| matches!(c, 'c' | 'd' | 'n') && seen.insert(c));
        if !valid {
            return Err(ValidationError::InvalidBootOrder(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl Display for BootOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for BootOrder {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'d> Deserialize<'d> for BootOrder {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// Traffic shaping applied to the cluster bridge.
///
/// Bandwidth limiting and the netem knobs (latency, jitter, loss, reorder,
/// corrupt) are mutually exclusive.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkChaos {
    #[serde(default)]
    pub bandwidth_kbps: u64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
    /// Percentages in `0.0..=100.0`.
    #[serde(default)]
    pub packet_loss: f64,
    #[serde(default)]
    pub packet_reorder: f64,
    #[serde(default)]
    pub packet_corrupt: f64,
}

impl NetworkChaos {
    pub fn uses_netem(&self) -> bool {
        self.latency_ms > 0
            || self.jitter_ms > 0
            || self.packet_loss > 0.0
            || self.packet_reorder > 0.0
            || self.packet_corrupt > 0.0
    }

    pub fn is_enabled(&self) -> bool {
        self.bandwidth_kbps > 0 || self.uses_netem()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bandwidth_kbps > 0 && self.uses_netem() {
            return Err(ValidationError::ChaosConflict);
        }
        for (knob, value) in [
            ("loss", self.packet_loss),
            ("reorder", self.packet_reorder),
            ("corrupt", self.packet_corrupt),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ValidationError::ChaosProbability {
                    knob,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Locations used by the CNI plugin chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniConfig {
    pub bin_path: Vec<PathBuf>,
    pub conf_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Tarball of plugins fetched when a required plugin is missing.
    #[serde(default)]
    pub bundle_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
    pub cidrs: Vec<IpNetwork>,
    /// One gateway per CIDR, in the same order.
    pub gateway_addrs: Vec<IpAddr>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    #[serde(default)]
    pub load_balancer_ports: Vec<u16>,
    pub cni: CniConfig,
    #[serde(default)]
    pub no_masquerade_cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub dhcp_skip_hostname: bool,
    #[serde(default)]
    pub chaos: NetworkChaos,
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

impl NetworkRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cidrs.is_empty() {
            return Err(ValidationError::NoCidrs);
        }
        if self.gateway_addrs.len() != self.cidrs.len() {
            return Err(ValidationError::GatewayCount {
                cidrs: self.cidrs.len(),
                gateways: self.gateway_addrs.len(),
            });
        }
        for (cidr, gateway) in self.cidrs.iter().zip(&self.gateway_addrs) {
            if !cidr.contains(*gateway) {
                return Err(ValidationError::GatewayOutsideCidr {
                    gateway: *gateway,
                    cidr: *cidr,
                });
            }
        }
        if self.mtu == 0 {
            return Err(ValidationError::InvalidMtu);
        }
        self.chaos.validate()
    }

    /// The CIDR whose address family matches `ip`, along with its index.
    pub fn cidr_for(&self, ip: IpAddr) -> Option<(usize, &IpNetwork)> {
        self.cidrs.iter().enumerate().find(|(_, c)| c.contains(ip))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// One address per network CIDR, in the same order.
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    /// Encoded machine configuration served to the node.
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub skip_injecting_config: bool,
    /// CPU share in units of 1e-9 CPUs.
    pub nano_cpus: i64,
    /// Memory in bytes.
    pub memory: i64,
    #[serde(default)]
    pub disks: Vec<Disk>,
    /// Published ports, used by the container provider (`host:guest/proto`).
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub default_boot_order: BootOrder,
    #[serde(default)]
    pub extra_kernel_args: Vec<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub tftp_server: Option<IpAddr>,
    #[serde(default)]
    pub ipxe_boot_filename: Option<String>,
    #[serde(default)]
    pub pxe_booted: bool,
    /// Start the guest with a clock far in the past.
    #[serde(default)]
    pub bad_rtc: bool,
}

impl NodeRequest {
    pub fn validate(
        &self,
        network: &NetworkRequest,
    ) -> Result<(), ValidationError> {
        if self.ips.len() != network.cidrs.len() {
            return Err(ValidationError::IpCountMismatch {
                node: self.name.clone(),
                ips: self.ips.len(),
                cidrs: network.cidrs.len(),
            });
        }
        for (ip, cidr) in self.ips.iter().zip(&network.cidrs) {
            if !cidr.contains(*ip) {
                return Err(ValidationError::IpOutsideCidr {
                    node: self.name.clone(),
                    ip: *ip,
                    cidr: *cidr,
                });
            }
        }
        if self.disks.is_empty() {
            return Err(ValidationError::NoDisks);
        }
        if self.nano_cpus <= 0 {
            return Err(ValidationError::NonPositiveResource {
                node: self.name.clone(),
                what: "nano_cpus",
            });
        }
        if self.memory <= 0 {
            return Err(ValidationError::NonPositiveResource {
                node: self.name.clone(),
                what: "memory",
            });
        }
        for (index, disk) in self.disks.iter().enumerate() {
            if disk.driver_at(index) == DiskDriver::Virtiofs {
                if disk.share.is_none() {
                    return Err(ValidationError::VirtiofsWithoutShare {
                        node: self.name.clone(),
                        index,
                    });
                }
            } else if disk.size == 0 {
                return Err(ValidationError::EmptyDisk {
                    node: self.name.clone(),
                    index,
                });
            }
        }
        Ok(())
    }

    /// vCPU count: NanoCPUs rounded half-to-even, at least one.
    pub fn vcpus(&self) -> u32 {
        let cpus = (self.nano_cpus as f64 / 1e9).round_ties_even();
        (cpus as u32).max(1)
    }

    pub fn memory_mib(&self) -> u64 {
        (self.memory.max(0) as u64) / 1024 / 1024
    }

    /// Size of the boot disk in bytes.
    pub fn boot_disk_size(&self) -> u64 {
        self.disks.first().map(|d| d.size).unwrap_or(0)
    }
}

/// Filters over the node list of a request.
pub trait NodeRequests {
    fn control_plane_nodes(&self) -> Vec<&NodeRequest>;
    fn worker_nodes(&self) -> Vec<&NodeRequest>;
    fn pxe_nodes(&self) -> Vec<&NodeRequest>;
}

impl NodeRequests for [NodeRequest] {
    fn control_plane_nodes(&self) -> Vec<&NodeRequest> {
        self.iter().filter(|n| n.node_type.is_control_plane()).collect()
    }

    fn worker_nodes(&self) -> Vec<&NodeRequest> {
        self.iter()
            .filter(|n| n.node_type == NodeType::Worker && !n.pxe_booted)
            .collect()
    }

    fn pxe_nodes(&self) -> Vec<&NodeRequest> {
        self.iter().filter(|n| n.pxe_booted).collect()
    }
}

/// Paths of the artifacts a VM may boot from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootAssets {
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
    #[serde(default)]
    pub initramfs_path: Option<PathBuf>,
    #[serde(default)]
    pub iso_path: Option<PathBuf>,
    #[serde(default)]
    pub usb_path: Option<PathBuf>,
    #[serde(default)]
    pub uki_path: Option<PathBuf>,
    /// Pre-built disk image copied onto each node's boot disk.
    #[serde(default)]
    pub disk_image_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub name: String,
    pub network: NetworkRequest,
    pub nodes: Vec<NodeRequest>,
    #[serde(default)]
    pub assets: BootAssets,
    /// URL chained to by PXE-booted nodes.
    #[serde(default)]
    pub ipxe_boot_script: Option<String>,
    /// Filled in by the CLI when left out of a request file.
    #[serde(default)]
    pub state_directory: PathBuf,
    /// Executable re-invoked to run launchers and auxiliary services.
    #[serde(default)]
    pub self_executable: PathBuf,
    #[serde(default)]
    pub mesh_endpoints: Vec<String>,
    /// Node image used by the container provider.
    #[serde(default)]
    pub container_image: Option<String>,
}

impl ClusterRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyClusterName);
        }
        self.network.validate()?;
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ValidationError::DuplicateNodeName(
                    node.name.clone(),
                ));
            }
            node.validate(&self.network)?;
        }
        Ok(())
    }

    /// `<state_directory>/<name>`
    pub fn cluster_dir(&self) -> PathBuf {
        self.state_directory.join(&self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub(crate) fn network() -> NetworkRequest {
        NetworkRequest {
            name: "c1".to_string(),
            cidrs: vec!["10.5.0.0/24".parse().unwrap()],
            gateway_addrs: vec!["10.5.0.1".parse().unwrap()],
            mtu: DEFAULT_MTU,
            nameservers: vec!["1.1.1.1".parse().unwrap()],
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
        }
    }

    fn node(name: &str, ip: &str) -> NodeRequest {
        NodeRequest {
            name: name.to_string(),
            node_type: NodeType::ControlPlane,
            ips: vec![ip.parse().unwrap()],
            config: None,
            skip_injecting_config: false,
            nano_cpus: 2_000_000_000,
            memory: 2 * 1024 * 1024 * 1024,
            disks: vec![Disk::new(10 * 1024 * 1024 * 1024)],
            ports: vec![],
            default_boot_order: BootOrder::default(),
            extra_kernel_args: vec![],
            uuid: None,
            tftp_server: None,
            ipxe_boot_filename: None,
            pxe_booted: false,
            bad_rtc: false,
        }
    }

    #[test]
    fn node_ip_must_be_in_cidr() {
        let net = network();
        assert!(node("cp0", "10.5.0.2").validate(&net).is_ok());
        assert!(matches!(
            node("cp0", "10.6.0.2").validate(&net),
            Err(ValidationError::IpOutsideCidr { .. })
        ));
    }

    #[test]
    fn node_ip_count_matches_cidrs() {
        let mut net = network();
        net.cidrs.push("fd00::/64".parse().unwrap());
        net.gateway_addrs.push("fd00::1".parse().unwrap());
        assert!(matches!(
            node("cp0", "10.5.0.2").validate(&net),
            Err(ValidationError::IpCountMismatch { ips: 1, cidrs: 2, .. })
        ));
    }

    #[test]
    fn zero_disks_rejected() {
        let mut n = node("cp0", "10.5.0.2");
        n.disks.clear();
        let err = n.validate(&network()).unwrap_err();
        assert_eq!(err.to_string(), "at least one disk is required");
    }

    #[test]
    fn chaos_knobs_are_exclusive() {
        let mut chaos =
            NetworkChaos { bandwidth_kbps: 1000, ..Default::default() };
        assert!(chaos.validate().is_ok());
        chaos.latency_ms = 20;
        assert_eq!(chaos.validate(), Err(ValidationError::ChaosConflict));
    }

    #[test]
    fn disk_driver_defaults() {
        let d = Disk::new(1);
        assert_eq!(d.driver_at(0), DiskDriver::Virtio);
        assert_eq!(d.driver_at(1), DiskDriver::Ide);
        assert_eq!(d.block_size(), 512);
    }

    #[test]
    fn vcpus_round_half_to_even() {
        let mut n = node("cp0", "10.5.0.2");
        n.nano_cpus = 2_500_000_000;
        assert_eq!(n.vcpus(), 2);
        n.nano_cpus = 3_500_000_000;
        assert_eq!(n.vcpus(), 4);
        n.nano_cpus = 100_000_000;
        assert_eq!(n.vcpus(), 1);
    }

    #[test]
    fn boot_order_parse() {
        assert_eq!("nc".parse::<BootOrder>().unwrap(), BootOrder::network_first());
        assert!("cc".parse::<BootOrder>().is_err());
        assert!("x".parse::<BootOrder>().is_err());
        assert!("".parse::<BootOrder>().is_err());
    }

    #[test]
    fn node_filters() {
        let mut w = node("w0", "10.5.0.3");
        w.node_type = NodeType::Worker;
        let mut p = node("p0", "10.5.0.4");
        p.node_type = NodeType::Worker;
        p.pxe_booted = true;
        let nodes = vec![node("cp0", "10.5.0.2"), w, p];
        assert_eq!(nodes.control_plane_nodes().len(), 1);
        assert_eq!(nodes.worker_nodes()[0].name, "w0");
        assert_eq!(nodes.pxe_nodes()[0].name, "p0");
    }

    #[test]
    fn node_type_strings() {
        assert_eq!(NodeType::ControlPlane.to_string(), "controlplane");
        assert_eq!(
            serde_json::to_string(&NodeType::Init).unwrap(),
            "\"init\""
        );
        assert_eq!(
            "worker".parse::<NodeType>().unwrap(),
            NodeType::Worker
        );
    }

    #[test]
    fn request_from_yaml() {
        let yaml = r#"
name: c1
state_directory: /tmp/clusters
self_executable: /usr/bin/provisioner
network:
  name: c1
  cidrs: ["10.5.0.0/24"]
  gateway_addrs: ["10.5.0.1"]
  cni:
    bin_path: ["/opt/cni/bin"]
    conf_dir: /etc/cni/conf.d
    cache_dir: /var/lib/cni
nodes:
  - name: cp0
    type: controlplane
    ips: ["10.5.0.2"]
    nano_cpus: 2000000000
    memory: 2147483648
    disks:
      - size: 10737418240
"#;
        let req: ClusterRequest = serde_yaml::from_str(yaml).unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.network.mtu, DEFAULT_MTU);
        assert_eq!(req.nodes[0].default_boot_order.as_str(), "cn");
        assert_eq!(req.cluster_dir(), PathBuf::from("/tmp/clusters/c1"));
    }
}
