// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attachment of one VM to the cluster bridge through the CNI chain.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cni::{CniRuntime, FileLock, NetNs, NetworkConfigList, RuntimeConf};
use ipam::{Family, IpamRecord, MacAddr};
use ipnetwork::IpNetwork;
use slog::{info, warn, Logger};

use super::{LaunchConfig, NetworkConfig};
use crate::network;
use crate::state::CNI_LOCK_FILE;
use crate::Error;

/// Longest chain name iptables accepts from the CNI plugins.
const MAX_CHAIN_LENGTH: usize = 28;
const CHAIN_PREFIX: &str = "CNI-";

/// Name of the NAT chain the bridge plugin creates for one attachment:
/// `CNI-` and a SHA-512 prefix of the network name and container id.
pub fn nat_chain_name(network: &str, container_id: &str) -> String {
    let input = format!("{network}{container_id}");
    let digest = ring::digest::digest(&ring::digest::SHA512, input.as_bytes());
    let hex = hex::encode(digest.as_ref());
    format!("{CHAIN_PREFIX}{}", &hex[..MAX_CHAIN_LENGTH - CHAIN_PREFIX.len()])
}

/// One lease per node address, with nameservers of the lease's family.
pub fn ipam_records(config: &LaunchConfig, mac: MacAddr) -> Vec<IpamRecord> {
    let net = &config.network;
    net.cidrs
        .iter()
        .zip(&net.ips)
        .enumerate()
        .map(|(j, (cidr, ip))| {
            let family = Family::of(ip);
            IpamRecord {
                ip: *ip,
                netmask: cidr.prefix(),
                mac,
                hostname: net.hostname.clone().unwrap_or_default(),
                gateway: net.gateway_addrs.get(j).copied(),
                mtu: net.mtu,
                nameservers: net
                    .nameservers
                    .iter()
                    .filter(|ns| Family::of(ns) == family)
                    .copied()
                    .collect(),
                tftp_server: config.tftp_server.clone(),
                ipxe_boot_filename: config.ipxe_boot_filename.clone(),
            }
        })
        .collect()
}

/// Static addresses of the node with the prefix of their CIDR.
fn node_addresses(net: &NetworkConfig) -> Result<Vec<IpNetwork>> {
    net.cidrs
        .iter()
        .zip(&net.ips)
        .map(|(cidr, ip)| {
            IpNetwork::new(*ip, cidr.prefix())
                .with_context(|| format!("bad address {ip} in {cidr}"))
        })
        .collect()
}

/// `CNI_ARGS` handing the node's addresses to the static IPAM plugin.
fn static_args(net: &NetworkConfig) -> Result<Vec<(String, String)>> {
    Ok(network::static_ipam_args(&node_addresses(net)?, &net.gateway_addrs))
}

/// A live attachment: the namespace the hypervisor runs in, and the TAP
/// and MAC of the guest NIC.
pub struct Attachment {
    pub netns: NetNs,
    pub tap: String,
    pub mac: MacAddr,
    runtime: CniRuntime,
    list: NetworkConfigList,
    rt: RuntimeConf,
    lock_path: PathBuf,
}

impl Attachment {
    pub fn container_id(&self) -> &str {
        &self.rt.container_id
    }

    /// Run the chain again in the same namespace before the hypervisor is
    /// restarted, so the static addresses are assigned afresh.
    pub async fn reassign(&mut self, log: &Logger, config: &LaunchConfig) -> Result<()> {
        self.rt.args = static_args(&config.network)?;
        let (tap, mac) = add(log, config, &self.runtime, &self.rt).await?;
        if mac != self.mac {
            record_leases(config, mac)?;
        }
        self.tap = tap;
        self.mac = mac;
        Ok(())
    }

    /// Run DEL for the attachment and drop its namespace.
    pub async fn detach(self, log: &Logger) -> Result<()> {
        let res = {
            let _lock = FileLock::acquire_async(&self.lock_path).await?;
            self.runtime.del_network_list(&self.list, &self.rt).await
        };
        if let Err(e) = self.netns.remove() {
            warn!(log, "failed to remove network namespace"; "error" => %e);
        }
        res.context("error deleting CNI network")
    }
}

/// Create a namespace for the VM, run the chain in it and record the
/// node's leases for the DHCP server.
pub async fn attach(log: &Logger, config: &LaunchConfig) -> Result<Attachment> {
    let net = &config.network;
    let container_id = uuid::Uuid::new_v4().to_string();
    let netns = NetNs::create(&format!("provision-{}", cni::random_id()))
        .context("failed to create network namespace")?;

    match setup(log, config, &container_id, &netns).await {
        Ok((runtime, rt, tap, mac)) => Ok(Attachment {
            netns,
            tap,
            mac,
            runtime,
            list: net.vm_cni_config.clone(),
            rt,
            lock_path: lock_path(&config.state_path),
        }),
        Err(e) => {
            if let Err(rm) = netns.remove() {
                warn!(log, "failed to remove network namespace"; "error" => %rm);
            }
            Err(e)
        }
    }
}

async fn setup(
    log: &Logger,
    config: &LaunchConfig,
    container_id: &str,
    netns: &NetNs,
) -> Result<(CniRuntime, RuntimeConf, String, MacAddr)> {
    let runtime = network::cni_runtime(&config.network.cni);
    let rt = RuntimeConf {
        container_id: container_id.to_string(),
        netns: netns.path().to_path_buf(),
        ifname: "veth0".to_string(),
        args: static_args(&config.network)?,
    };
    let (tap, mac) = add(log, config, &runtime, &rt).await?;
    record_leases(config, mac)?;
    Ok((runtime, rt, tap, mac))
}

/// ADD the chain for `rt` and exempt the VM's broadcast and unmasqueraded
/// traffic from SNAT. Returns the TAP name and the guest MAC.
async fn add(
    log: &Logger,
    config: &LaunchConfig,
    runtime: &CniRuntime,
    rt: &RuntimeConf,
) -> Result<(String, MacAddr)> {
    let net = &config.network;
    let container_id = rt.container_id.as_str();
    let result = {
        let _lock = FileLock::acquire_async(&lock_path(&config.state_path)).await?;
        // A previous launcher or run of this VM may have left an
        // attachment behind; DEL is idempotent for the plugins in the chain.
        if let Err(e) = runtime.del_network_list(&net.vm_cni_config, rt).await {
            warn!(log, "stale CNI cleanup failed"; "error" => %e);
        }
        runtime
            .add_network_list(&net.vm_cni_config, rt)
            .await
            .map_err(|e| Error::External(format!("error provisioning CNI network: {e}")))?
    };

    let (vm, tap) = result
        .vm_tap_pair(container_id)
        .context("unexpected CNI result")?;
    let mac: MacAddr = vm
        .mac
        .parse()
        .with_context(|| format!("CNI reported bad MAC {:?}", vm.mac))?;
    let tap = tap.name.clone();
    info!(log, "attached to cluster network";
        "tap" => &tap, "mac" => %mac, "container_id" => container_id);

    let chain = nat_chain_name(&net.vm_cni_config.name, container_id);
    let broadcast: IpNetwork = "255.255.255.255/32".parse()?;
    network::nat_accept(&chain, &broadcast)
        .await
        .context("failed to insert broadcast exception")?;
    for cidr in &net.no_masquerade_cidrs {
        network::nat_accept(&chain, cidr)
            .await
            .with_context(|| format!("failed to exempt {cidr} from masquerade"))?;
    }
    Ok((tap, mac))
}

fn record_leases(config: &LaunchConfig, mac: MacAddr) -> Result<()> {
    let db = config.state_path.join(ipam::DB_FILE);
    for record in ipam_records(config, mac) {
        ipam::append(&db, &record)
            .with_context(|| format!("failed to record lease {}", record.ip))?;
    }
    Ok(())
}

fn lock_path(state_path: &Path) -> PathBuf {
    state_path.join(CNI_LOCK_FILE)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::launcher::test::launch_config;

    #[test]
    fn chain_name_fits_iptables() {
        let name = nat_chain_name("c1", "7d3c5e0a-0000-4000-8000-000000000000");
        assert_eq!(name.len(), MAX_CHAIN_LENGTH);
        assert!(name.starts_with("CNI-"));
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, nat_chain_name("c1", "7d3c5e0a-0000-4000-8000-000000000000"));
        assert_ne!(name, nat_chain_name("c2", "7d3c5e0a-0000-4000-8000-000000000000"));
    }

    #[test]
    fn one_lease_per_cidr() {
        let mut config = launch_config();
        config.network.cidrs.push("fd00:5::/64".parse().unwrap());
        config.network.ips.push("fd00:5::2".parse().unwrap());
        config.network.gateway_addrs.push("fd00:5::1".parse().unwrap());
        config.network.nameservers =
            vec!["1.1.1.1".parse().unwrap(), "2606:4700:4700::1111".parse().unwrap()];
        config.ipxe_boot_filename = Some("ipxe/amd64/snp.efi".to_string());

        let mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let rows = ipam_records(&config, mac);
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].ip.to_string(), "10.5.0.2");
        assert_eq!(rows[0].netmask, 24);
        assert_eq!(rows[0].gateway, Some("10.5.0.1".parse().unwrap()));
        assert_eq!(rows[0].nameservers, ["1.1.1.1".parse::<std::net::IpAddr>().unwrap()]);
        assert_eq!(rows[0].hostname, "cp0");
        assert_eq!(rows[0].ipxe_boot_filename.as_deref(), Some("ipxe/amd64/snp.efi"));

        assert_eq!(rows[1].netmask, 64);
        assert_eq!(rows[1].family(), Family::V6);
        assert_eq!(
            rows[1].nameservers,
            ["2606:4700:4700::1111".parse::<std::net::IpAddr>().unwrap()]
        );
    }

    #[test]
    fn static_addresses_carry_prefix() {
        let config = launch_config();
        let addrs = node_addresses(&config.network).unwrap();
        assert_eq!(addrs[0].to_string(), "10.5.0.2/24");
    }

    #[test]
    fn static_args_follow_the_node_addresses() {
        let mut config = launch_config();
        config.network.cidrs.push("fd00:5::/64".parse().unwrap());
        config.network.ips.push("fd00:5::2".parse().unwrap());
        config.network.gateway_addrs.push("fd00:5::1".parse().unwrap());

        let args = static_args(&config.network).unwrap();
        assert_eq!(args[0], ("IP".to_string(), "10.5.0.2/24,fd00:5::2/64".to_string()));
        assert_eq!(args[1], ("GATEWAY".to_string(), "10.5.0.1,fd00:5::1".to_string()));
        assert_eq!(args[2], ("IgnoreUnknown".to_string(), "1".to_string()));
    }
}
