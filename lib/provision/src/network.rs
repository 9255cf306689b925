// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host side of the cluster network: the bridge, its firewall exception
//! and optional traffic shaping.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::future::Future;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use cni::{CniRuntime, NetNs, NetworkConfigList, RuntimeConf};
use ipnetwork::IpNetwork;
use provision_types::{CniConfig, NetworkChaos, NetworkRequest};
use slog::{info, warn, Logger};

use crate::process::run;
use crate::state::State;
use crate::{Error, MultiError};

const BRIDGE_PREFIX: &str = "talos";
const DOCKER_USER_CHAIN: &str = "DOCKER-USER";

/// Deterministic bridge name for a network: `talos` followed by the first
/// eight hex digits of the SHA-256 of its name.
pub fn bridge_name(network_name: &str) -> String {
    let digest =
        ring::digest::digest(&ring::digest::SHA256, network_name.as_bytes());
    let hex = hex::encode(digest.as_ref());
    format!("{BRIDGE_PREFIX}{}", &hex[..8])
}

/// The `n`th address of `cidr` with its prefix, e.g. `10.5.0.2/24`.
pub fn nth_address(cidr: &IpNetwork, n: u128) -> Result<IpNetwork> {
    let ip = match cidr {
        IpNetwork::V4(net) => {
            let base = u32::from(net.network()) as u128;
            let addr = u32::try_from(base + n)
                .map_err(|_| anyhow!("address {n} overflows {cidr}"))?;
            IpAddr::V4(Ipv4Addr::from(addr))
        }
        IpNetwork::V6(net) => {
            let base = u128::from(net.network());
            let addr = base
                .checked_add(n)
                .ok_or_else(|| anyhow!("address {n} overflows {cidr}"))?;
            IpAddr::V6(Ipv6Addr::from(addr))
        }
    };
    if !cidr.contains(ip) {
        bail!("{cidr} has no address {n}");
    }
    Ok(IpNetwork::new(ip, cidr.prefix())?)
}

/// `CNI_ARGS` consumed by the static IPAM plugin. Multiple families are
/// passed comma-separated in a single call.
pub fn static_ipam_args(
    ips: &[IpNetwork],
    gateways: &[IpAddr],
) -> Vec<(String, String)> {
    let join = |items: Vec<String>| items.join(",");
    vec![
        ("IP".to_string(), join(ips.iter().map(ToString::to_string).collect())),
        (
            "GATEWAY".to_string(),
            join(gateways.iter().map(ToString::to_string).collect()),
        ),
        ("IgnoreUnknown".to_string(), "1".to_string()),
    ]
}

pub fn cni_runtime(cni: &CniConfig) -> CniRuntime {
    CniRuntime::new(cni.bin_path.clone(), cni.cache_dir.clone())
}

/// Make sure every plugin of the VM chain is installed, fetching the bundle
/// into the first bin path when some are missing.
pub async fn ensure_cni_plugins(log: &Logger, cni: &CniConfig) -> Result<()> {
    let runtime = cni_runtime(cni);
    let missing = runtime.missing_plugins(cni::bundle::REQUIRED_PLUGINS);
    if missing.is_empty() {
        return Ok(());
    }
    let (Some(url), Some(dest)) = (&cni.bundle_url, cni.bin_path.first())
    else {
        return Err(Error::Preflight(format!(
            "CNI plugins {missing:?} not found in {:?}",
            cni.bin_path
        ))
        .into());
    };

    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let _lock =
        cni::FileLock::acquire_async(&dest.join(".download.lock")).await?;
    // Another cluster may have finished the download while we waited.
    let missing = runtime.missing_plugins(cni::bundle::REQUIRED_PLUGINS);
    if missing.is_empty() {
        return Ok(());
    }
    info!(log, "downloading CNI plugins"; "url" => url, "missing" => ?missing);
    cni::bundle::download(url, dest).await?;

    let missing = runtime.missing_plugins(cni::bundle::REQUIRED_PLUGINS);
    if !missing.is_empty() {
        return Err(Error::Preflight(format!(
            "CNI bundle {url} lacks plugins {missing:?}"
        ))
        .into());
    }
    Ok(())
}

/// Bring up the cluster bridge and record the chain VMs will attach with.
///
/// The bridge plugin only creates the bridge and assigns it the gateway
/// addresses as a side effect of an ADD, so a throwaway attachment is
/// added in a scratch namespace and deleted again.
pub async fn create(
    log: &Logger,
    state: &mut State,
    network: &NetworkRequest,
) -> Result<()> {
    let bridge = bridge_name(&network.name);
    let bridge_conf = cni::config::bridge_only(&network.name, &bridge, network.mtu);
    let runtime = cni_runtime(&network.cni);

    let fake_ips = network
        .cidrs
        .iter()
        .map(|cidr| nth_address(cidr, 2))
        .collect::<Result<Vec<_>>>()?;

    let ns = NetNs::create(&format!("provision-{}", cni::random_id()))
        .context("failed to create scratch network namespace")?;
    let rt = RuntimeConf {
        container_id: uuid::Uuid::new_v4().to_string(),
        netns: ns.path().to_path_buf(),
        ifname: "veth0".to_string(),
        args: static_ipam_args(&fake_ips, &network.gateway_addrs),
    };
    let res = bring_up_bridge(&runtime, &bridge_conf, &rt).await;
    if let Err(e) = ns.remove() {
        warn!(log, "failed to remove scratch namespace"; "error" => %e);
    }
    res?;
    info!(log, "created bridge"; "bridge" => &bridge, "network" => &network.name);

    state.vm_cni_config =
        Some(cni::config::vm_chain(&network.name, &bridge, network.mtu));
    state.bridge_name = bridge;

    allow_bridge_traffic(&state.bridge_name)
        .await
        .context("error configuring DOCKER-USER chain")?;

    if network.chaos.is_enabled() {
        configure_chaos(log, &state.bridge_name, &network.chaos).await?;
    }
    Ok(())
}

async fn bring_up_bridge(
    runtime: &CniRuntime,
    conf: &NetworkConfigList,
    rt: &RuntimeConf,
) -> Result<()> {
    runtime
        .add_network_list(conf, rt)
        .await
        .context("error provisioning bridge CNI network")?;
    runtime
        .del_network_list(conf, rt)
        .await
        .context("error deleting bridge CNI network")
}

/// Remove the bridge and its firewall exception. The rule is dropped even
/// when the link is already gone or fails to delete.
pub async fn destroy(bridge: &str) -> Result<()> {
    teardown(bridge, link_exists(bridge), |program, args| run(program, args)).await
}

async fn teardown<F, Fut>(bridge: &str, link_present: bool, run: F) -> Result<()>
where
    F: Fn(&'static str, Vec<String>) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let mut errs = MultiError::new();

    if link_present {
        errs.check(
            run("ip", args(&["link", "delete", bridge]))
                .await
                .with_context(|| format!("error deleting bridge interface {bridge}")),
        );
    }

    let rule = bridge_rule(bridge);
    let chain_present = run(
        "iptables",
        args(&["-t", "filter", "-n", "-L", DOCKER_USER_CHAIN]),
    )
    .await
    .is_ok();
    if chain_present {
        let mut check = args(&["-t", "filter", "-C", DOCKER_USER_CHAIN]);
        check.extend(args(&rule));
        if run("iptables", check).await.is_ok() {
            let mut delete = args(&["-t", "filter", "-D", DOCKER_USER_CHAIN]);
            delete.extend(args(&rule));
            errs.check(
                run("iptables", delete)
                    .await
                    .context("error dropping bridge traffic rule"),
            );
        }
    }
    errs.into_result()
}

fn bridge_rule(bridge: &str) -> [&str; 6] {
    ["-i", bridge, "-o", bridge, "-j", "ACCEPT"]
}

async fn iptables(args: &[&str]) -> Result<String> {
    run("iptables", args).await
}

async fn chain_exists(table: &str, chain: &str) -> bool {
    iptables(&["-t", table, "-n", "-L", chain]).await.is_ok()
}

async fn rule_exists(table: &str, chain: &str, rule: &[&str]) -> bool {
    let mut args = vec!["-t", table, "-C", chain];
    args.extend_from_slice(rule);
    iptables(&args).await.is_ok()
}

/// Host container runtimes load br_netfilter, which would subject
/// bridge-local frames to their filter rules; accept them up front.
async fn allow_bridge_traffic(bridge: &str) -> Result<()> {
    if !chain_exists("filter", DOCKER_USER_CHAIN).await {
        iptables(&["-t", "filter", "-N", DOCKER_USER_CHAIN]).await?;
    }
    let rule = bridge_rule(bridge);
    if rule_exists("filter", DOCKER_USER_CHAIN, &rule).await {
        return Ok(());
    }
    let mut args = vec!["-t", "filter", "-I", DOCKER_USER_CHAIN, "1"];
    args.extend_from_slice(&rule);
    iptables(&args).await.map(drop)
}

/// Insert an ACCEPT for `dest` at the top of `chain` in the nat table,
/// unless it is already present.
pub async fn nat_accept(chain: &str, dest: &IpNetwork) -> Result<()> {
    let dest = dest.to_string();
    let rule = ["-d", dest.as_str(), "-j", "ACCEPT"];
    if rule_exists("nat", chain, &rule).await {
        return Ok(());
    }
    let mut args = vec!["-t", "nat", "-I", chain, "1"];
    args.extend_from_slice(&rule);
    iptables(&args).await.map(drop)
}

/// Kernel packet scheduler clock: microseconds-to-ticks factor from the
/// contents of `/proc/net/psched`.
pub fn ticks_in_usec(psched: &str) -> Result<f64> {
    let parts: Vec<_> = psched.split_whitespace().collect();
    if parts.len() < 3 {
        bail!("unexpected psched format {psched:?}");
    }
    let mut vals = [0u64; 3];
    for (v, part) in vals.iter_mut().zip(&parts) {
        *v = u64::from_str_radix(part, 16)
            .with_context(|| format!("bad psched field {part:?}"))?;
    }
    if vals[2] == 1_000_000_000 {
        vals[0] = vals[1];
    }
    let clock_factor = vals[2] as f64 / 1_000_000.0;
    Ok(vals[0] as f64 / vals[1] as f64 * clock_factor)
}

/// Token bucket parameters for a bandwidth cap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tbf {
    /// Bytes per second.
    pub rate: u64,
    pub burst: u64,
    /// Bytes that may queue waiting for tokens.
    pub limit: u64,
    /// Bucket size in scheduler ticks.
    pub buffer: u64,
}

impl Tbf {
    const LATENCY_SECS: f64 = 0.2;
    const BURST: u64 = 50_000;

    pub fn new(bandwidth_kbps: u64, ticks_in_usec: f64) -> Self {
        let rate = bandwidth_kbps * 1000 / 8;
        let burst = Self::BURST;
        let limit = (rate as f64 * Self::LATENCY_SECS + burst as f64) as u64;
        let buffer =
            (1_000_000.0 * burst as f64 / rate as f64 * ticks_in_usec) as u64;
        Self { rate, burst, limit, buffer }
    }

    pub fn tc_args(&self, dev: &str) -> Vec<String> {
        [
            "qdisc", "add", "dev", dev, "root", "handle", "1:", "tbf", "rate",
        ]
        .iter()
        .map(ToString::to_string)
        .chain([
            format!("{}bps", self.rate),
            "burst".to_string(),
            self.burst.to_string(),
            "limit".to_string(),
            self.limit.to_string(),
        ])
        .collect()
    }
}

/// `tc` arguments attaching a netem qdisc for the latency/loss knobs.
pub fn netem_args(dev: &str, chaos: &NetworkChaos) -> Vec<String> {
    let mut args: Vec<String> =
        ["qdisc", "add", "dev", dev, "root", "handle", "1:", "netem"]
            .iter()
            .map(ToString::to_string)
            .collect();
    args.extend([
        "limit".to_string(),
        "1000".to_string(),
        "delay".to_string(),
        format!("{}ms", chaos.latency_ms),
        format!("{}ms", chaos.jitter_ms),
        "loss".to_string(),
        format!("{}%", chaos.packet_loss),
        "reorder".to_string(),
        format!("{}%", chaos.packet_reorder),
        "corrupt".to_string(),
        format!("{}%", chaos.packet_corrupt),
    ]);
    args
}

async fn configure_chaos(
    log: &Logger,
    bridge: &str,
    chaos: &NetworkChaos,
) -> Result<()> {
    chaos.validate().map_err(Error::from)?;
    info!(log, "network chaos enabled"; "interface" => bridge);

    let args = if chaos.bandwidth_kbps > 0 {
        let psched = tokio::fs::read_to_string("/proc/net/psched")
            .await
            .context("could not read /proc/net/psched")?;
        let tbf = Tbf::new(chaos.bandwidth_kbps, ticks_in_usec(&psched)?);
        info!(log, "bandwidth limit";
            "kbps" => chaos.bandwidth_kbps, "buffer_ticks" => tbf.buffer);
        tbf.tc_args(bridge)
    } else {
        info!(log, "netem";
            "latency_ms" => chaos.latency_ms,
            "jitter_ms" => chaos.jitter_ms,
            "loss_pct" => chaos.packet_loss,
            "reorder_pct" => chaos.packet_reorder,
            "corrupt_pct" => chaos.packet_corrupt);
        netem_args(bridge, chaos)
    };
    run("tc", &args).await.context("could not add qdisc")?;
    Ok(())
}

/// True when an interface with this name exists on the host.
pub fn link_exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bridge_name_is_hash_prefix() {
        let name = bridge_name("c1");
        assert_eq!(name, "talosd0f631ca");
        assert_ne!(name, bridge_name("c2"));
    }

    /// Runs `teardown` against a fake command runner; `failing` programs
    /// return an error. Returns the recorded command lines.
    async fn fake_teardown(link_present: bool, failing: &'static str) -> (Result<()>, Vec<String>) {
        let calls = std::sync::Mutex::new(Vec::new());
        let res = teardown("talos1", link_present, |program, args| {
            calls.lock().unwrap().push(format!("{program} {}", args.join(" ")));
            async move {
                if program == failing {
                    bail!("{program} failed");
                }
                Ok(String::new())
            }
        })
        .await;
        (res, calls.into_inner().unwrap())
    }

    #[tokio::test]
    async fn teardown_drops_rule_without_link() {
        let (res, calls) = fake_teardown(false, "").await;
        res.unwrap();
        assert!(calls.iter().all(|c| !c.starts_with("ip ")), "{calls:?}");
        assert_eq!(
            calls.last().map(String::as_str),
            Some("iptables -t filter -D DOCKER-USER -i talos1 -o talos1 -j ACCEPT")
        );
    }

    #[tokio::test]
    async fn teardown_drops_rule_after_link_failure() {
        let (res, calls) = fake_teardown(true, "ip").await;
        assert!(res.unwrap_err().to_string().contains("talos1"));
        assert_eq!(calls[0], "ip link delete talos1");
        assert!(calls.iter().any(|c| c.contains("-D DOCKER-USER")), "{calls:?}");
    }

    proptest! {
        #[test]
        fn bridge_name_depends_only_on_name(name in "[a-z0-9-]{1,32}") {
            let digest = ring::digest::digest(&ring::digest::SHA256, name.as_bytes());
            let expected = format!("talos{}", &hex::encode(digest.as_ref())[..8]);
            prop_assert_eq!(bridge_name(&name), expected);
        }
    }

    #[test]
    fn nth_addresses() {
        let v4: IpNetwork = "10.5.0.0/24".parse().unwrap();
        assert_eq!(nth_address(&v4, 2).unwrap().to_string(), "10.5.0.2/24");
        assert!(nth_address(&v4, 300).is_err());
        let v6: IpNetwork = "fd00:1::/64".parse().unwrap();
        assert_eq!(nth_address(&v6, 2).unwrap().to_string(), "fd00:1::2/64");
    }

    #[test]
    fn static_ipam_args_join_families() {
        let args = static_ipam_args(
            &["10.5.0.2/24".parse().unwrap(), "fd00::2/64".parse().unwrap()],
            &["10.5.0.1".parse().unwrap(), "fd00::1".parse().unwrap()],
        );
        assert_eq!(
            args,
            [
                ("IP".to_string(), "10.5.0.2/24,fd00::2/64".to_string()),
                ("GATEWAY".to_string(), "10.5.0.1,fd00::1".to_string()),
                ("IgnoreUnknown".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn psched_ticks() {
        let t = ticks_in_usec("000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        assert!((t - 15.625).abs() < 1e-9, "{t}");
        // A 1GHz third field selects the compatibility path.
        let t = ticks_in_usec("1 2 3b9aca00").unwrap();
        assert!((t - 1000.0).abs() < 1e-9, "{t}");
        let t = ticks_in_usec("00000001 00000001 000f4240 00000001").unwrap();
        assert!((t - 1.0).abs() < 1e-9, "{t}");
        assert!(ticks_in_usec("1 2").is_err());
    }

    #[test]
    fn tbf_parameters() {
        let tbf = Tbf::new(8000, 1.0);
        assert_eq!(tbf.rate, 1_000_000);
        assert_eq!(tbf.limit, 250_000);
        assert_eq!(tbf.buffer, 50_000);
        assert_eq!(
            tbf.tc_args("br0").join(" "),
            "qdisc add dev br0 root handle 1: tbf rate 1000000bps burst 50000 limit 250000"
        );
    }

    #[test]
    fn netem_parameters() {
        let chaos = NetworkChaos {
            latency_ms: 100,
            jitter_ms: 10,
            packet_loss: 1.5,
            ..Default::default()
        };
        assert_eq!(
            netem_args("br0", &chaos).join(" "),
            "qdisc add dev br0 root handle 1: netem limit 1000 delay 100ms 10ms \
             loss 1.5% reorder 0% corrupt 0%"
        );
    }
}
