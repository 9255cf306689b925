// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host checks run before anything is created.

use std::fs::OpenOptions;

use anyhow::Result;
use provision_types::{ClusterRequest, ConfigInjection, DiskDriver, Options};
use slog::{debug, Logger};

use crate::launcher::qemu_args::qemu_binary;
use crate::network;
use crate::process::find_executable;
use crate::Error;

use super::pflash;

fn preflight(msg: impl Into<String>) -> anyhow::Error {
    Error::Preflight(msg.into()).into()
}

fn require_binary(name: &str, hint: &str) -> Result<()> {
    match find_executable(name) {
        Some(_) => Ok(()),
        None => Err(preflight(format!("{name} not found in PATH: {hint}"))),
    }
}

/// Binaries and devices a cluster of `request` needs, in check order.
pub(super) fn binaries(
    request: &ClusterRequest,
    opts: &Options,
) -> Vec<(String, &'static str)> {
    let mut bins = vec![
        (
            qemu_binary(opts.target_arch).to_string(),
            "please install QEMU for the target architecture",
        ),
        ("iptables".to_string(), "iptables is required to route VM traffic"),
        ("ip".to_string(), "iproute2 is required to manage the bridge"),
    ];
    if opts.tpm.is_some() {
        bins.push(("swtpm".to_string(), "swtpm is required for TPM emulation"));
    }
    if request.network.chaos.is_enabled() {
        bins.push(("tc".to_string(), "tc is required for network chaos"));
    }
    let metal_iso = opts.config_injection == ConfigInjection::MetalIso
        && request
            .nodes
            .iter()
            .any(|n| n.config.is_some() && !n.skip_injecting_config);
    if metal_iso {
        bins.push(("mkisofs".to_string(), "mkisofs is required to build metal-iso"));
    }
    bins
}

pub(super) fn uses_virtiofs(request: &ClusterRequest) -> bool {
    request.nodes.iter().any(|n| {
        n.disks
            .iter()
            .enumerate()
            .any(|(i, d)| d.driver_at(i) == DiskDriver::Virtiofs)
    })
}

fn require_root(euid: nix::unistd::Uid) -> Result<()> {
    if !euid.is_root() {
        return Err(preflight(
            "root privileges are required to create bridges and network namespaces",
        ));
    }
    Ok(())
}

pub(super) async fn check(
    log: &Logger,
    request: &ClusterRequest,
    opts: &Options,
) -> Result<()> {
    require_root(nix::unistd::geteuid())?;

    for (bin, hint) in binaries(request, opts) {
        require_binary(&bin, hint)?;
    }

    if opts.use_kvm {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .map_err(|e| {
                preflight(format!(
                    "error opening /dev/kvm ({e}), please make sure KVM \
                     support is enabled in Linux kernel"
                ))
            })?;
    }

    pflash::check_sources(&pflash::specs(opts.target_arch, opts.uefi_enabled))?;

    if uses_virtiofs(request) {
        let bin = opts
            .virtiofsd_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "virtiofsd".to_string());
        require_binary(&bin, "virtiofsd is required for virtiofs disks")?;
    }

    network::ensure_cni_plugins(log, &request.network.cni).await?;
    debug!(log, "preflight checks passed");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use provision_types::{Disk, TpmVersion};

    use crate::providers::qemu::test::request;

    #[test]
    fn root_is_required() {
        use nix::unistd::Uid;

        assert!(require_root(Uid::from_raw(0)).is_ok());
        let err = require_root(Uid::from_raw(1000)).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Preflight(_))));
    }

    #[test]
    fn optional_binaries() {
        let mut req = request();
        let mut opts = Options::default();
        let names = |req: &ClusterRequest, opts: &Options| {
            binaries(req, opts).into_iter().map(|(b, _)| b).collect::<Vec<_>>()
        };
        assert_eq!(names(&req, &opts), ["qemu-system-x86_64", "iptables", "ip"]);

        opts.tpm = Some(TpmVersion::V2_0);
        opts.config_injection = ConfigInjection::MetalIso;
        req.nodes[0].config = Some("version: v1alpha1\n".to_string());
        assert_eq!(
            names(&req, &opts),
            ["qemu-system-x86_64", "iptables", "ip", "swtpm", "mkisofs"]
        );
    }

    #[test]
    fn virtiofs_detection() {
        let mut req = request();
        assert!(!uses_virtiofs(&req));
        let mut share = Disk::new(0);
        share.driver = Some(DiskDriver::Virtiofs);
        share.share = Some("/srv/share".into());
        req.nodes[0].disks.push(share);
        assert!(uses_virtiofs(&req));
    }

    #[test]
    fn missing_binary_is_preflight() {
        let err = require_binary("no-such-hypervisor", "install it").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Preflight(_))));
        assert!(err.to_string().contains("install it"));
    }
}
