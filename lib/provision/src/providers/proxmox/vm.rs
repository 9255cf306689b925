// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM lifecycle on a Proxmox node.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use ipam::MacAddr;
use provision_types::{NodeRequest, TpmVersion};
use serde_json::{Map, Value};
use slog::{info, warn, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::client::{upid, Client, VmInfo, VmStatus};
use crate::Error;

const GIB: u64 = 1 << 30;
const MIN_MEMORY: i64 = 2 << 30;
const MAX_MEMORY_MIB: u64 = 1 << 20;
const MAX_DISKS: usize = 16;
const MIN_BOOT_DISK: u64 = 10 * GIB;
const MIN_DATA_DISK: u64 = GIB;
const MAX_DISK: u64 = 64 << 40;
const MAX_VCPUS: u32 = 128;

/// Uploaded ISOs smaller than this are treated as broken.
const MIN_ISO_SIZE: u64 = 100 << 20;

const CREATE_TIMEOUT: Duration = Duration::from_secs(120);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Where ISOs already on the hypervisor live when referenced by path.
const ISO_TEMPLATE_DIR: &str = "/var/lib/vz/template/iso/";

const IOMMU_ARGS: &str = "-machine q35,accel=kvm,smm=on,kernel-irqchip=split \
                          -device intel-iommu,intremap=on,device-iotlb=on";

/// Sizes checked against what a Proxmox VM can have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resources {
    pub cores: u32,
    pub memory_mib: u64,
    pub disks_gib: Vec<u64>,
}

fn invalid(node: &NodeRequest, msg: impl std::fmt::Display) -> Error {
    Error::UserInput(format!("node {}: {msg}", node.name))
}

pub fn validate(node: &NodeRequest) -> Result<Resources, Error> {
    if node.memory < MIN_MEMORY {
        return Err(invalid(node, "memory must be at least 2 GiB"));
    }
    let memory_mib = node.memory_mib();
    if memory_mib > MAX_MEMORY_MIB {
        return Err(invalid(node, "memory must be at most 1 TiB"));
    }
    if node.disks.is_empty() || node.disks.len() > MAX_DISKS {
        return Err(invalid(node, format!("must have 1 to {MAX_DISKS} disks")));
    }
    let mut disks_gib = Vec::with_capacity(node.disks.len());
    for (i, disk) in node.disks.iter().enumerate() {
        let min = if i == 0 { MIN_BOOT_DISK } else { MIN_DATA_DISK };
        if disk.size < min {
            return Err(invalid(
                node,
                format!("disk {i} must be at least {} GiB", min / GIB),
            ));
        }
        if disk.size > MAX_DISK {
            return Err(invalid(node, format!("disk {i} must be at most 64 TiB")));
        }
        disks_gib.push(disk.size / GIB);
    }
    let cores = node.vcpus();
    if cores > MAX_VCPUS {
        return Err(invalid(node, format!("at most {MAX_VCPUS} vCPUs are supported")));
    }
    Ok(Resources { cores, memory_mib, disks_gib })
}

/// What the VM boots from first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootMedia {
    Network,
    Iso { storage: String, file: String },
    Disk,
}

impl BootMedia {
    /// Secure Boot ISOs must boot from the CD alone; falling through to an
    /// empty disk loops on Access Denied.
    pub fn is_secure_boot(&self) -> bool {
        matches!(self, BootMedia::Iso { file, .. } if file.to_lowercase().contains("secureboot"))
    }

    /// `(boot, bootdisk)` the VM config should carry.
    pub fn boot_order(&self) -> (&'static str, Option<&'static str>) {
        match self {
            BootMedia::Network => ("order=net0;virtio0", None),
            BootMedia::Iso { .. } if self.is_secure_boot() => {
                ("order=sata0", Some("sata0"))
            }
            BootMedia::Iso { .. } => ("order=sata0;virtio0", Some("sata0")),
            BootMedia::Disk => ("order=virtio0", None),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VmSpec {
    pub vmid: u32,
    pub name: String,
    pub resources: Resources,
    pub mac: MacAddr,
    pub bridge: String,
    pub storage: String,
    pub uuid: Uuid,
    pub boot: BootMedia,
    pub tpm: Option<TpmVersion>,
    pub iommu: bool,
}

impl VmSpec {
    /// Form parameters of the create call.
    ///
    /// The EFI vars disk is created empty so the firmware starts in setup
    /// mode and the OS can enroll its own Secure Boot keys.
    pub fn params(&self) -> Vec<(String, String)> {
        let mut p: Vec<(String, String)> = Vec::new();
        let mut set = |k: &str, v: String| p.push((k.to_string(), v));

        set("vmid", self.vmid.to_string());
        set("name", self.name.clone());
        set("cores", self.resources.cores.to_string());
        set("memory", self.resources.memory_mib.to_string());
        set(
            "net0",
            format!("virtio={},bridge={}", self.mac.to_upper_string(), self.bridge),
        );
        for (i, gib) in self.resources.disks_gib.iter().enumerate() {
            let iothread = if i == 0 { ",iothread=1" } else { "" };
            set(&format!("virtio{i}"), format!("{}:{gib},format=raw{iothread}", self.storage));
        }
        set("ostype", "l26".to_string());
        set("machine", "q35".to_string());
        set("bios", "ovmf".to_string());
        set(
            "efidisk0",
            format!("{}:1,format=raw,efitype=4m,size=4M", self.storage),
        );
        set("cpu", "host".to_string());
        set("balloon", "0".to_string());
        set("rng0", "source=/dev/urandom".to_string());
        set("smbios1", format!("uuid={}", self.uuid));

        if let BootMedia::Iso { storage, file } = &self.boot {
            set("sata0", format!("{storage}:iso/{file},media=cdrom"));
        }
        let (boot, bootdisk) = self.boot.boot_order();
        set("boot", boot.to_string());
        if let Some(disk) = bootdisk {
            set("bootdisk", disk.to_string());
        }

        set("serial0", "socket".to_string());
        set("agent", "1".to_string());
        if let Some(tpm) = self.tpm {
            let version = match tpm {
                TpmVersion::V1_2 => "v1.2",
                TpmVersion::V2_0 => "v2.0",
            };
            set("tpmstate0", format!("{}:1,version={version}", self.storage));
        }

        let mut args = Vec::new();
        if self.iommu {
            args.push(IOMMU_ARGS.to_string());
        }
        if !self.boot.is_secure_boot() {
            args.push(format!(
                "-chardev file,id=serial1,path={} -device isa-serial,chardev=serial1",
                serial_log_path(self.vmid)
            ));
        }
        if !args.is_empty() {
            set("args", args.join(" "));
        }
        p
    }
}

/// File the second serial port of a VM is written to on the hypervisor.
pub fn serial_log_path(vmid: u32) -> String {
    format!("/tmp/talos-vm-{vmid}-serial.log")
}

pub fn first_free_vmid(used: &HashSet<u32>) -> Option<u32> {
    (100..1000).chain(1000..10000).find(|id| !used.contains(id))
}

/// A VM id unused by both QEMU VMs and containers on `node`.
pub async fn allocate_vmid(client: &Client, node: &str) -> Result<u32> {
    let list = || async {
        let vms: Vec<VmInfo> = client
            .get(&format!("/nodes/{node}/qemu"))
            .await
            .map_err(backoff::Error::transient)?;
        let cts: Vec<VmInfo> = client
            .get(&format!("/nodes/{node}/lxc"))
            .await
            .map_err(backoff::Error::transient)?;
        Ok::<_, backoff::Error<anyhow::Error>>(
            vms.iter().chain(&cts).map(|v| v.vmid).collect::<HashSet<_>>(),
        )
    };
    let used = backoff::future::retry(
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_millis(500),
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_elapsed_time: Some(Duration::from_millis(1500)),
            ..Default::default()
        },
        list,
    )
    .await
    .context("failed to list VMs")?;

    first_free_vmid(&used).ok_or_else(|| {
        Error::Resource(format!("no free VM id on node {node}")).into()
    })
}

/// MAC of `net0` in a VM config, e.g. `virtio=BC:24:11:00:00:01,bridge=vmbr0`.
pub fn mac_from_config(config: &Map<String, Value>) -> Option<MacAddr> {
    let net0 = config.get("net0")?.as_str()?;
    net0.split(',')
        .find_map(|kv| kv.strip_prefix("virtio="))
        .map(|m| m.trim_start_matches("MAC:"))
        .and_then(|m| m.parse().ok())
}

/// An ISO reference: a file already on the hypervisor, or a local file to
/// upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IsoSource<'a> {
    Remote(&'a str),
    Local(&'a Path),
}

pub fn iso_source(path: &Path) -> IsoSource<'_> {
    if let Some(s) = path.to_str() {
        if let Some((_, file)) = s.split_once(":iso/") {
            return IsoSource::Remote(file);
        }
        if let Some(file) = s.strip_prefix(ISO_TEMPLATE_DIR) {
            return IsoSource::Remote(file);
        }
    }
    IsoSource::Local(path)
}

/// Everything needed to talk to one Proxmox node.
pub struct Host<'a> {
    pub log: &'a Logger,
    pub client: &'a Client,
    pub node: &'a str,
    pub cancel: &'a CancellationToken,
}

impl Host<'_> {
    fn vm_path(&self, vmid: u32) -> String {
        format!("/nodes/{}/qemu/{vmid}", self.node)
    }

    async fn wait(&self, data: &Value, timeout: Duration) -> Result<()> {
        match upid(data) {
            Some(id) => {
                self.client.wait_for_task(self.node, &id, timeout, self.cancel).await
            }
            None => Ok(()),
        }
    }

    /// File name of the ISO to boot from `storage`, uploading `iso` when
    /// needed. Without an ISO, `fallback` and then any `*talos*.iso` in
    /// storage are used.
    pub async fn resolve_iso(
        &self,
        storage: &str,
        iso: Option<&Path>,
        fallback: Option<&str>,
    ) -> Result<String> {
        let Some(iso) = iso else {
            if let Some(name) = fallback {
                if self.client.iso_size(self.node, storage, name).await?.is_some() {
                    return Ok(name.to_string());
                }
                warn!(self.log, "fallback ISO not found in storage";
                    "iso" => name, "storage" => storage);
            }
            let content = self.client.storage_content(self.node, storage).await?;
            return content
                .iter()
                .filter(|c| c.volid.contains("talos") && c.volid.ends_with(".iso"))
                .find_map(|c| c.volid.rsplit('/').next())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::UserInput(format!(
                        "no ISO given and no talos ISO found in storage {storage}"
                    ))
                    .into()
                });
        };

        match iso_source(iso) {
            IsoSource::Remote(file) => {
                match self.client.iso_size(self.node, storage, file).await? {
                    Some(_) => Ok(file.to_string()),
                    None => Err(Error::UserInput(format!(
                        "ISO {file} not found in storage {storage}, upload it \
                         first or use a local file path"
                    ))
                    .into()),
                }
            }
            IsoSource::Local(path) => self.ensure_iso(storage, path).await,
        }
    }

    /// Upload `path` unless a plausible copy is already in `storage`.
    async fn ensure_iso(&self, storage: &str, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::UserInput(format!("{} is not a file", path.display())))?;

        if let Some(size) = self.client.iso_size(self.node, storage, &name).await? {
            if size >= MIN_ISO_SIZE {
                info!(self.log, "ISO already uploaded"; "iso" => &name, "size" => size);
                return Ok(name);
            }
            warn!(self.log, "ISO in storage is too small, uploading again";
                "iso" => &name, "size" => size);
        }

        let local = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        info!(self.log, "uploading ISO"; "iso" => &name, "storage" => storage,
            "size" => local);
        let task = self.client.upload_iso(self.node, storage, path).await?;
        self.client
            .wait_for_task(self.node, &task, UPLOAD_TIMEOUT, self.cancel)
            .await
            .with_context(|| format!("upload of {name} failed"))?;

        let remote = self.client.iso_size(self.node, storage, &name).await?.unwrap_or(0);
        if remote.abs_diff(local) * 100 > local {
            return Err(Error::External(format!(
                "uploaded ISO {name} is {remote} bytes, expected {local}"
            ))
            .into());
        }
        Ok(name)
    }

    pub async fn create(&self, spec: &VmSpec) -> Result<()> {
        let data = self
            .client
            .post(&format!("/nodes/{}/qemu", self.node), &spec.params())
            .await?;
        self.wait(&data, CREATE_TIMEOUT)
            .await
            .with_context(|| format!("failed to create VM {}", spec.vmid))
    }

    pub async fn config(&self, vmid: u32) -> Result<Map<String, Value>> {
        self.client.get(&format!("{}/config", self.vm_path(vmid))).await
    }

    /// Rewrite the boot order when the created VM does not carry the one
    /// asked for.
    pub async fn fix_boot_order(&self, spec: &VmSpec) -> Result<()> {
        let config = self.config(spec.vmid).await?;
        let (boot, bootdisk) = spec.boot.boot_order();
        let current = |k: &str| config.get(k).and_then(Value::as_str);

        let mut form = Vec::new();
        if current("boot") != Some(boot) {
            form.push(("boot".to_string(), boot.to_string()));
        }
        if let Some(disk) = bootdisk {
            if current("bootdisk") != Some(disk) {
                form.push(("bootdisk".to_string(), disk.to_string()));
            }
        }
        if form.is_empty() {
            return Ok(());
        }
        warn!(self.log, "boot order drifted, fixing"; "vmid" => spec.vmid,
            "boot" => current("boot").unwrap_or(""));
        self.client
            .put(&format!("{}/config", self.vm_path(spec.vmid)), &form)
            .await?;
        Ok(())
    }

    /// Check the CD drive carries the ISO and the ISO is still whole.
    pub async fn verify_iso(&self, vmid: u32, storage: &str, file: &str) -> Result<()> {
        let config = self.config(vmid).await?;
        let volid = format!("{storage}:iso/{file}");
        let attached = config
            .get("sata0")
            .and_then(Value::as_str)
            .is_some_and(|v| v.starts_with(&volid));
        if !attached {
            return Err(Error::External(format!("VM {vmid} does not have {volid} attached"))
                .into());
        }
        match self.client.iso_size(self.node, storage, file).await? {
            Some(size) if size >= MIN_ISO_SIZE => Ok(()),
            Some(size) => Err(Error::External(format!(
                "ISO {volid} is only {size} bytes"
            ))
            .into()),
            None => Err(Error::External(format!("ISO {volid} disappeared")).into()),
        }
    }

    pub async fn start(&self, vmid: u32) -> Result<()> {
        let data = self
            .client
            .post(&format!("{}/status/start", self.vm_path(vmid)), &[])
            .await?;
        if let Err(e) = self.wait(&data, START_TIMEOUT).await {
            if crate::is_stopped(&e) {
                return Err(e);
            }
            warn!(self.log, "VM start task did not finish cleanly";
                "vmid" => vmid, "error" => %e);
        }
        Ok(())
    }

    pub async fn status(&self, vmid: u32) -> Result<String> {
        let status: VmStatus = self
            .client
            .get(&format!("{}/status/current", self.vm_path(vmid)))
            .await?;
        Ok(status.status)
    }

    /// Stop `vmid` if it runs, then delete it.
    pub async fn remove(&self, vmid: u32) -> Result<()> {
        if self.status(vmid).await? == "running" {
            let data = self
                .client
                .post(&format!("{}/status/stop", self.vm_path(vmid)), &[])
                .await?;
            self.wait(&data, STOP_TIMEOUT)
                .await
                .with_context(|| format!("failed to stop VM {vmid}"))?;
        }
        let data = self.client.delete(&self.vm_path(vmid)).await?;
        self.wait(&data, STOP_TIMEOUT)
            .await
            .with_context(|| format!("failed to delete VM {vmid}"))
    }
}
