// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composition of the hypervisor command line.

use std::path::Path;

use ipam::MacAddr;
use provision_types::{Arch, DiskDriver};

use super::{KernelCmdline, LaunchConfig};

/// Clock handed to guests that exercise time skew.
const BAD_RTC_BASE: &str = "2011-11-11T11:11:00";

/// Boot decisions made fresh for every start of the VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Boot {
    pub order: String,
    /// The first disk carries a partition table.
    pub disk_bootable: bool,
}

/// The host TAP the primary NIC is backed by.
#[derive(Clone, Copy, Debug)]
pub struct Nic<'a> {
    pub tap: &'a str,
    pub mac: &'a MacAddr,
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn push(&mut self, flag: &str, value: impl Into<String>) {
        self.0.push(flag.to_string());
        self.0.push(value.into());
    }

    fn flag(&mut self, flag: &str) {
        self.0.push(flag.to_string());
    }

    fn device(&mut self, device: impl Into<String>) {
        self.push("-device", device);
    }

    fn drive(&mut self, drive: impl Into<String>) {
        self.push("-drive", drive);
    }
}

pub fn qemu_binary(arch: Arch) -> String {
    format!("qemu-system-{}", arch.qemu_arch())
}

pub fn machine_args(arch: Arch, kvm: bool, iommu: bool) -> Vec<String> {
    let mut machine = match arch {
        Arch::Amd64 => "q35".to_string(),
        Arch::Arm64 => "virt,gic-version=max".to_string(),
    };
    if kvm {
        machine.push_str(",accel=kvm");
        if arch == Arch::Amd64 {
            machine.push_str(",smm=on");
        }
    }
    if iommu && arch == Arch::Amd64 {
        machine.push_str(",kernel-irqchip=split");
    }
    vec!["-machine".to_string(), machine]
}

pub fn tpm_device_args(arch: Arch, socket: &Path) -> Vec<String> {
    let device = match arch {
        Arch::Amd64 => "tpm-tis,tpmdev=tpm0",
        Arch::Arm64 => "tpm-tis-device,tpmdev=tpm0",
    };
    vec![
        "-chardev".to_string(),
        format!("socket,id=chrtpm,path={}", socket.display()),
        "-tpmdev".to_string(),
        "emulator,id=tpm0,chardev=chrtpm".to_string(),
        "-device".to_string(),
        device.to_string(),
    ]
}

/// Attach every file-backed disk, creating shared controllers on first
/// use.
fn disk_args(args: &mut Args, config: &LaunchConfig) {
    let mut ahci_bus = None::<usize>;
    let mut scsi = false;
    let mut nvme = false;
    let mut megaraid = false;

    for (i, disk) in config.disks.iter().enumerate() {
        let path = disk.path.display();
        let bs = disk.block_size;
        match disk.driver {
            DiskDriver::Virtio => {
                args.drive(format!(
                    "id=virtio{i},format=raw,if=none,file={path},cache=none"
                ));
                args.device(format!(
                    "virtio-blk-pci,drive=virtio{i},logical_block_size={bs},physical_block_size={bs}"
                ));
            }
            DiskDriver::Ide => {
                args.drive(format!("format=raw,if=ide,file={path},cache=none"));
            }
            DiskDriver::Ahci => {
                let bus = match ahci_bus {
                    Some(b) => b + 1,
                    None => {
                        args.device("ahci,id=ahci0");
                        0
                    }
                };
                ahci_bus = Some(bus);
                args.drive(format!("id=ide{i},format=raw,if=none,file={path}"));
                args.device(format!("ide-hd,drive=ide{i},bus=ahci0.{bus}"));
            }
            DiskDriver::Scsi => {
                if !std::mem::replace(&mut scsi, true) {
                    args.device("virtio-scsi-pci,id=scsi0");
                }
                args.drive(format!(
                    "id=scsi{i},format=raw,if=none,file={path},discard=unmap,aio=native,cache=none"
                ));
                args.device(format!(
                    "scsi-hd,drive=scsi{i},bus=scsi0.0,logical_block_size={bs},physical_block_size={bs}"
                ));
            }
            DiskDriver::Nvme => {
                if !std::mem::replace(&mut nvme, true) {
                    args.device("nvme,id=nvme-ctrl-0,serial=deadbeef");
                }
                args.drive(format!(
                    "id=nvme{i},format=raw,if=none,file={path},discard=unmap,aio=native,cache=none"
                ));
                args.device(format!(
                    "nvme-ns,drive=nvme{i},logical_block_size={bs},physical_block_size={bs}"
                ));
            }
            DiskDriver::Megaraid => {
                if !std::mem::replace(&mut megaraid, true) {
                    args.device("megasas-gen2,id=scsi1");
                }
                args.drive(format!(
                    "id=scsi{i},format=raw,if=none,file={path},discard=unmap,aio=native,cache=none"
                ));
                args.device(format!(
                    "scsi-hd,drive=scsi{i},bus=scsi1.0,channel=0,scsi-id={i},lun=0,logical_block_size={bs},physical_block_size={bs}"
                ));
            }
            // Served by virtiofsd, see `virtiofs_args`.
            DiskDriver::Virtiofs => {}
        }
    }
}

/// vhost-user-fs devices need guest memory shared with virtiofsd.
fn virtiofs_args(args: &mut Args, config: &LaunchConfig) {
    if config.virtiofs.is_empty() {
        return;
    }
    args.push(
        "-object",
        format!(
            "memory-backend-memfd,id=mem,size={}M,share=on",
            config.memory_mib
        ),
    );
    args.push("-numa", "node,memdev=mem");
    for (i, fs) in config.virtiofs.iter().enumerate() {
        args.push(
            "-chardev",
            format!("socket,id=virtiofs{i},path={}", fs.socket.display()),
        );
        args.device(format!(
            "vhost-user-fs-pci,queue-size=1024,chardev=virtiofs{i},tag={}",
            fs.tag
        ));
    }
}

/// Full argv (without the binary) for one start of the VM.
pub fn qemu_args(
    config: &LaunchConfig,
    cmdline: &KernelCmdline,
    boot: &Boot,
    nic: Nic<'_>,
) -> Vec<String> {
    let mut args = Args::default();
    let state = config.state_path.display();
    let node = &config.node_name;

    args.push("-m", config.memory_mib.to_string());
    args.push("-smp", format!("cpus={}", config.vcpus));
    let cpu = if config.bad_rtc { "max,-kvmclock" } else { "max" };
    args.push("-cpu", cpu);
    args.flag("-nographic");
    args.push(
        "-netdev",
        format!("tap,id=net0,ifname={},script=no,downscript=no", nic.tap),
    );
    args.device(format!("virtio-net-pci,netdev=net0,mac={}", nic.mac));
    args.device("virtio-rng-pci");
    args.device("virtio-balloon,deflate-on-oom=on");
    args.push(
        "-monitor",
        format!("unix:{},server,nowait", config.monitor_path.display()),
    );
    args.flag("-no-reboot");
    args.push("-boot", format!("order={},reboot-timeout=5000", boot.order));
    args.push("-smbios", format!("type=1,uuid={}", config.node_uuid));
    args.push(
        "-chardev",
        format!("socket,path={state}/{node}.sock,server=on,wait=off,id=qga0"),
    );
    args.device("virtio-serial");
    args.device("virtserialport,chardev=qga0,name=org.qemu.guest_agent.0");
    args.device("i6300esb,id=watchdog0");
    args.push("-watchdog-action", "pause");

    if config.with_debug_shell {
        args.push("-serial", format!("unix:{state}/{node}.serial,server,nowait"));
    }

    disk_args(&mut args, config);
    virtiofs_args(&mut args, config);

    args.0
        .extend(machine_args(config.arch, config.enable_kvm, config.iommu_enabled));

    for image in &config.pflash_images {
        args.drive(format!("file={},format=raw,if=pflash", image.display()));
    }
    if config.arch == Arch::Amd64 && !config.pflash_images.is_empty() {
        args.push("-global", "driver=cfi.pflash01,property=secure,value=on");
    }

    if let Some(iso) = &config.extra_iso_path {
        args.drive(format!("id=cdrom1,file={},media=cdrom", iso.display()));
    }

    if let Some(tpm) = &config.tpm {
        args.0.extend(tpm_device_args(config.arch, &tpm.socket_path()));
    }

    if config.iommu_enabled {
        args.device("intel-iommu,intremap=on,device-iotlb=on");
        args.device("ioh3420,id=pcie.1,chassis=1");
        args.device(
            "virtio-net-pci,bus=pcie.1,netdev=net1,disable-legacy=on,disable-modern=off,iommu_platform=on,ats=on",
        );
        args.push("-netdev", "tap,id=net1,vhostforce=on,script=no,downscript=no");
    }

    let mut sd_stub = cmdline.sd_stub.clone();
    if !boot.disk_bootable || !config.bootloader_enabled {
        if let Some(iso) = &config.iso_path {
            args.drive(format!("id=cdrom0,file={},media=cdrom", iso.display()));
        } else if let Some(usb) = &config.usb_path {
            args.drive(format!(
                "if=none,id=stick,format=raw,read-only=on,file={}",
                usb.display()
            ));
            args.device("nec-usb-xhci,id=xhci");
            args.device("usb-storage,bus=xhci.0,drive=stick,removable=on");
        } else if let Some(uki) = &config.uki_path {
            args.push("-kernel", uki.display().to_string());
            args.push("-append", cmdline.args.clone());
            sd_stub.push_str(&cmdline.sd_stub_config);
        } else if let Some(kernel) = &config.kernel_path {
            args.push("-kernel", kernel.display().to_string());
            if let Some(initrd) = &config.initrd_path {
                args.push("-initrd", initrd.display().to_string());
            }
            args.push("-append", cmdline.args.clone());
            sd_stub.push_str(&cmdline.sd_stub_config);
        }
    }

    args.push(
        "-smbios",
        format!("type=11,value=io.systemd.stub.kernel-cmdline-extra={sd_stub}"),
    );

    if config.bad_rtc {
        args.push("-rtc", format!("base={BAD_RTC_BASE},clock=rt"));
    }

    args.0
}
