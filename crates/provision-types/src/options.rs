// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Guest CPU architecture.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Arch {
    #[default]
    Amd64,
    Arm64,
}

impl Arch {
    /// Suffix of the `qemu-system-*` binary.
    pub fn qemu_arch(&self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64",
            Arch::Arm64 => "aarch64",
        }
    }

    pub fn console(&self) -> &'static str {
        match self {
            Arch::Amd64 => "ttyS0",
            Arch::Arm64 => "ttyAMA0",
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum TpmVersion {
    #[serde(rename = "1.2")]
    #[strum(serialize = "1.2")]
    V1_2,
    #[serde(rename = "2.0")]
    #[strum(serialize = "2.0")]
    V2_0,
}

/// How the node configuration reaches the guest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInjection {
    /// Served by the launcher's HTTP server and referenced from the kernel
    /// command line.
    #[default]
    Http,
    /// Packed into a `metal-iso` volume attached to the VM.
    MetalIso,
}

/// Knobs of a create that are not part of the cluster topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub target_arch: Arch,
    #[serde(default = "yes")]
    pub use_kvm: bool,
    #[serde(default)]
    pub uefi_enabled: bool,
    #[serde(default = "yes")]
    pub bootloader_enabled: bool,
    #[serde(default)]
    pub tpm: Option<TpmVersion>,
    #[serde(default)]
    pub iommu_enabled: bool,
    #[serde(default)]
    pub with_debug_shell: bool,
    #[serde(default)]
    pub config_injection: ConfigInjection,
    #[serde(default = "yes")]
    pub delete_state_on_err: bool,
    #[serde(default)]
    pub support_archive_path: Option<PathBuf>,
    #[serde(default)]
    pub cluster_logs_archive_path: Option<PathBuf>,
    /// Base64 AES-256 key; a KMS is started when set.
    #[serde(default)]
    pub kms_key: Option<String>,
    /// TCP port of the JSON log sink; started when set.
    #[serde(default)]
    pub json_logs_port: Option<u16>,
    #[serde(default)]
    pub virtiofsd_path: Option<PathBuf>,
    /// ISO booted by remote VMs when the request names none.
    #[serde(default)]
    pub remote_fallback_iso: Option<String>,
}

fn yes() -> bool {
    true
}

impl Default for Options {
    fn default() -> Self {
        Self {
            target_arch: Arch::default(),
            use_kvm: true,
            uefi_enabled: false,
            bootloader_enabled: true,
            tpm: None,
            iommu_enabled: false,
            with_debug_shell: false,
            config_injection: ConfigInjection::default(),
            delete_state_on_err: true,
            support_archive_path: None,
            cluster_logs_archive_path: None,
            kms_key: None,
            json_logs_port: None,
            virtiofsd_path: None,
            remote_fallback_iso: None,
        }
    }
}

/// Knobs of a destroy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyOptions {
    #[serde(default)]
    pub support_archive_path: Option<PathBuf>,
    #[serde(default)]
    pub cluster_logs_archive_path: Option<PathBuf>,
    /// Remove the state directory even when an earlier step failed.
    #[serde(default = "yes")]
    pub delete_state_on_err: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            support_archive_path: None,
            cluster_logs_archive_path: None,
            delete_state_on_err: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_defaults_from_empty_yaml() {
        let opts: Options = serde_yaml::from_str("{}").unwrap();
        assert_eq!(opts, Options::default());
        assert!(opts.bootloader_enabled);
        assert!(opts.delete_state_on_err);
    }

    #[test]
    fn tpm_version_strings() {
        assert_eq!(TpmVersion::V2_0.to_string(), "2.0");
        assert_eq!("1.2".parse::<TpmVersion>().unwrap(), TpmVersion::V1_2);
        let opts: Options = serde_yaml::from_str("tpm: \"2.0\"").unwrap();
        assert_eq!(opts.tpm, Some(TpmVersion::V2_0));
    }
}
