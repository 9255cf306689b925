// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Results returned by an ADD of a plugin chain.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    pub address: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<std::net::IpAddr>,
}

/// A result in the 0.4.0 format. Fields this crate does not interpret are
/// kept so the result can be handed back to plugins verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CniResult {
    pub fn from_value(value: Value) -> Result<Self, Error> {
        serde_json::from_value(value).map_err(Error::Decode)
    }

    pub fn to_value(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(Error::Decode)
    }

    /// The interface handed to the VM and the host TAP device backing it.
    ///
    /// The tap-redirect plugin reports the VM side with the container id as
    /// its sandbox, and a TAP of the same name inside the network namespace.
    pub fn vm_tap_pair(
        &self,
        container_id: &str,
    ) -> Result<(&Interface, &Interface), Error> {
        let (vm, other): (Vec<_>, Vec<_>) =
            self.interfaces.iter().partition(|i| i.sandbox == container_id);

        let vm_iface = match vm.as_slice() {
            [one] => *one,
            [] => {
                return Err(Error::Result(format!(
                    "no interface with sandbox {container_id} in result"
                )))
            }
            _ => {
                return Err(Error::Result(format!(
                    "multiple interfaces with sandbox {container_id} in result"
                )))
            }
        };

        let taps: Vec<_> =
            other.into_iter().filter(|i| i.name == vm_iface.name).collect();
        match taps.as_slice() {
            [tap] => Ok((vm_iface, *tap)),
            [] => Err(Error::Result(format!(
                "no tap device named {} in result",
                vm_iface.name
            ))),
            _ => Err(Error::Result(format!(
                "multiple tap devices named {} in result",
                vm_iface.name
            ))),
        }
    }
}
