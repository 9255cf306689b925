// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network configuration lists and the cluster bridge templates.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// CNI spec version spoken by every generated configuration.
pub const CNI_VERSION: &str = "0.4.0";

/// A chain of plugins sharing one network name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfigList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<Value>,
}

impl NetworkConfigList {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::Error> {
        serde_json::from_slice(bytes).map_err(crate::Error::Decode)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        serde_json::to_vec(self).map_err(crate::Error::Decode)
    }

    /// The `type` of each plugin, in chain order.
    pub fn plugin_types(&self) -> Vec<&str> {
        self.plugins
            .iter()
            .filter_map(|p| p.get("type").and_then(Value::as_str))
            .collect()
    }

    /// Configuration handed to plugin `index`: its own section plus the
    /// list-wide name and version, and the previous plugin's result.
    pub(crate) fn plugin_config(
        &self,
        index: usize,
        prev_result: Option<&Value>,
    ) -> Value {
        let mut conf = self.plugins[index].clone();
        if let Value::Object(map) = &mut conf {
            map.insert("name".to_string(), json!(self.name));
            map.insert("cniVersion".to_string(), json!(self.cni_version));
            if let Some(prev) = prev_result {
                map.insert("prevResult".to_string(), prev.clone());
            }
        }
        conf
    }
}

fn bridge_plugin(bridge_name: &str, mtu: u32) -> Value {
    json!({
        "type": "bridge",
        "bridge": bridge_name,
        "ipMasq": true,
        "isGateway": true,
        "isDefaultGateway": true,
        "ipam": {
            "type": "static"
        },
        "mtu": mtu,
    })
}

/// Single `bridge` plugin, run once at cluster create so the plugin brings
/// up the bridge and assigns it the gateway addresses.
pub fn bridge_only(
    network_name: &str,
    bridge_name: &str,
    mtu: u32,
) -> NetworkConfigList {
    NetworkConfigList {
        cni_version: CNI_VERSION.to_string(),
        name: network_name.to_string(),
        plugins: vec![bridge_plugin(bridge_name, mtu)],
    }
}

/// `bridge` → `firewall` → `tc-redirect-tap`, used by every VM.
pub fn vm_chain(
    network_name: &str,
    bridge_name: &str,
    mtu: u32,
) -> NetworkConfigList {
    NetworkConfigList {
        cni_version: CNI_VERSION.to_string(),
        name: network_name.to_string(),
        plugins: vec![
            bridge_plugin(bridge_name, mtu),
            json!({ "type": "firewall" }),
            json!({ "type": "tc-redirect-tap" }),
        ],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vm_chain_order() {
        let list = vm_chain("c1", "talos1234abcd", 1500);
        assert_eq!(
            list.plugin_types(),
            ["bridge", "firewall", "tc-redirect-tap"]
        );
        assert_eq!(list.plugins[0]["bridge"], "talos1234abcd");
        assert_eq!(list.plugins[0]["mtu"], 1500);
        assert_eq!(list.plugins[0]["ipam"]["type"], "static");
    }

    #[test]
    fn plugin_config_carries_list_fields() {
        let list = vm_chain("c1", "br", 9000);
        let prev = json!({ "cniVersion": CNI_VERSION, "interfaces": [] });
        let conf = list.plugin_config(1, Some(&prev));
        assert_eq!(conf["name"], "c1");
        assert_eq!(conf["cniVersion"], CNI_VERSION);
        assert_eq!(conf["type"], "firewall");
        assert_eq!(conf["prevResult"], prev);

        let first = list.plugin_config(0, None);
        assert!(first.get("prevResult").is_none());
    }

    #[test]
    fn list_round_trips_through_bytes() {
        let list = bridge_only("c1", "br", 1500);
        let bytes = list.to_bytes().unwrap();
        assert_eq!(NetworkConfigList::from_bytes(&bytes).unwrap(), list);
    }
}
