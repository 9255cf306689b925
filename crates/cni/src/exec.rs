// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of plugin chains.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::NetworkConfigList;
use crate::result::CniResult;
use crate::Error;

/// Per-attachment parameters of an ADD or DEL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: PathBuf,
    pub ifname: String,
    /// Passed to plugins as `CNI_ARGS`.
    pub args: Vec<(String, String)>,
}

impl RuntimeConf {
    pub(crate) fn cni_args(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Debug, Deserialize)]
struct PluginError {
    code: u32,
    msg: String,
    #[serde(default)]
    details: String,
}

#[derive(Serialize, Deserialize)]
struct CachedResult {
    kind: String,
    #[serde(rename = "containerId")]
    container_id: String,
    #[serde(rename = "ifName")]
    if_name: String,
    #[serde(rename = "networkName")]
    network_name: String,
    #[serde(rename = "cniArgs")]
    cni_args: Vec<(String, String)>,
    result: Value,
}

const CACHE_KIND: &str = "cniCacheV1";

/// Locates plugins and drives them through the CNI exec protocol.
#[derive(Clone, Debug)]
pub struct CniRuntime {
    bin_paths: Vec<PathBuf>,
    cache_dir: PathBuf,
}

impl CniRuntime {
    pub fn new(bin_paths: Vec<PathBuf>, cache_dir: PathBuf) -> Self {
        Self { bin_paths, cache_dir }
    }

    pub fn find_plugin(&self, plugin: &str) -> Result<PathBuf, Error> {
        self.bin_paths
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|p| p.is_file())
            .ok_or_else(|| Error::PluginNotFound {
                plugin: plugin.to_string(),
                paths: self.bin_paths.clone(),
            })
    }

    /// Names in `plugins` that cannot be found on the search path.
    pub fn missing_plugins<'a>(&self, plugins: &[&'a str]) -> Vec<&'a str> {
        plugins
            .iter()
            .copied()
            .filter(|p| self.find_plugin(p).is_err())
            .collect()
    }

    fn cache_path(&self, network: &str, rt: &RuntimeConf) -> PathBuf {
        self.cache_dir.join("results").join(format!(
            "{network}-{}-{}",
            rt.container_id, rt.ifname
        ))
    }

    /// Result recorded by the last successful ADD of `list` for `rt`.
    pub async fn cached_result(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> Result<Option<CniResult>, Error> {
        let path = self.cache_path(&list.name, rt);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(source) => return Err(Error::Io { path, source }),
        };
        let cached: CachedResult =
            serde_json::from_slice(&bytes).map_err(Error::Decode)?;
        CniResult::from_value(cached.result).map(Some)
    }

    async fn write_cache(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
        result: &Value,
    ) -> Result<(), Error> {
        let path = self.cache_path(&list.name, rt);
        let cached = CachedResult {
            kind: CACHE_KIND.to_string(),
            container_id: rt.container_id.clone(),
            if_name: rt.ifname.clone(),
            network_name: list.name.clone(),
            cni_args: rt.args.clone(),
            result: result.clone(),
        };
        let bytes = serde_json::to_vec(&cached).map_err(Error::Decode)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                Error::Io { path: parent.to_path_buf(), source }
            })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| Error::Io { path, source })
    }

    /// Run ADD through every plugin of `list`, threading each result into
    /// the next plugin, and cache the final result.
    pub async fn add_network_list(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> Result<CniResult, Error> {
        let mut prev: Option<Value> = None;
        for (index, plugin) in list.plugin_types().into_iter().enumerate() {
            let conf = list.plugin_config(index, prev.as_ref());
            let out = self.exec_plugin("ADD", plugin, &conf, rt).await?;
            prev = Some(out.ok_or_else(|| {
                Error::Result(format!("plugin {plugin} returned no result"))
            })?);
        }
        let result = prev.ok_or_else(|| {
            Error::Result(format!("network {} has no plugins", list.name))
        })?;
        self.write_cache(list, rt, &result).await?;
        CniResult::from_value(result)
    }

    /// Run DEL through the plugins of `list` in reverse order and drop the
    /// cached result.
    pub async fn del_network_list(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> Result<(), Error> {
        let cached = self
            .cached_result(list, rt)
            .await?
            .map(|r| r.to_value())
            .transpose()?;
        let plugins = list.plugin_types();
        for index in (0..plugins.len()).rev() {
            let conf = list.plugin_config(index, cached.as_ref());
            self.exec_plugin("DEL", plugins[index], &conf, rt).await?;
        }
        let path = self.cache_path(&list.name, rt);
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(Error::Io { path, source: e })
            }
            _ => Ok(()),
        }
    }

    async fn exec_plugin(
        &self,
        command: &str,
        plugin: &str,
        conf: &Value,
        rt: &RuntimeConf,
    ) -> Result<Option<Value>, Error> {
        let path = self.find_plugin(plugin)?;
        let stdin = serde_json::to_vec(conf).map_err(Error::Decode)?;
        let output = run_plugin(&path, command, &stdin, rt, &self.bin_paths)
            .await
            .map_err(|source| Error::PluginExec {
                plugin: plugin.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(match serde_json::from_slice::<PluginError>(
                &output.stdout,
            ) {
                Ok(e) => Error::Plugin {
                    plugin: plugin.to_string(),
                    code: e.code,
                    msg: e.msg,
                    details: e.details,
                },
                Err(_) => Error::Plugin {
                    plugin: plugin.to_string(),
                    code: 0,
                    msg: format!("exited with {}", output.status),
                    details: String::from_utf8_lossy(&output.stderr)
                        .trim()
                        .to_string(),
                },
            });
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&output.stdout).map(Some).map_err(Error::Decode)
    }
}

async fn run_plugin(
    path: &Path,
    command: &str,
    stdin: &[u8],
    rt: &RuntimeConf,
    bin_paths: &[PathBuf],
) -> std::io::Result<std::process::Output> {
    let cni_path = std::env::join_paths(bin_paths)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut child = Command::new(path)
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", &rt.container_id)
        .env("CNI_NETNS", &rt.netns)
        .env("CNI_IFNAME", &rt.ifname)
        .env("CNI_ARGS", rt.cni_args())
        .env("CNI_PATH", cni_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin).await?;
    }
    child.wait_with_output().await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::vm_chain;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a shell script plugin that records its environment and stdin
    /// and prints `result` (or fails with a CNI error when `result` is
    /// "fail").
    fn fake_plugin(dir: &Path, name: &str, result: &str) {
        let body = if result == "fail" {
            r#"echo '{"code": 7, "msg": "boom", "details": "nope"}'; exit 1"#
                .to_string()
        } else {
            format!("cat <<'EOT'\n{result}\nEOT")
        };
        let script = format!(
            "#!/bin/sh\n\
             cat > \"{dir}/{name}.$CNI_COMMAND.stdin\"\n\
             echo \"$CNI_ARGS\" > \"{dir}/{name}.$CNI_COMMAND.args\"\n\
             {body}\n",
            dir = dir.display()
        );
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap();
    }

    fn rt() -> RuntimeConf {
        RuntimeConf {
            container_id: "abc123".to_string(),
            netns: "/var/run/netns/test".into(),
            ifname: "veth0".to_string(),
            args: vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("IP".to_string(), "10.5.0.2/24".to_string()),
                ("GATEWAY".to_string(), "10.5.0.1".to_string()),
            ],
        }
    }

    const RESULT: &str = r#"{"cniVersion":"0.4.0","interfaces":[{"name":"tap0","mac":"52:54:00:00:00:01","sandbox":"abc123"},{"name":"tap0","sandbox":"/var/run/netns/test"}],"ips":[]}"#;

    #[tokio::test]
    async fn add_threads_results_and_caches() {
        let bin = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        for p in ["bridge", "firewall", "tc-redirect-tap"] {
            fake_plugin(bin.path(), p, RESULT);
        }
        let runtime = CniRuntime::new(
            vec![bin.path().to_path_buf()],
            cache.path().to_path_buf(),
        );
        let list = vm_chain("c1", "talos0", 1500);
        let result = runtime.add_network_list(&list, &rt()).await.unwrap();
        assert_eq!(result.interfaces.len(), 2);

        let stdin: Value = serde_json::from_slice(
            &std::fs::read(bin.path().join("firewall.ADD.stdin")).unwrap(),
        )
        .unwrap();
        assert_eq!(stdin["name"], "c1");
        assert_eq!(stdin["prevResult"]["interfaces"][0]["name"], "tap0");
        let args =
            std::fs::read_to_string(bin.path().join("bridge.ADD.args"))
                .unwrap();
        assert_eq!(args.trim(), "IgnoreUnknown=1;IP=10.5.0.2/24;GATEWAY=10.5.0.1");

        assert!(runtime.cached_result(&list, &rt()).await.unwrap().is_some());
        runtime.del_network_list(&list, &rt()).await.unwrap();
        assert!(runtime.cached_result(&list, &rt()).await.unwrap().is_none());
        assert!(bin.path().join("bridge.DEL.stdin").exists());
    }

    #[tokio::test]
    async fn plugin_error_is_decoded() {
        let bin = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fake_plugin(bin.path(), "bridge", "fail");
        let runtime = CniRuntime::new(
            vec![bin.path().to_path_buf()],
            cache.path().to_path_buf(),
        );
        let list = crate::config::bridge_only("c1", "talos0", 1500);
        match runtime.add_network_list(&list, &rt()).await {
            Err(Error::Plugin { code, msg, details, .. }) => {
                assert_eq!(code, 7);
                assert_eq!(msg, "boom");
                assert_eq!(details, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_plugins_listed() {
        let bin = tempfile::tempdir().unwrap();
        fake_plugin(bin.path(), "bridge", RESULT);
        let runtime =
            CniRuntime::new(vec![bin.path().to_path_buf()], "/tmp".into());
        assert_eq!(
            runtime.missing_plugins(&["bridge", "firewall"]),
            ["firewall"]
        );
    }
}
