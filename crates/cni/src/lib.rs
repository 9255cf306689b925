// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal Container Network Interface client.
//!
//! Covers what the cluster network needs: configuration lists for the
//! cluster bridge, ADD/DEL of plugin chains with result caching, pinned
//! network namespaces, the tap-redirect result layout, and fetching a plugin
//! bundle.

pub mod bundle;
pub mod config;
mod exec;
mod lock;
pub mod netns;
pub mod result;

pub use config::NetworkConfigList;
pub use exec::{CniRuntime, RuntimeConf};
pub use lock::FileLock;
pub use netns::NetNs;
pub use result::CniResult;

use std::path::PathBuf;

use rand::RngCore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to find plugin {plugin:?} in {paths:?}")]
    PluginNotFound { plugin: String, paths: Vec<PathBuf> },

    #[error("failed to execute plugin {plugin:?}")]
    PluginExec {
        plugin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {plugin:?} failed ({code}): {msg}: {details}")]
    Plugin { plugin: String, code: u32, msg: String, details: String },

    #[error("failed to decode CNI JSON")]
    Decode(#[source] serde_json::Error),

    #[error("{op} failed")]
    Sys {
        op: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("failed to download CNI bundle")]
    Download(#[source] reqwest::Error),

    #[error("{0}")]
    Result(String),
}

/// A random identifier suitable for container ids and namespace names.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
