// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backends, selected by name.

use std::path::Path;

use anyhow::Result;
use slog::Logger;

use crate::provisioner::{Cluster, Provisioner};
use crate::state::State;
use crate::Error;

pub mod docker;
pub mod proxmox;
pub mod qemu;

/// Names accepted by [`factory`].
pub const NAMES: [&str; 3] = [qemu::NAME, proxmox::NAME, docker::NAME];

/// Instantiate the provisioner called `name`. The remote provider reads its
/// connection settings from the environment.
pub async fn factory(log: &Logger, name: &str) -> Result<Box<dyn Provisioner>> {
    match name {
        qemu::NAME => Ok(Box::new(qemu::QemuProvisioner::new(log.clone()))),
        proxmox::NAME => {
            Ok(Box::new(proxmox::ProxmoxProvisioner::from_env(log.clone()).await?))
        }
        docker::NAME => Ok(Box::new(docker::DockerProvisioner::new(log.clone()))),
        _ => Err(Error::UserInput(format!(
            "unknown provisioner {name:?}, expected one of {}",
            NAMES.join(", ")
        ))
        .into()),
    }
}

/// Load the persisted state of `cluster_name`, refusing clusters owned by
/// another provisioner.
pub(crate) fn load_cluster(
    provisioner_name: &str,
    cluster_name: &str,
    state_directory: &Path,
) -> Result<Cluster> {
    let state = State::load(state_directory, cluster_name)?;
    if state.provisioner_name != provisioner_name {
        return Err(Error::Resource(format!(
            "cluster {cluster_name:?} was created by the {} provisioner",
            state.provisioner_name
        ))
        .into());
    }
    Ok(Cluster::new(state))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unknown_name_is_rejected() {
        let err = factory(&crate::test_logger(), "vbox").await.err().unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UserInput(_))));
        assert!(err.to_string().contains("qemu, proxmox, docker"));
    }

    #[tokio::test]
    async fn local_backends() {
        let log = crate::test_logger();
        assert_eq!(factory(&log, "qemu").await.unwrap().name(), "qemu");
        assert_eq!(factory(&log, "docker").await.unwrap().name(), "docker");
    }
}
