// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster provisioning engine.
//!
//! A [`Provisioner`] turns a [`provision_types::ClusterRequest`] into a
//! running cluster and persists a [`State`] under
//! `<state_directory>/<cluster>/`. The VM backends delegate each node to a
//! detached launcher process (see [`launcher`]) and stand up the auxiliary
//! services in [`services`] as detached children of the same executable.

use std::fmt;

pub mod archive;
pub mod controller;
pub mod disks;
pub mod launcher;
pub mod network;
pub mod process;
pub mod providers;
pub mod provisioner;
pub mod services;
pub mod state;

pub use provisioner::{Cluster, Provisioner};
pub use state::State;

/// Classified failures, wrapped in `anyhow::Error` at the API surface so
/// callers can downcast when they need to branch on the kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    UserInput(String),

    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("{0}")]
    External(String),

    #[error("{0}")]
    Resource(String),

    /// Cancellation by signal or token. Never reported as a failure.
    #[error("process stopped")]
    Stopped,
}

impl From<provision_types::ValidationError> for Error {
    fn from(e: provision_types::ValidationError) -> Self {
        Error::UserInput(e.to_string())
    }
}

/// True when `err` is (or wraps) [`Error::Stopped`].
pub fn is_stopped(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::Stopped))
}

/// Errors collected from steps that all run regardless of each other's
/// outcome.
#[derive(Debug, Default)]
pub struct MultiError(Vec<anyhow::Error>);

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: anyhow::Error) {
        self.0.push(err);
    }

    /// Record the error of `res`, if any.
    pub fn check<T>(&mut self, res: anyhow::Result<T>) -> Option<T> {
        match res {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.0
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self.into())
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.0.len() == 1 { "error" } else { "errors" };
        write!(f, "{} {noun} occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n\t* {err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
pub(crate) fn test_logger() -> slog::Logger {
    use slog::Drain;

    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn multi_error_lists_every_error() {
        let mut errs = MultiError::new();
        assert!(errs.check::<()>(Err(anyhow!("first"))).is_none());
        assert_eq!(errs.check(Ok(3)), Some(3));
        errs.push(anyhow!("second"));
        assert_eq!(errs.len(), 2);
        let msg = errs.into_result().unwrap_err().to_string();
        assert_eq!(msg, "2 errors occurred:\n\t* first\n\t* second");
    }

    #[test]
    fn empty_multi_error_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }

    #[test]
    fn stopped_is_detected_through_context() {
        let err = anyhow::Error::new(Error::Stopped).context("launch");
        assert!(is_stopped(&err));
        assert!(!is_stopped(&anyhow!("process stopped")));
    }
}
