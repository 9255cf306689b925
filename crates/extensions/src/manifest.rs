// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Extension manifests (`manifest.yaml`).

use std::path::Path;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::Error;

pub const MANIFEST_VERSION: &str = "v1alpha1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Compatibility::is_empty")]
    pub compatibility: Compatibility,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talos: Option<Constraint>,
}

impl Compatibility {
    fn is_empty(&self) -> bool {
        self.talos.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub version: String,
}

/// Versions are written with or without a leading `v`.
fn strip_v(s: &str) -> &str {
    s.strip_prefix('v').unwrap_or(s)
}

/// Rewrite a constraint such as `>= v1.7.0 < v2.0.0` into semver's
/// comma-separated comparator syntax.
fn normalize_req(s: &str) -> String {
    let mut comparators = Vec::new();
    let mut pending_op = String::new();
    for tok in s.split(|c: char| c.is_whitespace() || c == ',') {
        if tok.is_empty() {
            continue;
        }
        let split = tok.find(|c: char| c.is_ascii_alphanumeric());
        match split {
            None => pending_op.push_str(tok),
            Some(at) => {
                let (op, version) = tok.split_at(at);
                comparators.push(format!(
                    "{pending_op}{op}{}",
                    strip_v(version)
                ));
                pending_op.clear();
            }
        }
    }
    comparators.join(", ")
}

pub fn parse_version(s: &str) -> Result<Version, Error> {
    Version::parse(strip_v(s.trim()))
        .map_err(|e| Error::InvalidManifest(format!("bad version {s:?}: {e}")))
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)
            .map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
        serde_yaml::from_slice(&bytes)
            .map_err(|source| Error::Manifest { path: path.to_path_buf(), source })
    }

    /// Check the required fields are present.
    pub fn validate(&self) -> Result<(), Error> {
        if self.version != MANIFEST_VERSION {
            return Err(Error::InvalidManifest(format!(
                "unsupported manifest version {:?}",
                self.version
            )));
        }
        for (field, value) in [
            ("name", &self.metadata.name),
            ("version", &self.metadata.version),
            ("author", &self.metadata.author),
            ("description", &self.metadata.description),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidManifest(format!(
                    "metadata.{field} is required"
                )));
            }
        }
        Ok(())
    }

    /// Check the extension supports OS version `current`.
    pub fn validate_constraints(&self, current: &Version) -> Result<(), Error> {
        let Some(constraint) = &self.metadata.compatibility.talos else {
            return Ok(());
        };
        let req = VersionReq::parse(&normalize_req(&constraint.version)).map_err(
            |e| {
                Error::InvalidManifest(format!(
                    "bad version constraint {:?}: {e}",
                    constraint.version
                ))
            },
        )?;
        // Pre-release builds are matched as their release.
        let mut release = current.clone();
        release.pre = semver::Prerelease::EMPTY;
        if req.matches(current) || req.matches(&release) {
            Ok(())
        } else {
            Err(Error::Incompatible {
                name: self.metadata.name.clone(),
                constraint: constraint.version.clone(),
                version: current.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn manifest(constraint: Option<&str>) -> Manifest {
        let yaml = format!(
            "version: v1alpha1\n\
             metadata:\n  name: gvisor\n  version: 1.0.0\n  author: Someone\n  description: runtime\n{}",
            constraint
                .map(|c| format!("  compatibility:\n    talos:\n      version: \"{c}\"\n"))
                .unwrap_or_default()
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn constraint_normalization() {
        assert_eq!(normalize_req(">= v1.7.0"), ">=1.7.0");
        assert_eq!(normalize_req(">=v1.7.0 <v2.0.0"), ">=1.7.0, <2.0.0");
        assert_eq!(normalize_req("^1.2, < 1.5"), "^1.2, <1.5");
    }

    #[test]
    fn accepts_complete_manifest() {
        assert!(manifest(None).validate().is_ok());
    }

    #[test]
    fn rejects_wrong_version_and_missing_fields() {
        let mut m = manifest(None);
        m.version = "v1".to_string();
        assert!(m.validate().is_err());
        let mut m = manifest(None);
        m.metadata.author.clear();
        assert!(m.validate().is_err());
    }

    #[test]
    fn constraint_checks() {
        let current = parse_version("v1.8.0").unwrap();
        assert!(manifest(Some(">= v1.7.0")).validate_constraints(&current).is_ok());
        assert!(manifest(Some(">= v1.9.0")).validate_constraints(&current).is_err());
        let pre = parse_version("v1.9.0-alpha.1").unwrap();
        assert!(manifest(Some(">= v1.9.0")).validate_constraints(&pre).is_ok());
        assert!(manifest(None).validate_constraints(&current).is_ok());
    }
}
