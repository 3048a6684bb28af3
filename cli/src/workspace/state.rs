//! The managed-dependency store: `.workspace-state.json`.
//!
//! Source of truth for what is actually materialized under the sandbox.
//! The document is rewritten atomically after every reconciliation step so
//! a crash between steps leaves a valid, if incomplete, state.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::workspace::errors::{Result, WorkspaceError};
use crate::workspace::fsops::atomic_write;
use crate::workspace::identity::PackageIdentity;

pub const STATE_SCHEMA_VERSION: u64 = 1;

/// The checked-out revision of a managed dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CheckoutState {
    Version { version: Version, revision: String },
    Branch { name: String, revision: String },
    Revision { revision: String },
}

impl CheckoutState {
    pub fn revision(&self) -> &str {
        match self {
            CheckoutState::Version { revision, .. }
            | CheckoutState::Branch { revision, .. }
            | CheckoutState::Revision { revision } => revision,
        }
    }
}

/// Lifecycle state of one managed dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ManagedState {
    /// A read-only working tree under `checkouts/`.
    Checkout { state: CheckoutState },
    /// A user-mutable working copy; the resolver treats it as pinned and
    /// unversioned. `based_on` remembers the checkout to restore on
    /// `unedit`; `unmanaged_path` points outside the sandbox when the
    /// user supplied their own directory.
    Edited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        based_on: Option<CheckoutState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unmanaged_path: Option<PathBuf>,
    },
    /// A local directory reference; nothing is materialized.
    FileSystem { path: PathBuf },
}

impl ManagedState {
    pub fn is_edited(&self) -> bool {
        matches!(self, ManagedState::Edited { .. })
    }

    pub fn checkout_state(&self) -> Option<&CheckoutState> {
        match self {
            ManagedState::Checkout { state } => Some(state),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDependency {
    pub identity: PackageIdentity,
    pub location: String,
    /// Directory under the sandbox checkouts (or edits) root.
    pub subpath: PathBuf,
    pub state: ManagedState,
}

/// Where a bound binary artifact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ArtifactSource {
    Local {
        path: PathBuf,
    },
    Remote {
        url: String,
        checksum: String,
        subpath: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedArtifact {
    pub identity: PackageIdentity,
    pub target_name: String,
    pub source: ArtifactSource,
    /// Absolute path the module graph binds the target to.
    pub path: PathBuf,
}

impl ManagedArtifact {
    pub fn key(identity: &PackageIdentity, target_name: &str) -> String {
        format!("{}/{}", identity, target_name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFileRepr {
    version: u64,
    #[serde(default)]
    dependencies: Vec<ManagedDependency>,
    #[serde(default)]
    artifacts: Vec<ManagedArtifact>,
}

/// Persistent mirror of the in-memory managed-dependency map plus the
/// managed-artifact map.
#[derive(Debug)]
pub struct ManagedDependencyStore {
    path: PathBuf,
    dependencies: BTreeMap<PackageIdentity, ManagedDependency>,
    artifacts: BTreeMap<String, ManagedArtifact>,
}

impl ManagedDependencyStore {
    pub fn load(path: &Path) -> Result<Self> {
        let mut store = ManagedDependencyStore {
            path: path.to_path_buf(),
            dependencies: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(WorkspaceError::io(path.display().to_string(), e)),
        };
        let file: StateFileRepr = serde_json::from_str(&contents)
            .map_err(|e| WorkspaceError::io(path.display().to_string(), std::io::Error::other(e)))?;
        for dep in file.dependencies {
            store.dependencies.insert(dep.identity.clone(), dep);
        }
        for artifact in file.artifacts {
            store.artifacts.insert(
                ManagedArtifact::key(&artifact.identity, &artifact.target_name),
                artifact,
            );
        }
        Ok(store)
    }

    pub fn dependencies(&self) -> &BTreeMap<PackageIdentity, ManagedDependency> {
        &self.dependencies
    }

    pub fn dependency(&self, identity: &PackageIdentity) -> Option<&ManagedDependency> {
        self.dependencies.get(identity)
    }

    pub fn add_dependency(&mut self, dependency: ManagedDependency) {
        self.dependencies
            .insert(dependency.identity.clone(), dependency);
    }

    pub fn remove_dependency(&mut self, identity: &PackageIdentity) -> Option<ManagedDependency> {
        self.dependencies.remove(identity)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ManagedArtifact> {
        self.artifacts.values()
    }

    pub fn artifact(
        &self,
        identity: &PackageIdentity,
        target_name: &str,
    ) -> Option<&ManagedArtifact> {
        self.artifacts
            .get(&ManagedArtifact::key(identity, target_name))
    }

    pub fn add_artifact(&mut self, artifact: ManagedArtifact) {
        self.artifacts.insert(
            ManagedArtifact::key(&artifact.identity, &artifact.target_name),
            artifact,
        );
    }

    pub fn remove_artifact(&mut self, identity: &PackageIdentity, target_name: &str) {
        self.artifacts
            .remove(&ManagedArtifact::key(identity, target_name));
    }

    /// Drop artifacts whose (identity, target) no longer appears in the
    /// given live set.
    pub fn retain_artifacts(&mut self, live: &std::collections::BTreeSet<String>) {
        self.artifacts.retain(|key, _| live.contains(key));
    }

    pub fn save(&self) -> Result<()> {
        let file = StateFileRepr {
            version: STATE_SCHEMA_VERSION,
            dependencies: self.dependencies.values().cloned().collect(),
            artifacts: self.artifacts.values().cloned().collect(),
        };
        let value = serde_json::to_value(&file)
            .map_err(|e| WorkspaceError::io(".workspace-state.json", std::io::Error::other(e)))?;
        let mut rendered = serde_json::to_string_pretty(&value)
            .map_err(|e| WorkspaceError::io(".workspace-state.json", std::io::Error::other(e)))?;
        rendered.push('\n');
        atomic_write(&self.path, rendered.as_bytes())
    }

    /// Forget everything and delete the document.
    pub fn reset(&mut self) -> Result<()> {
        self.dependencies.clear();
        self.artifacts.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io(self.path.display().to_string(), e)),
        }
    }
}
