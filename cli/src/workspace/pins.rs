//! The pin store: `Package.resolved`.
//!
//! The file is canonical JSON — integer schema version, pins sorted by
//! identity, object keys sorted, trailing newline — and is rewritten
//! atomically after every successful resolution. Unknown fields survive a
//! read/write round-trip so newer tools can share the file.

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::workspace::errors::{Result, WorkspaceError};
use crate::workspace::fsops::atomic_write;
use crate::workspace::identity::PackageIdentity;

pub const PINS_SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinKind {
    RemoteSourceControl,
    FileSystem,
    Registry,
}

/// The recorded resolution state of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinState {
    Version { version: Version, revision: String },
    Branch { name: String, revision: String },
    Revision { revision: String },
    LocalPackage,
}

impl PinState {
    pub fn revision(&self) -> Option<&str> {
        match self {
            PinState::Version { revision, .. }
            | PinState::Branch { revision, .. }
            | PinState::Revision { revision } => Some(revision),
            PinState::LocalPackage => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub identity: PackageIdentity,
    pub kind: PinKind,
    pub location: String,
    pub state: PinState,
    /// Fields we do not interpret but must not lose.
    pub extra: BTreeMap<String, Value>,
}

// Wire representation. The state object spells its variant through field
// presence, matching both schema generations of the file.
#[derive(Debug, Serialize, Deserialize)]
struct PinRepr {
    identity: String,
    kind: PinKind,
    location: String,
    state: PinStateRepr,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinStateRepr {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PinsFileRepr {
    version: u64,
    pins: Vec<PinRepr>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl From<&Pin> for PinRepr {
    fn from(pin: &Pin) -> Self {
        let state = match &pin.state {
            PinState::Version { version, revision } => PinStateRepr {
                version: Some(version.to_string()),
                revision: Some(revision.clone()),
                ..Default::default()
            },
            PinState::Branch { name, revision } => PinStateRepr {
                branch: Some(name.clone()),
                revision: Some(revision.clone()),
                ..Default::default()
            },
            PinState::Revision { revision } => PinStateRepr {
                revision: Some(revision.clone()),
                ..Default::default()
            },
            PinState::LocalPackage => PinStateRepr::default(),
        };
        PinRepr {
            identity: pin.identity.as_str().to_string(),
            kind: pin.kind,
            location: pin.location.clone(),
            state,
            extra: pin.extra.clone(),
        }
    }
}

impl TryFrom<PinRepr> for Pin {
    type Error = WorkspaceError;

    fn try_from(repr: PinRepr) -> Result<Pin> {
        let state = match (&repr.state.version, &repr.state.branch, &repr.state.revision) {
            (Some(v), None, Some(rev)) => PinState::Version {
                version: Version::parse(v).map_err(|e| {
                    WorkspaceError::io(
                        format!("pin for '{}'", repr.identity),
                        std::io::Error::other(e.to_string()),
                    )
                })?,
                revision: rev.clone(),
            },
            (None, Some(branch), Some(rev)) => PinState::Branch {
                name: branch.clone(),
                revision: rev.clone(),
            },
            (None, None, Some(rev)) => PinState::Revision {
                revision: rev.clone(),
            },
            _ => PinState::LocalPackage,
        };
        Ok(Pin {
            identity: PackageIdentity::plain(&repr.identity),
            kind: repr.kind,
            location: repr.location,
            state,
            extra: repr.extra,
        })
    }
}

/// Persistent record of the previously-resolved state.
#[derive(Debug)]
pub struct PinsStore {
    path: PathBuf,
    pins: BTreeMap<PackageIdentity, Pin>,
    extra: BTreeMap<String, Value>,
}

impl PinsStore {
    /// Load the store, migrating older schema versions best-effort. A
    /// missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let mut store = PinsStore {
            path: path.to_path_buf(),
            pins: BTreeMap::new(),
            extra: BTreeMap::new(),
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(WorkspaceError::io(path.display().to_string(), e)),
        };

        let raw: Value = serde_json::from_str(&contents)
            .map_err(|e| WorkspaceError::io(path.display().to_string(), std::io::Error::other(e)))?;
        let schema = raw.get("version").and_then(Value::as_u64).unwrap_or(1);
        if schema < PINS_SCHEMA_VERSION {
            store.pins = migrate_v1(&raw);
            return Ok(store);
        }

        let file: PinsFileRepr = serde_json::from_value(raw)
            .map_err(|e| WorkspaceError::io(path.display().to_string(), std::io::Error::other(e)))?;
        store.extra = file.extra;
        for repr in file.pins {
            let pin = Pin::try_from(repr)?;
            store.pins.insert(pin.identity.clone(), pin);
        }
        Ok(store)
    }

    pub fn pins(&self) -> &BTreeMap<PackageIdentity, Pin> {
        &self.pins
    }

    pub fn pin(&self, identity: &PackageIdentity) -> Option<&Pin> {
        self.pins.get(identity)
    }

    pub fn add_or_update(&mut self, pin: Pin) {
        self.pins.insert(pin.identity.clone(), pin);
    }

    pub fn remove(&mut self, identity: &PackageIdentity) -> Option<Pin> {
        self.pins.remove(identity)
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Replace the pin set wholesale with a fresh resolution result.
    pub fn replace_all(&mut self, pins: impl IntoIterator<Item = Pin>) {
        self.pins = pins.into_iter().map(|p| (p.identity.clone(), p)).collect();
    }

    /// Serialize canonically and stage-and-rename into place.
    pub fn save(&self) -> Result<()> {
        atomic_write(&self.path, self.canonical_bytes()?.as_bytes())
    }

    fn canonical_bytes(&self) -> Result<String> {
        let file = PinsFileRepr {
            version: PINS_SCHEMA_VERSION,
            pins: self.pins.values().map(PinRepr::from).collect(),
            extra: self.extra.clone(),
        };
        // Round-tripping through Value sorts every object's keys.
        let value = serde_json::to_value(&file)
            .map_err(|e| WorkspaceError::io("Package.resolved", std::io::Error::other(e)))?;
        let mut rendered = serde_json::to_string_pretty(&value)
            .map_err(|e| WorkspaceError::io("Package.resolved", std::io::Error::other(e)))?;
        rendered.push('\n');
        Ok(rendered)
    }

    /// Drop the pin file entirely.
    pub fn reset(&mut self) -> Result<()> {
        self.pins.clear();
        self.extra.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io(self.path.display().to_string(), e)),
        }
    }

    /// Empty the pins map but keep the file on disk.
    pub fn unpin_all(&mut self) -> Result<()> {
        self.pins.clear();
        self.save()
    }
}

/// Best-effort migration from the version-1 layout, which nested pins
/// under an `object` key and spelled the location `repositoryURL`.
fn migrate_v1(raw: &Value) -> BTreeMap<PackageIdentity, Pin> {
    let mut pins = BTreeMap::new();
    let entries = raw
        .get("object")
        .and_then(|o| o.get("pins"))
        .and_then(Value::as_array);
    let Some(entries) = entries else {
        return pins;
    };
    for entry in entries {
        let location = entry
            .get("repositoryURL")
            .or_else(|| entry.get("location"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if location.is_empty() {
            continue;
        }
        let identity = PackageIdentity::for_location(&location);
        let state = entry.get("state").cloned().unwrap_or(Value::Null);
        let revision = state
            .get("revision")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let pin_state = if let Some(v) = state
            .get("version")
            .and_then(Value::as_str)
            .and_then(|v| Version::parse(v).ok())
        {
            PinState::Version {
                version: v,
                revision,
            }
        } else if let Some(branch) = state.get("branch").and_then(Value::as_str) {
            PinState::Branch {
                name: branch.to_string(),
                revision,
            }
        } else if !revision.is_empty() {
            PinState::Revision { revision }
        } else {
            PinState::LocalPackage
        };
        pins.insert(
            identity.clone(),
            Pin {
                identity,
                kind: PinKind::RemoteSourceControl,
                location,
                state: pin_state,
                extra: BTreeMap::new(),
            },
        );
    }
    pins
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_pin(identity: &str, version: &str) -> Pin {
        Pin {
            identity: PackageIdentity::plain(identity),
            kind: PinKind::RemoteSourceControl,
            location: format!("https://example.com/org/{}", identity),
            state: PinState::Version {
                version: Version::parse(version).unwrap(),
                revision: format!("rev-{}", version),
            },
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trip_is_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Package.resolved");
        let mut store = PinsStore::load(&path).unwrap();
        store.add_or_update(sample_pin("zeta", "2.0.0"));
        store.add_or_update(sample_pin("alpha", "1.1.0"));
        store.save().unwrap();

        let reloaded = PinsStore::load(&path).unwrap();
        assert_eq!(reloaded.pins(), store.pins());
    }

    #[test]
    fn serialization_is_canonical_and_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Package.resolved");
        let mut store = PinsStore::load(&path).unwrap();
        store.add_or_update(sample_pin("beta", "1.0.0"));
        store.add_or_update(sample_pin("alpha", "1.0.0"));
        store.save().unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        store.save().unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert!(first.ends_with('\n'));
        // Pins are ordered by identity.
        let alpha = first.find("\"alpha\"").unwrap();
        let beta = first.find("\"beta\"").unwrap();
        assert!(alpha < beta);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Package.resolved");
        let document = serde_json::json!({
            "version": 2,
            "originHash": "abc123",
            "pins": [{
                "identity": "foo",
                "kind": "remoteSourceControl",
                "location": "https://example.com/org/foo",
                "state": {"version": "1.0.0", "revision": "deadbeef"},
                "trust": "high",
            }],
        });
        std::fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();

        let store = PinsStore::load(&path).unwrap();
        store.save().unwrap();
        let rendered = std::fs::read_to_string(&path).unwrap();
        assert!(rendered.contains("originHash"));
        assert!(rendered.contains("\"trust\""));
    }

    #[test]
    fn v1_files_migrate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Package.resolved");
        let document = serde_json::json!({
            "version": 1,
            "object": {"pins": [{
                "package": "Foo",
                "repositoryURL": "https://example.com/org/Foo.git",
                "state": {"version": "1.2.3", "revision": "cafe"},
            }]},
        });
        std::fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();

        let store = PinsStore::load(&path).unwrap();
        let pin = store.pin(&PackageIdentity::plain("foo")).unwrap();
        assert_eq!(
            pin.state,
            PinState::Version {
                version: Version::parse("1.2.3").unwrap(),
                revision: "cafe".to_string(),
            }
        );
    }

    #[test]
    fn reset_deletes_unpin_all_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Package.resolved");
        let mut store = PinsStore::load(&path).unwrap();
        store.add_or_update(sample_pin("foo", "1.0.0"));
        store.save().unwrap();

        store.unpin_all().unwrap();
        assert!(path.exists());
        assert!(PinsStore::load(&path).unwrap().is_empty());

        store.add_or_update(sample_pin("foo", "1.0.0"));
        store.save().unwrap();
        store.reset().unwrap();
        assert!(!path.exists());
    }
}
