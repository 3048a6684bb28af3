//! Package containers: the per-identity view of available versions and
//! their manifests.
//!
//! A container is a tagged sum over the three source kinds. Version
//! enumeration is eager (tags are cheap to list once fetched); manifest
//! loading is lazy and guarded by a per-version tools-compatibility cache
//! that is consulted before the loader is invoked.

use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use crate::workspace::errors::{
    ConstraintError, FetchError, ResolveError, Result, WorkspaceError,
};
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{
    DependencyLocation, Manifest, ManifestLoader, ProductFilter, ToolsVersion,
};
use crate::workspace::registry::RegistryClient;
use crate::workspace::scm::{SourceControl, UpdateStrategy};

/// One selectable version of a source-control container with the tag it
/// came from and the commit the tag points at.
#[derive(Debug, Clone)]
pub struct VersionTag {
    pub version: Version,
    pub tag: String,
    pub revision: String,
}

enum ContainerKind {
    SourceControl {
        url: String,
        /// Descending by version; `v`-prefixed and bare tags collapsed.
        versions: Vec<VersionTag>,
    },
    Local {
        path: PathBuf,
    },
    Registry {
        id: String,
        versions: Vec<Version>,
    },
}

pub struct Container {
    pub identity: PackageIdentity,
    kind: ContainerKind,
    scm: Arc<dyn SourceControl>,
    loader: Arc<dyn ManifestLoader>,
    registry: Option<Arc<RegistryClient>>,
    tools_version: ToolsVersion,
    /// version string -> tools-version validity, consulted before the
    /// manifest loader runs.
    tools_validity: Mutex<HashMap<String, bool>>,
}

impl Container {
    /// Versions newest-first. Pre-release versions are yielded only when
    /// the caller's requirement names a pre-release explicitly.
    pub fn available_versions_descending(&self, admit_prereleases: bool) -> Vec<Version> {
        match &self.kind {
            ContainerKind::SourceControl { versions, .. } => versions
                .iter()
                .map(|vt| &vt.version)
                .filter(|v| admit_prereleases || v.pre.is_empty())
                .cloned()
                .collect(),
            ContainerKind::Registry { versions, .. } => versions
                .iter()
                .filter(|v| admit_prereleases || v.pre.is_empty())
                .cloned()
                .collect(),
            ContainerKind::Local { .. } => Vec::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, ContainerKind::Local { .. })
    }

    pub fn local_path(&self) -> Option<&PathBuf> {
        match &self.kind {
            ContainerKind::Local { path } => Some(path),
            _ => None,
        }
    }

    pub fn revision_for_version(&self, version: &Version) -> Option<&str> {
        match &self.kind {
            ContainerKind::SourceControl { versions, .. } => versions
                .iter()
                .find(|vt| &vt.version == version)
                .map(|vt| vt.revision.as_str()),
            _ => None,
        }
    }

    /// The manifest at a version, with the tools-validity cache consulted
    /// first. An incompatible manifest poisons the cache entry so the
    /// loader runs at most once per version.
    pub async fn manifest_at_version(&self, version: &Version) -> Result<Manifest> {
        let key = version.to_string();
        if let Some(false) = self.tools_validity.lock().unwrap().get(&key) {
            return Err(self.unsupported_tools_version(&key));
        }

        let manifest = match &self.kind {
            ContainerKind::SourceControl { url, versions } => {
                let revision = versions
                    .iter()
                    .find(|vt| &vt.version == version)
                    .map(|vt| vt.revision.clone())
                    .ok_or_else(|| {
                        WorkspaceError::Resolve(ResolveError::RevisionNotFound {
                            revision: key.clone(),
                        })
                    })?;
                self.loader.load_remote(url, &revision).await?
            }
            ContainerKind::Registry { id, .. } => {
                let registry = self.registry.as_ref().ok_or_else(|| {
                    WorkspaceError::Fetch(FetchError::Network {
                        url: id.clone(),
                        message: "no registry configured".to_string(),
                    })
                })?;
                registry.manifest(id, version).await?
            }
            ContainerKind::Local { path } => self.loader.load_local(path).await?,
        };

        let compatible = manifest.tools_version <= self.tools_version;
        self.tools_validity
            .lock()
            .unwrap()
            .insert(key.clone(), compatible);
        if !compatible {
            return Err(self.unsupported_tools_version_found(&key, manifest.tools_version));
        }
        Ok(manifest)
    }

    pub async fn manifest_at_revision(&self, revision: &str) -> Result<Manifest> {
        match &self.kind {
            ContainerKind::SourceControl { url, .. } => {
                Ok(self.loader.load_remote(url, revision).await?)
            }
            ContainerKind::Local { path } => Ok(self.loader.load_local(path).await?),
            ContainerKind::Registry { id, .. } => Err(WorkspaceError::Fetch(FetchError::Network {
                url: id.clone(),
                message: "registry containers have no revisions".to_string(),
            })),
        }
    }

    /// Dependencies contributed at a version, pruned to the product
    /// filter the consumer declared.
    pub async fn dependencies(
        &self,
        version: &Version,
        filter: &ProductFilter,
    ) -> Result<Vec<crate::workspace::manifest::PackageDependency>> {
        let manifest = self.manifest_at_version(version).await?;
        Ok(manifest.dependencies_for_products(filter))
    }

    /// The tip revision of a branch, with a ranked suggestion on miss.
    pub async fn resolve_branch(&self, branch: &str) -> Result<String> {
        let url = match &self.kind {
            ContainerKind::SourceControl { url, .. } => url,
            _ => {
                return Err(WorkspaceError::Resolve(ResolveError::BranchNotFound {
                    branch: branch.to_string(),
                    suggestion: None,
                }))
            }
        };
        match self.scm.resolve_branch(url, branch).await? {
            Some(revision) => Ok(revision),
            None => {
                let known = self.scm.branches(url).await.unwrap_or_default();
                Err(WorkspaceError::Resolve(ResolveError::BranchNotFound {
                    branch: branch.to_string(),
                    suggestion: closest_match(branch, &known),
                }))
            }
        }
    }

    pub async fn contains_revision(&self, revision: &str) -> Result<bool> {
        match &self.kind {
            ContainerKind::SourceControl { url, .. } => {
                Ok(self.scm.contains_revision(url, revision).await?)
            }
            _ => Ok(false),
        }
    }

    fn unsupported_tools_version(&self, version: &str) -> WorkspaceError {
        WorkspaceError::Constraint(ConstraintError::UnsupportedToolsVersion {
            identity: self.identity.clone(),
            found: format!("{}@{}", self.identity, version),
            required: self.tools_version.to_string(),
        })
    }

    fn unsupported_tools_version_found(
        &self,
        version: &str,
        found: ToolsVersion,
    ) -> WorkspaceError {
        WorkspaceError::Constraint(ConstraintError::UnsupportedToolsVersion {
            identity: self.identity.clone(),
            found: format!("{} (at {})", found, version),
            required: self.tools_version.to_string(),
        })
    }
}

/// Produces containers on demand and memoizes them per identity.
pub struct ContainerProvider {
    scm: Arc<dyn SourceControl>,
    loader: Arc<dyn ManifestLoader>,
    registry: Option<Arc<RegistryClient>>,
    tools_version: ToolsVersion,
    cache: tokio::sync::Mutex<HashMap<PackageIdentity, (DependencyLocation, Arc<Container>)>>,
}

impl ContainerProvider {
    pub fn new(
        scm: Arc<dyn SourceControl>,
        loader: Arc<dyn ManifestLoader>,
        registry: Option<Arc<RegistryClient>>,
        tools_version: ToolsVersion,
    ) -> Self {
        ContainerProvider {
            scm,
            loader,
            registry,
            tools_version,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn container(
        &self,
        identity: &PackageIdentity,
        location: &DependencyLocation,
        strategy: &UpdateStrategy,
    ) -> Result<Arc<Container>> {
        let mut cache = self.cache.lock().await;
        if !matches!(strategy, UpdateStrategy::Always) {
            // A cached container is only reused for the same location; an
            // identity that moved (say into an edit directory) rebuilds.
            if let Some((cached_location, container)) = cache.get(identity) {
                if cached_location == location {
                    return Ok(container.clone());
                }
            }
        }

        let kind = match location {
            DependencyLocation::SourceControl { url } => {
                self.scm.ensure_fetched(url, strategy).await?;
                let versions = self.harvest_versions(url).await?;
                ContainerKind::SourceControl {
                    url: url.clone(),
                    versions,
                }
            }
            DependencyLocation::FileSystem { path } => ContainerKind::Local { path: path.clone() },
            DependencyLocation::Registry { id } => {
                let registry = self.registry.as_ref().ok_or_else(|| {
                    WorkspaceError::Fetch(FetchError::Network {
                        url: id.clone(),
                        message: "no registry configured".to_string(),
                    })
                })?;
                let versions = registry.versions(id).await?;
                ContainerKind::Registry {
                    id: id.clone(),
                    versions,
                }
            }
        };

        let container = Arc::new(Container {
            identity: identity.clone(),
            kind,
            scm: self.scm.clone(),
            loader: self.loader.clone(),
            registry: self.registry.clone(),
            tools_version: self.tools_version,
            tools_validity: Mutex::new(HashMap::new()),
        });
        cache.insert(identity.clone(), (location.clone(), container.clone()));
        Ok(container)
    }

    /// Tags that parse as semantic versions, descending, with
    /// `v`-prefixed duplicates collapsed onto one entry.
    async fn harvest_versions(&self, url: &str) -> Result<Vec<VersionTag>> {
        let tags = self.scm.tags(url).await?;
        let mut by_version: BTreeMap<Version, String> = BTreeMap::new();
        for tag in tags {
            let Some(version) = parse_version_tag(&tag) else {
                continue;
            };
            // First form encountered wins; `v1.0.0` and `1.0.0` collapse.
            by_version.entry(version).or_insert(tag);
        }

        let mut versions = Vec::with_capacity(by_version.len());
        for (version, tag) in by_version {
            if let Some(revision) = self.scm.resolve_tag(url, &tag).await? {
                versions.push(VersionTag {
                    version,
                    tag,
                    revision,
                });
            }
        }
        versions.reverse();
        Ok(versions)
    }
}

/// Parse a tag name as a version, accepting an optional `v` prefix.
pub fn parse_version_tag(tag: &str) -> Option<Version> {
    let stripped = tag
        .strip_prefix('v')
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(tag);
    Version::parse(stripped).ok()
}

/// The candidate closest by edit distance, if any is close enough to be a
/// plausible typo.
pub fn closest_match(wanted: &str, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (levenshtein(wanted, c), c))
        .filter(|(distance, _)| *distance <= 3)
        .min_by_key(|(distance, c)| (*distance, (*c).clone()))
        .map(|(_, c)| c.clone())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut previous = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            let next = (previous + cost).min(row[j] + 1).min(row[j + 1] + 1);
            previous = row[j + 1];
            row[j + 1] = next;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tags_accept_v_prefix() {
        assert_eq!(parse_version_tag("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version_tag("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version_tag("version-1"), None);
        assert_eq!(parse_version_tag("v"), None);
    }

    #[test]
    fn levenshtein_suggestions() {
        let branches = vec![
            "main".to_string(),
            "develop".to_string(),
            "release/2.x".to_string(),
        ];
        assert_eq!(closest_match("mian", &branches), Some("main".to_string()));
        assert_eq!(closest_match("totally-unrelated", &branches), None);
    }
}
