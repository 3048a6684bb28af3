//! In-memory package manifests.
//!
//! The workspace consumes already-parsed manifests: the parser itself is a
//! collaborator behind [`ManifestLoader`]. The default loader reads the
//! JSON manifest representation (`sprout.json`) from a working tree or
//! directly from a source-control revision.

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::workspace::errors::ManifestError;
use crate::workspace::identity::PackageIdentity;
use crate::workspace::scm::SourceControl;

/// Manifest tools version, `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolsVersion {
    pub major: u32,
    pub minor: u32,
}

impl ToolsVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        ToolsVersion { major, minor }
    }

    /// Target-based dependency resolution applies from 5.2 on.
    pub fn supports_target_based_resolution(&self) -> bool {
        *self >= ToolsVersion::new(5, 2)
    }
}

impl std::fmt::Display for ToolsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Where a dependency's source lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum DependencyLocation {
    SourceControl { url: String },
    FileSystem { path: PathBuf },
    Registry { id: String },
}

impl DependencyLocation {
    pub fn display_string(&self) -> String {
        match self {
            DependencyLocation::SourceControl { url } => url.clone(),
            DependencyLocation::FileSystem { path } => path.display().to_string(),
            DependencyLocation::Registry { id } => id.clone(),
        }
    }

    pub fn identity(&self) -> PackageIdentity {
        PackageIdentity::for_location(&self.display_string())
    }
}

/// A version requirement declared by a manifest or a root override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Requirement {
    Exact(Version),
    /// Half-open range `[lower, upper)`.
    Range {
        lower: Version,
        upper: Version,
    },
    Branch(String),
    Revision(String),
    /// A local directory; carries no version constraint.
    Unversioned,
}

impl Requirement {
    /// Convenience `^major` style range.
    pub fn up_to_next_major(lower: Version) -> Self {
        let upper = Version::new(lower.major + 1, 0, 0);
        Requirement::Range { lower, upper }
    }

    pub fn satisfied_by(&self, version: &Version) -> bool {
        match self {
            Requirement::Exact(v) => v == version,
            Requirement::Range { lower, upper } => version >= lower && version < upper,
            // Branch, revision and local requirements never match a version.
            _ => false,
        }
    }

    /// Pre-release versions are selectable only when a range endpoint (or
    /// an exact pin) names a pre-release explicitly.
    pub fn admits_prereleases(&self) -> bool {
        match self {
            Requirement::Exact(v) => !v.pre.is_empty(),
            Requirement::Range { lower, upper } => !lower.pre.is_empty() || !upper.pre.is_empty(),
            _ => false,
        }
    }

    /// Whether two requirements have the same shape (version-like, branch,
    /// revision, local). A shape change forces a fresh resolution.
    pub fn same_form(&self, other: &Requirement) -> bool {
        use Requirement::*;
        matches!(
            (self, other),
            (Exact(_) | Range { .. }, Exact(_) | Range { .. })
                | (Branch(_), Branch(_))
                | (Revision(_), Revision(_))
                | (Unversioned, Unversioned)
        )
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requirement::Exact(v) => write!(f, "{}", v),
            Requirement::Range { lower, upper } => write!(f, "{}..<{}", lower, upper),
            Requirement::Branch(name) => write!(f, "branch '{}'", name),
            Requirement::Revision(rev) => write!(f, "revision {}", rev),
            Requirement::Unversioned => write!(f, "unversioned"),
        }
    }
}

/// Which products of a dependency the consuming package exposes itself to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProductFilter {
    Everything,
    Specific(BTreeSet<String>),
}

impl ProductFilter {
    pub fn merge(&mut self, other: &ProductFilter) {
        match (&mut *self, other) {
            (ProductFilter::Everything, _) => {}
            (_, ProductFilter::Everything) => *self = ProductFilter::Everything,
            (ProductFilter::Specific(mine), ProductFilter::Specific(theirs)) => {
                mine.extend(theirs.iter().cloned());
            }
        }
    }

    pub fn allows(&self, product: &str) -> bool {
        match self {
            ProductFilter::Everything => true,
            ProductFilter::Specific(set) => set.contains(product),
        }
    }
}

/// A dependency declaration after identity canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDependency {
    pub identity: PackageIdentity,
    pub location: DependencyLocation,
    pub requirement: Requirement,
    pub product_filter: ProductFilter,
}

impl PackageDependency {
    pub fn source_control(url: &str, requirement: Requirement) -> Self {
        PackageDependency {
            identity: PackageIdentity::for_location(url),
            location: DependencyLocation::SourceControl {
                url: url.to_string(),
            },
            requirement,
            product_filter: ProductFilter::Everything,
        }
    }

    pub fn file_system(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        PackageDependency {
            identity: PackageIdentity::for_location(&path.display().to_string()),
            location: DependencyLocation::FileSystem { path },
            requirement: Requirement::Unversioned,
            product_filter: ProductFilter::Everything,
        }
    }

    pub fn registry(id: &str, requirement: Requirement) -> Self {
        PackageDependency {
            identity: PackageIdentity::for_location(id),
            location: DependencyLocation::Registry { id: id.to_string() },
            requirement,
            product_filter: ProductFilter::Everything,
        }
    }

    pub fn with_products(mut self, products: impl IntoIterator<Item = String>) -> Self {
        self.product_filter = ProductFilter::Specific(products.into_iter().collect());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetKind {
    Library,
    Executable,
    Test,
    Macro,
    Plugin,
    Binary,
}

/// A reference from a target to something it builds against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TargetDependency {
    /// Another target in the same package.
    Target { name: String },
    /// A product, optionally qualified by the owning package identity.
    Product {
        name: String,
        package: Option<PackageIdentity>,
    },
}

/// The payload of a binary target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum BinarySource {
    Local { path: PathBuf },
    Remote { url: String, checksum: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    #[serde(default)]
    pub dependencies: Vec<TargetDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<BinarySource>,
    /// Raw compiler/linker flags outside the safe allow-list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsafe_flags: Vec<String>,
}

impl Target {
    pub fn library(name: &str) -> Self {
        Target {
            name: name.to_string(),
            kind: TargetKind::Library,
            dependencies: Vec::new(),
            binary: None,
            unsafe_flags: Vec::new(),
        }
    }

    pub fn of_kind(name: &str, kind: TargetKind) -> Self {
        Target {
            name: name.to_string(),
            kind,
            dependencies: Vec::new(),
            binary: None,
            unsafe_flags: Vec::new(),
        }
    }

    pub fn depending_on(mut self, deps: impl IntoIterator<Item = TargetDependency>) -> Self {
        self.dependencies.extend(deps);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProductKind {
    Library,
    Executable,
    Macro,
    Plugin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub kind: ProductKind,
    pub targets: Vec<String>,
}

/// Minimum platform requirement declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRequirement {
    pub name: String,
    pub min_version: String,
}

/// A fully parsed package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub display_name: String,
    pub location: String,
    pub tools_version: ToolsVersion,
    #[serde(default)]
    pub dependencies: Vec<PackageDependency>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub platforms: Vec<PlatformRequirement>,
}

impl Manifest {
    pub fn new(display_name: &str, location: &str, tools_version: ToolsVersion) -> Self {
        Manifest {
            display_name: display_name.to_string(),
            location: location.to_string(),
            tools_version,
            dependencies: Vec::new(),
            products: Vec::new(),
            targets: Vec::new(),
            platforms: Vec::new(),
        }
    }

    pub fn identity(&self) -> PackageIdentity {
        PackageIdentity::for_location(&self.location)
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn product(&self, name: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.name == name)
    }

    /// Dependency declarations, with product filters narrowed to the
    /// products actually named by some target when the manifest's tools
    /// version opts into target-based dependency resolution.
    pub fn dependencies_for_resolution(&self) -> Vec<PackageDependency> {
        if !self.tools_version.supports_target_based_resolution() {
            return self.dependencies.clone();
        }
        self.dependencies
            .iter()
            .map(|dep| {
                let used: BTreeSet<String> = self
                    .targets
                    .iter()
                    .flat_map(|t| t.dependencies.iter())
                    .filter_map(|td| match td {
                        TargetDependency::Product { name, package } => {
                            let matches = match package {
                                Some(pkg) => *pkg == dep.identity,
                                // Unqualified product references may point
                                // anywhere; keep them conservative.
                                None => true,
                            };
                            matches.then(|| name.clone())
                        }
                        TargetDependency::Target { .. } => None,
                    })
                    .collect();
                let mut dep = dep.clone();
                dep.product_filter = if used.is_empty() {
                    ProductFilter::Specific(BTreeSet::new())
                } else {
                    ProductFilter::Specific(used)
                };
                dep
            })
            .collect()
    }

    /// Targets declared with unsafe build flags.
    pub fn targets_with_unsafe_flags(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(|t| !t.unsafe_flags.is_empty())
    }

    /// The dependencies this manifest contributes when the consumer only
    /// exposes itself to `filter`'s products. Targets not reachable from
    /// the filtered products contribute nothing, which prunes transitive
    /// manifests.
    pub fn dependencies_for_products(&self, filter: &ProductFilter) -> Vec<PackageDependency> {
        let declared = self.dependencies_for_resolution();
        let ProductFilter::Specific(products) = filter else {
            return declared;
        };

        // Reachable targets: those of the filtered products plus their
        // transitive in-package target dependencies.
        let mut reachable: BTreeSet<&str> = BTreeSet::new();
        let mut work: Vec<&str> = self
            .products
            .iter()
            .filter(|p| products.contains(&p.name))
            .flat_map(|p| p.targets.iter().map(String::as_str))
            .collect();
        while let Some(name) = work.pop() {
            if !reachable.insert(name) {
                continue;
            }
            if let Some(target) = self.target(name) {
                for dep in &target.dependencies {
                    if let TargetDependency::Target { name } = dep {
                        work.push(name.as_str());
                    }
                }
            }
        }

        // Product references made by reachable targets, grouped by the
        // package they point at (unqualified references stay
        // conservative and match any dependency).
        let mut used: Vec<(&Option<PackageIdentity>, &str)> = Vec::new();
        for name in &reachable {
            if let Some(target) = self.target(name) {
                for dep in &target.dependencies {
                    if let TargetDependency::Product { name, package } = dep {
                        used.push((package, name.as_str()));
                    }
                }
            }
        }

        declared
            .into_iter()
            .filter_map(|mut dep| {
                let names: BTreeSet<String> = used
                    .iter()
                    .filter(|(package, _)| match package {
                        Some(pkg) => *pkg == dep.identity,
                        None => true,
                    })
                    .map(|(_, name)| name.to_string())
                    .collect();
                if names.is_empty() {
                    return None;
                }
                dep.product_filter = ProductFilter::Specific(names);
                Some(dep)
            })
            .collect()
    }
}

/// The manifest-parser collaborator.
#[async_trait]
pub trait ManifestLoader: Send + Sync {
    /// Load the manifest of a remote package at a specific revision.
    async fn load_remote(
        &self,
        location: &str,
        revision: &str,
    ) -> std::result::Result<Manifest, ManifestError>;

    /// Load the manifest of a package rooted at a local directory.
    async fn load_local(&self, path: &Path) -> std::result::Result<Manifest, ManifestError>;
}

/// Name of the serialized manifest inside a package directory.
pub const MANIFEST_FILE_NAME: &str = "sprout.json";

/// Default loader: reads `sprout.json` from a working tree, or through the
/// source-control layer for a pinned revision without a checkout.
pub struct JsonManifestLoader {
    scm: Arc<dyn SourceControl>,
}

impl JsonManifestLoader {
    pub fn new(scm: Arc<dyn SourceControl>) -> Self {
        JsonManifestLoader { scm }
    }

    fn parse(location: &str, bytes: &[u8]) -> std::result::Result<Manifest, ManifestError> {
        serde_json::from_slice(bytes).map_err(|e| ManifestError::Invalid {
            location: location.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ManifestLoader for JsonManifestLoader {
    async fn load_remote(
        &self,
        location: &str,
        revision: &str,
    ) -> std::result::Result<Manifest, ManifestError> {
        let bytes = self
            .scm
            .read_file(location, revision, MANIFEST_FILE_NAME)
            .await
            .map_err(|_| ManifestError::NotFound {
                location: location.to_string(),
                revision: revision.to_string(),
            })?;
        Self::parse(location, &bytes)
    }

    async fn load_local(&self, path: &Path) -> std::result::Result<Manifest, ManifestError> {
        let file = path.join(MANIFEST_FILE_NAME);
        let bytes = tokio::fs::read(&file).await?;
        Self::parse(&path.display().to_string(), &bytes)
    }
}
