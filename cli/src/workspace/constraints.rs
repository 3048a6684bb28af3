//! Turning root manifests and configuration into a flat constraint set.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::workspace::errors::ConstraintError;
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{
    DependencyLocation, Manifest, PackageDependency, ProductFilter, Requirement,
};

/// Identity-to-location rewrites declared in configuration. Mirrors are
/// applied before constraint emission; pins are keyed by the mirrored
/// identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mirrors {
    #[serde(default)]
    rewrites: BTreeMap<String, String>,
}

impl Mirrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, original: &str, mirror: &str) {
        self.rewrites
            .insert(original.to_string(), mirror.to_string());
    }

    pub fn rewrite(&self, location: &str) -> Option<&str> {
        self.rewrites.get(location).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }
}

/// One emitted constraint. `origin` names the package that declared it;
/// `original_location` is the pre-mirror spelling, kept for diagnostics
/// only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub identity: PackageIdentity,
    pub location: DependencyLocation,
    pub requirement: Requirement,
    pub product_filter: ProductFilter,
    pub origin: PackageIdentity,
    pub original_location: Option<String>,
}

/// The flat constraint set derived from the roots.
#[derive(Debug, Default)]
pub struct ConstraintSet {
    pub constraints: Vec<Constraint>,
    /// Identities of the root packages themselves. A root that is also
    /// named as a remote dependency is satisfied by the root; the remote
    /// copy is never fetched.
    pub root_identities: Vec<PackageIdentity>,
}

pub struct ConstraintStore;

impl ConstraintStore {
    /// Emit the root constraint set: mirrors first, then overrides, then
    /// target-based product-filter narrowing from each manifest.
    pub fn emit(
        roots: &[Manifest],
        overrides: &[PackageDependency],
        mirrors: &Mirrors,
    ) -> Result<ConstraintSet, ConstraintError> {
        let mut set = ConstraintSet::default();

        for root in roots {
            let identity = root.identity();
            if set.root_identities.contains(&identity) {
                return Err(ConstraintError::DuplicateRootPackage { identity });
            }
            set.root_identities.push(identity);
        }

        let overrides = validate_overrides(overrides)?;

        for root in roots {
            let origin = root.identity();
            for dep in root.dependencies_for_resolution() {
                set.constraints
                    .push(apply_rewrites(dep, &origin, &overrides, mirrors));
            }
        }
        Ok(set)
    }

    /// Rewrite one transitively-discovered dependency the same way root
    /// dependencies are rewritten. The resolver calls this for every
    /// manifest it loads mid-solve.
    pub fn rewrite_transitive(
        dep: PackageDependency,
        origin: &PackageIdentity,
        overrides: &BTreeMap<PackageIdentity, PackageDependency>,
        mirrors: &Mirrors,
    ) -> Constraint {
        apply_rewrites(dep, origin, overrides, mirrors)
    }
}

/// Check override shape and index by identity. A file-system override must
/// sit in a directory whose basename derives the overridden identity.
pub fn validate_overrides(
    overrides: &[PackageDependency],
) -> Result<BTreeMap<PackageIdentity, PackageDependency>, ConstraintError> {
    let mut map = BTreeMap::new();
    for dep in overrides {
        if let DependencyLocation::FileSystem { path } = &dep.location {
            let basename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if basename != dep.identity.as_str() {
                return Err(ConstraintError::OverrideBasenameMismatch {
                    expected: dep.identity.as_str().to_string(),
                    found: basename,
                });
            }
        }
        map.insert(dep.identity.clone(), dep.clone());
    }
    Ok(map)
}

fn apply_rewrites(
    mut dep: PackageDependency,
    origin: &PackageIdentity,
    overrides: &BTreeMap<PackageIdentity, PackageDependency>,
    mirrors: &Mirrors,
) -> Constraint {
    let mut original_location = None;

    // Mirrors rewrite the location; identity follows the mirrored form.
    if let DependencyLocation::SourceControl { url } = &dep.location {
        if let Some(mirror) = mirrors.rewrite(url) {
            original_location = Some(url.clone());
            dep.identity = PackageIdentity::for_location(mirror);
            dep.location = DependencyLocation::SourceControl {
                url: mirror.to_string(),
            };
        }
    }

    // A root-supplied override supersedes the declared requirement and
    // location for its identity.
    if let Some(replacement) = overrides.get(&dep.identity) {
        dep.location = replacement.location.clone();
        dep.requirement = replacement.requirement.clone();
    }

    Constraint {
        identity: dep.identity,
        location: dep.location,
        requirement: dep.requirement,
        product_filter: dep.product_filter,
        origin: origin.clone(),
        original_location,
    }
}

/// Basename guard shared with the override check, for workspaces that
/// accept ad-hoc local roots.
pub fn basename_matches_identity(path: &Path, identity: &PackageIdentity) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase() == identity.as_str())
        .unwrap_or(false)
}
