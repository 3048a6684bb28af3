//! Dependency resolution.
//!
//! A conflict-driven solver over the product-filtered constraint graph.
//! Pins bias candidate order, which makes resolutions deterministic for a
//! fixed container state; edited dependencies enter as pre-resolved
//! unversioned nodes whose manifests still contribute constraints but
//! whose own state is frozen.

use semver::Version;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin as StdPin;

use crate::workspace::constraints::{Constraint, ConstraintSet, ConstraintStore, Mirrors};
use crate::workspace::container::ContainerProvider;
use crate::workspace::diagnostics::DiagnosticsScope;
use crate::workspace::errors::{ResolveError, Result, WorkspaceError};
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{
    DependencyLocation, Manifest, PackageDependency, ProductFilter, Requirement, TargetKind,
};
use crate::workspace::pins::{Pin, PinState, PinsStore};
use crate::workspace::scm::UpdateStrategy;
use crate::workspace::state::{CheckoutState, ManagedDependencyStore, ManagedState};

/// The state an identity resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedState {
    Version { version: Version, revision: String },
    Branch { name: String, revision: String },
    Revision { revision: String },
    Local { path: PathBuf },
}

impl ResolvedState {
    pub fn to_pin_state(&self) -> PinState {
        match self {
            ResolvedState::Version { version, revision } => PinState::Version {
                version: version.clone(),
                revision: revision.clone(),
            },
            ResolvedState::Branch { name, revision } => PinState::Branch {
                name: name.clone(),
                revision: revision.clone(),
            },
            ResolvedState::Revision { revision } => PinState::Revision {
                revision: revision.clone(),
            },
            ResolvedState::Local { .. } => PinState::LocalPackage,
        }
    }

    pub fn to_checkout_state(&self) -> Option<CheckoutState> {
        match self {
            ResolvedState::Version { version, revision } => Some(CheckoutState::Version {
                version: version.clone(),
                revision: revision.clone(),
            }),
            ResolvedState::Branch { name, revision } => Some(CheckoutState::Branch {
                name: name.clone(),
                revision: revision.clone(),
            }),
            ResolvedState::Revision { revision } => Some(CheckoutState::Revision {
                revision: revision.clone(),
            }),
            ResolvedState::Local { .. } => None,
        }
    }

    pub fn version(&self) -> Option<&Version> {
        match self {
            ResolvedState::Version { version, .. } => Some(version),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolvedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedState::Version { version, .. } => write!(f, "{}", version),
            ResolvedState::Branch { name, .. } => write!(f, "branch '{}'", name),
            ResolvedState::Revision { revision } => write!(f, "revision {}", revision),
            ResolvedState::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// One resolved (non-root) package with its manifest.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub identity: PackageIdentity,
    pub location: DependencyLocation,
    pub state: ResolvedState,
    pub manifest: Manifest,
}

/// The full resolver output.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub packages: BTreeMap<PackageIdentity, ResolvedNode>,
}

impl Resolution {
    pub fn pins(&self) -> Vec<Pin> {
        self.packages
            .values()
            .filter(|node| !matches!(node.state, ResolvedState::Local { .. }))
            .map(|node| Pin {
                identity: node.identity.clone(),
                kind: match node.location {
                    DependencyLocation::Registry { .. } => crate::workspace::pins::PinKind::Registry,
                    _ => crate::workspace::pins::PinKind::RemoteSourceControl,
                },
                location: node.location.display_string(),
                state: node.state.to_pin_state(),
                extra: BTreeMap::new(),
            })
            .collect()
    }
}

/// Why (or whether) a fresh resolution is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionRequirement {
    NotRequired,
    Required { reason: ResolutionReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionReason {
    NewPackages { identities: Vec<PackageIdentity> },
    RequirementChange {
        identity: PackageIdentity,
        from: String,
        to: String,
    },
    Other,
}

/// Decide cheaply whether the solver has to run at all: not required when
/// every constrained identity is materialized in a state that still
/// satisfies its requirement, no identity is new, and no requirement has
/// changed form.
pub fn compute_resolution_requirement(
    constraints: &ConstraintSet,
    state: &ManagedDependencyStore,
) -> ResolutionRequirement {
    let mut new_identities = Vec::new();
    for constraint in &constraints.constraints {
        if constraints.root_identities.contains(&constraint.identity) {
            continue;
        }
        let Some(managed) = state.dependency(&constraint.identity) else {
            new_identities.push(constraint.identity.clone());
            continue;
        };
        let satisfied = match (&constraint.requirement, &managed.state) {
            (req, ManagedState::Checkout { state: CheckoutState::Version { version, .. } }) => {
                req.satisfied_by(version)
            }
            (
                Requirement::Branch(wanted),
                ManagedState::Checkout {
                    state: CheckoutState::Branch { name, .. },
                },
            ) => wanted == name,
            (
                Requirement::Revision(wanted),
                ManagedState::Checkout {
                    state: CheckoutState::Revision { revision },
                },
            ) => wanted == revision,
            (Requirement::Unversioned, ManagedState::FileSystem { .. }) => true,
            // Edited state satisfies anything; it is frozen.
            (_, ManagedState::Edited { .. }) => true,
            _ => {
                return ResolutionRequirement::Required {
                    reason: ResolutionReason::RequirementChange {
                        identity: constraint.identity.clone(),
                        from: describe_managed_state(&managed.state),
                        to: constraint.requirement.to_string(),
                    },
                }
            }
        };
        if !satisfied {
            return ResolutionRequirement::Required {
                reason: ResolutionReason::RequirementChange {
                    identity: constraint.identity.clone(),
                    from: describe_managed_state(&managed.state),
                    to: constraint.requirement.to_string(),
                },
            };
        }
    }
    if !new_identities.is_empty() {
        new_identities.sort();
        new_identities.dedup();
        return ResolutionRequirement::Required {
            reason: ResolutionReason::NewPackages {
                identities: new_identities,
            },
        };
    }

    // Managed dependencies no longer referenced by any constraint force a
    // reconciliation pass, and with it a resolution.
    let constrained: BTreeSet<&PackageIdentity> = constraints
        .constraints
        .iter()
        .map(|c| &c.identity)
        .collect();
    let stray = state
        .dependencies()
        .keys()
        .any(|id| !constrained.contains(id) && !constraints.root_identities.contains(id));
    if stray {
        return ResolutionRequirement::Required {
            reason: ResolutionReason::Other,
        };
    }
    ResolutionRequirement::NotRequired
}

fn describe_managed_state(state: &ManagedState) -> String {
    match state {
        ManagedState::Checkout {
            state: CheckoutState::Version { version, .. },
        } => version.to_string(),
        ManagedState::Checkout {
            state: CheckoutState::Branch { name, .. },
        } => format!("branch '{}'", name),
        ManagedState::Checkout {
            state: CheckoutState::Revision { revision },
        } => format!("revision {}", revision),
        ManagedState::Edited { .. } => "edited".to_string(),
        ManagedState::FileSystem { path } => path.display().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Assignment {
    node: ResolvedNode,
    /// Union of product filters whose dependencies have been contributed.
    applied_filter: ProductFilter,
}

#[derive(Clone, Default)]
struct MergedConstraints {
    entries: Vec<Constraint>,
}

impl MergedConstraints {
    fn requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.entries.iter().map(|c| &c.requirement)
    }

    fn admits_prereleases(&self) -> bool {
        self.requirements().any(Requirement::admits_prereleases)
    }

    fn location(&self) -> Option<&DependencyLocation> {
        // The form first encountered wins and is recorded.
        self.entries.first().map(|c| &c.location)
    }

    fn filter_union(&self) -> ProductFilter {
        let mut filter = ProductFilter::Specific(BTreeSet::new());
        for entry in &self.entries {
            filter.merge(&entry.product_filter);
        }
        filter
    }

    fn explain(&self) -> String {
        self.entries
            .iter()
            .map(|c| format!("{} (required by '{}')", c.requirement, c.origin))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Clone)]
struct SolveState {
    assignments: BTreeMap<PackageIdentity, Assignment>,
    constraints: BTreeMap<PackageIdentity, MergedConstraints>,
    queue: VecDeque<Constraint>,
}

enum SolveFailure {
    /// Try the next candidate up the stack.
    Backtrack(String),
    /// Abort the whole resolution.
    Hard(WorkspaceError),
}

impl From<WorkspaceError> for SolveFailure {
    fn from(error: WorkspaceError) -> Self {
        SolveFailure::Hard(error)
    }
}

pub struct Resolver<'a> {
    provider: &'a ContainerProvider,
    /// `None` disables pin bias (the `update` path).
    pins: Option<&'a PinsStore>,
    overrides: BTreeMap<PackageIdentity, PackageDependency>,
    mirrors: &'a Mirrors,
    root_identities: Vec<PackageIdentity>,
    update_strategy: UpdateStrategy,
    scope: DiagnosticsScope,
}

impl<'a> Resolver<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: &'a ContainerProvider,
        pins: Option<&'a PinsStore>,
        overrides: BTreeMap<PackageIdentity, PackageDependency>,
        mirrors: &'a Mirrors,
        update_strategy: UpdateStrategy,
        scope: DiagnosticsScope,
    ) -> Self {
        Resolver {
            provider,
            pins,
            overrides,
            mirrors,
            root_identities: Vec::new(),
            update_strategy,
            scope,
        }
    }

    /// Solve the constraint set. `edited` maps frozen identities to their
    /// working directories.
    pub async fn resolve(
        &mut self,
        constraints: ConstraintSet,
        edited: &BTreeMap<PackageIdentity, PathBuf>,
    ) -> Result<Resolution> {
        self.root_identities = constraints.root_identities.clone();

        let mut state = SolveState {
            assignments: BTreeMap::new(),
            constraints: BTreeMap::new(),
            queue: constraints.constraints.into(),
        };

        // Edited dependencies are pre-resolved unversioned nodes. Their
        // manifests contribute constraints; their state never changes.
        for (identity, path) in edited {
            let container = self
                .provider
                .container(
                    identity,
                    &DependencyLocation::FileSystem { path: path.clone() },
                    &UpdateStrategy::Never,
                )
                .await?;
            let manifest = container.manifest_at_version(&Version::new(0, 0, 0)).await;
            let manifest = match manifest {
                Ok(manifest) => manifest,
                Err(_) => continue,
            };
            for dep in manifest.dependencies_for_resolution() {
                state.queue.push_back(ConstraintStore::rewrite_transitive(
                    dep,
                    identity,
                    &self.overrides,
                    self.mirrors,
                ));
            }
            state.assignments.insert(
                identity.clone(),
                Assignment {
                    node: ResolvedNode {
                        identity: identity.clone(),
                        location: DependencyLocation::FileSystem { path: path.clone() },
                        state: ResolvedState::Local { path: path.clone() },
                        manifest,
                    },
                    applied_filter: ProductFilter::Everything,
                },
            );
        }

        let solved = self.solve(state).await.map_err(|failure| match failure {
            SolveFailure::Backtrack(explanation) => {
                WorkspaceError::Resolve(ResolveError::Unsatisfiable { explanation })
            }
            SolveFailure::Hard(error) => error,
        })?;

        self.scope.debug(format!(
            "resolution complete: {} packages",
            solved.assignments.len()
        ));
        Ok(Resolution {
            packages: solved
                .assignments
                .into_iter()
                .map(|(identity, assignment)| (identity, assignment.node))
                .collect(),
        })
    }

    fn solve(
        &self,
        state: SolveState,
    ) -> StdPin<Box<dyn Future<Output = std::result::Result<SolveState, SolveFailure>> + '_>> {
        Box::pin(async move {
            let mut state = state;
            self.drain_queue(&mut state).await?;

            // Deterministic choice: the first unassigned identity in key
            // order.
            let next = state
                .constraints
                .keys()
                .find(|identity| !state.assignments.contains_key(*identity))
                .cloned();
            let Some(identity) = next else {
                return Ok(state);
            };

            let merged = state.constraints.get(&identity).cloned().unwrap_or_default();
            let candidates = self.candidates(&identity, &merged).await?;
            if candidates.is_empty() {
                return Err(SolveFailure::Backtrack(format!(
                    "no version of '{}' satisfies {}",
                    identity,
                    merged.explain()
                )));
            }

            let mut last_failure = None;
            for candidate in candidates {
                let mut child = state.clone();
                match self.assign(&mut child, &identity, candidate).await {
                    Ok(()) => {}
                    Err(SolveFailure::Backtrack(why)) => {
                        last_failure = Some(why);
                        continue;
                    }
                    Err(hard) => return Err(hard),
                }
                match self.solve(child).await {
                    Ok(solved) => return Ok(solved),
                    Err(SolveFailure::Backtrack(why)) => {
                        last_failure = Some(why);
                        continue;
                    }
                    Err(hard) => return Err(hard),
                }
            }
            Err(SolveFailure::Backtrack(last_failure.unwrap_or_else(|| {
                format!(
                    "no candidate for '{}' satisfies {}",
                    identity,
                    merged.explain()
                )
            })))
        })
    }

    /// Add queued constraints into the merged map, checking them against
    /// existing assignments and contributing newly-exposed dependencies of
    /// already-assigned packages.
    async fn drain_queue(
        &self,
        state: &mut SolveState,
    ) -> std::result::Result<(), SolveFailure> {
        while let Some(constraint) = state.queue.pop_front() {
            // A root is satisfied by itself; the remote copy is never
            // fetched.
            if self.root_identities.contains(&constraint.identity) {
                continue;
            }

            let merged = state.constraints.entry(constraint.identity.clone()).or_default();
            merged.entries.push(constraint.clone());

            if let Some(assignment) = state.assignments.get(&constraint.identity).cloned() {
                self.check_assignment(&constraint, &assignment)?;

                // A wider product filter exposes more of the assigned
                // package's dependencies; contribute the new ones.
                let mut widened = assignment.applied_filter.clone();
                widened.merge(&constraint.product_filter);
                if widened != assignment.applied_filter {
                    let already: BTreeSet<PackageIdentity> = assignment
                        .node
                        .manifest
                        .dependencies_for_products(&assignment.applied_filter)
                        .into_iter()
                        .map(|d| d.identity)
                        .collect();
                    for dep in assignment
                        .node
                        .manifest
                        .dependencies_for_products(&widened)
                    {
                        if !already.contains(&dep.identity) {
                            state.queue.push_back(ConstraintStore::rewrite_transitive(
                                dep,
                                &constraint.identity,
                                &self.overrides,
                                self.mirrors,
                            ));
                        }
                    }
                    if let Some(assignment) = state.assignments.get_mut(&constraint.identity) {
                        assignment.applied_filter = widened;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_assignment(
        &self,
        constraint: &Constraint,
        assignment: &Assignment,
    ) -> std::result::Result<(), SolveFailure> {
        let ok = match (&constraint.requirement, &assignment.node.state) {
            (req, ResolvedState::Version { version, .. }) => req.satisfied_by(version),
            (Requirement::Branch(wanted), ResolvedState::Branch { name, .. }) => wanted == name,
            (Requirement::Revision(wanted), ResolvedState::Revision { revision }) => {
                wanted == revision
            }
            (Requirement::Unversioned, ResolvedState::Local { .. }) => true,
            // Edited/local assignments absorb any requirement.
            (_, ResolvedState::Local { .. }) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(SolveFailure::Backtrack(format!(
                "'{}' is resolved to {} which does not satisfy {} (required by '{}')",
                constraint.identity,
                assignment.node.state,
                constraint.requirement,
                constraint.origin
            )))
        }
    }

    /// Candidate states for an identity, best first. Pinned versions that
    /// still satisfy the live constraints sort to the front, which keeps
    /// resolution stable across runs.
    async fn candidates(
        &self,
        identity: &PackageIdentity,
        merged: &MergedConstraints,
    ) -> std::result::Result<Vec<ResolvedState>, SolveFailure> {
        let Some(location) = merged.location().cloned() else {
            return Ok(Vec::new());
        };

        // Local beats everything else; a single local constraint decides.
        if let DependencyLocation::FileSystem { path } = &location {
            return Ok(vec![ResolvedState::Local { path: path.clone() }]);
        }
        if merged
            .requirements()
            .any(|r| matches!(r, Requirement::Unversioned))
        {
            return Err(SolveFailure::Backtrack(format!(
                "'{}' is required both unversioned and remotely: {}",
                identity,
                merged.explain()
            )));
        }

        let container = self
            .provider
            .container(identity, &location, &self.update_strategy)
            .await
            .map_err(SolveFailure::Hard)?;

        // Branch requirements always resolve to the branch's latest commit
        // at resolution time, and all branch constraints must agree.
        let branches: BTreeSet<&String> = merged
            .requirements()
            .filter_map(|r| match r {
                Requirement::Branch(name) => Some(name),
                _ => None,
            })
            .collect();
        if branches.len() > 1 {
            return Err(SolveFailure::Backtrack(format!(
                "'{}' is required on conflicting branches: {}",
                identity,
                merged.explain()
            )));
        }
        if let Some(branch) = branches.into_iter().next() {
            let revision = container
                .resolve_branch(branch)
                .await
                .map_err(SolveFailure::Hard)?;
            return Ok(vec![ResolvedState::Branch {
                name: branch.clone(),
                revision,
            }]);
        }

        let revisions: BTreeSet<&String> = merged
            .requirements()
            .filter_map(|r| match r {
                Requirement::Revision(rev) => Some(rev),
                _ => None,
            })
            .collect();
        if revisions.len() > 1 {
            return Err(SolveFailure::Backtrack(format!(
                "'{}' is required at conflicting revisions: {}",
                identity,
                merged.explain()
            )));
        }
        if let Some(revision) = revisions.into_iter().next() {
            if !container
                .contains_revision(revision)
                .await
                .map_err(SolveFailure::Hard)?
            {
                return Err(SolveFailure::Hard(WorkspaceError::Resolve(
                    ResolveError::RevisionNotFound {
                        revision: revision.clone(),
                    },
                )));
            }
            return Ok(vec![ResolvedState::Revision {
                revision: revision.clone(),
            }]);
        }

        // Version candidates, newest first, pin bias in front.
        let admit_pre = merged.admits_prereleases();
        let mut versions: Vec<Version> = container
            .available_versions_descending(admit_pre)
            .into_iter()
            .filter(|v| merged.requirements().all(|r| r.satisfied_by(v)))
            .collect();

        if let Some(pin) = self.pins.and_then(|pins| pins.pin(identity)) {
            // A pin whose location diverges from the form in use is
            // invalid and is rebuilt rather than biased toward.
            let pin_matches_location =
                PackageIdentity::for_location(&pin.location) == *identity;
            if pin_matches_location {
                if let PinState::Version { version, .. } = &pin.state {
                    if let Some(pos) = versions.iter().position(|v| v == version) {
                        let pinned = versions.remove(pos);
                        versions.insert(0, pinned);
                    }
                }
            }
        }

        Ok(versions
            .into_iter()
            .map(|version| {
                let revision = container
                    .revision_for_version(&version)
                    .unwrap_or_default()
                    .to_string();
                ResolvedState::Version { version, revision }
            })
            .collect())
    }

    /// Assign a candidate: load its manifest, enforce the edge-case
    /// policies, and queue the dependencies it contributes.
    async fn assign(
        &self,
        state: &mut SolveState,
        identity: &PackageIdentity,
        candidate: ResolvedState,
    ) -> std::result::Result<(), SolveFailure> {
        let merged = state.constraints.get(identity).cloned().unwrap_or_default();
        let location = merged
            .location()
            .cloned()
            .unwrap_or(DependencyLocation::SourceControl {
                url: identity.as_str().to_string(),
            });
        let container = self
            .provider
            .container(identity, &location, &UpdateStrategy::Never)
            .await
            .map_err(SolveFailure::Hard)?;

        let manifest = match &candidate {
            ResolvedState::Version { version, .. } => {
                match container.manifest_at_version(version).await {
                    Ok(manifest) => manifest,
                    // An incompatible tools version removes the candidate,
                    // not the whole solve.
                    Err(WorkspaceError::Constraint(_)) => {
                        return Err(SolveFailure::Backtrack(format!(
                            "'{}' at {} has an incompatible tools version",
                            identity, candidate
                        )))
                    }
                    Err(e) => return Err(SolveFailure::Hard(e)),
                }
            }
            ResolvedState::Branch { revision, .. } | ResolvedState::Revision { revision } => {
                container
                    .manifest_at_revision(revision)
                    .await
                    .map_err(SolveFailure::Hard)?
            }
            ResolvedState::Local { path } => {
                let local_container = self
                    .provider
                    .container(
                        identity,
                        &DependencyLocation::FileSystem { path: path.clone() },
                        &UpdateStrategy::Never,
                    )
                    .await
                    .map_err(SolveFailure::Hard)?;
                local_container
                    .manifest_at_version(&Version::new(0, 0, 0))
                    .await
                    .map_err(SolveFailure::Hard)?
            }
        };

        self.enforce_policies(identity, &candidate, &manifest)?;

        let filter = merged.filter_union();
        for dep in manifest.dependencies_for_products(&filter) {
            state.queue.push_back(ConstraintStore::rewrite_transitive(
                dep,
                identity,
                &self.overrides,
                self.mirrors,
            ));
        }

        state.assignments.insert(
            identity.clone(),
            Assignment {
                node: ResolvedNode {
                    identity: identity.clone(),
                    location,
                    state: candidate,
                    manifest,
                },
                applied_filter: filter,
            },
        );
        self.drain_queue(state).await
    }

    fn enforce_policies(
        &self,
        identity: &PackageIdentity,
        candidate: &ResolvedState,
        manifest: &Manifest,
    ) -> std::result::Result<(), SolveFailure> {
        // A revision-pinned package must not depend on local packages.
        if matches!(candidate, ResolvedState::Revision { .. }) {
            if let Some(local) = manifest
                .dependencies
                .iter()
                .find(|d| matches!(d.location, DependencyLocation::FileSystem { .. }))
            {
                return Err(SolveFailure::Hard(WorkspaceError::Resolve(
                    ResolveError::RevisionDependencyHasLocalDependency {
                        package: identity.clone(),
                        local: local.identity.as_str().to_string(),
                    },
                )));
            }
        }

        // Unsafe flags are only permitted in roots and local packages.
        if !matches!(candidate, ResolvedState::Local { .. }) {
            if let Some(target) = manifest.targets_with_unsafe_flags().next() {
                if target.kind != TargetKind::Test {
                    let product = manifest
                        .products
                        .iter()
                        .find(|p| p.targets.contains(&target.name))
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| target.name.clone());
                    return Err(SolveFailure::Hard(WorkspaceError::Resolve(
                        ResolveError::UnsafeFlagsInDependency {
                            target: target.name.clone(),
                            product,
                        },
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::constraints::Constraint;
    use crate::workspace::state::ManagedDependency;
    use tempfile::TempDir;

    fn constraint(identity: &str, requirement: Requirement) -> Constraint {
        Constraint {
            identity: PackageIdentity::plain(identity),
            location: DependencyLocation::SourceControl {
                url: format!("https://example.com/org/{}", identity),
            },
            requirement,
            product_filter: ProductFilter::Everything,
            origin: PackageIdentity::plain("root"),
            original_location: None,
        }
    }

    fn store_with(deps: Vec<ManagedDependency>) -> (TempDir, ManagedDependencyStore) {
        let dir = TempDir::new().unwrap();
        let mut store =
            ManagedDependencyStore::load(&dir.path().join(".workspace-state.json")).unwrap();
        for dep in deps {
            store.add_dependency(dep);
        }
        (dir, store)
    }

    fn checkout(identity: &str, version: &str) -> ManagedDependency {
        ManagedDependency {
            identity: PackageIdentity::plain(identity),
            location: format!("https://example.com/org/{}", identity),
            subpath: PathBuf::from(identity),
            state: ManagedState::Checkout {
                state: CheckoutState::Version {
                    version: Version::parse(version).unwrap(),
                    revision: format!("rev-{}", version),
                },
            },
        }
    }

    fn range(lower: &str) -> Requirement {
        Requirement::up_to_next_major(Version::parse(lower).unwrap())
    }

    #[test]
    fn precheck_not_required_when_state_satisfies() {
        let (_dir, store) = store_with(vec![checkout("bar", "1.2.0")]);
        let set = ConstraintSet {
            constraints: vec![constraint("bar", range("1.0.0"))],
            root_identities: vec![PackageIdentity::plain("root")],
        };
        assert_eq!(
            compute_resolution_requirement(&set, &store),
            ResolutionRequirement::NotRequired
        );
    }

    #[test]
    fn precheck_flags_new_packages() {
        let (_dir, store) = store_with(vec![]);
        let set = ConstraintSet {
            constraints: vec![constraint("bar", range("1.0.0"))],
            root_identities: vec![PackageIdentity::plain("root")],
        };
        match compute_resolution_requirement(&set, &store) {
            ResolutionRequirement::Required {
                reason: ResolutionReason::NewPackages { identities },
            } => assert_eq!(identities, vec![PackageIdentity::plain("bar")]),
            other => panic!("unexpected precheck result: {:?}", other),
        }
    }

    #[test]
    fn precheck_flags_requirement_form_changes() {
        let (_dir, store) = store_with(vec![checkout("bar", "1.2.0")]);
        let set = ConstraintSet {
            constraints: vec![constraint("bar", Requirement::Branch("main".into()))],
            root_identities: vec![PackageIdentity::plain("root")],
        };
        assert!(matches!(
            compute_resolution_requirement(&set, &store),
            ResolutionRequirement::Required {
                reason: ResolutionReason::RequirementChange { .. }
            }
        ));
    }

    #[test]
    fn precheck_flags_unsatisfied_versions() {
        let (_dir, store) = store_with(vec![checkout("bar", "1.2.0")]);
        let set = ConstraintSet {
            constraints: vec![constraint("bar", range("2.0.0"))],
            root_identities: vec![PackageIdentity::plain("root")],
        };
        assert!(matches!(
            compute_resolution_requirement(&set, &store),
            ResolutionRequirement::Required {
                reason: ResolutionReason::RequirementChange { .. }
            }
        ));
    }

    #[test]
    fn precheck_flags_stray_managed_dependencies() {
        let (_dir, store) = store_with(vec![checkout("bar", "1.2.0"), checkout("baz", "0.3.0")]);
        let set = ConstraintSet {
            constraints: vec![constraint("bar", range("1.0.0"))],
            root_identities: vec![PackageIdentity::plain("root")],
        };
        assert!(matches!(
            compute_resolution_requirement(&set, &store),
            ResolutionRequirement::Required {
                reason: ResolutionReason::Other
            }
        ));
    }

    #[test]
    fn edited_state_absorbs_any_requirement() {
        let (_dir, store) = store_with(vec![ManagedDependency {
            identity: PackageIdentity::plain("bar"),
            location: "https://example.com/org/bar".into(),
            subpath: PathBuf::from("bar"),
            state: ManagedState::Edited {
                based_on: None,
                unmanaged_path: None,
            },
        }]);
        let set = ConstraintSet {
            constraints: vec![constraint("bar", range("9.0.0"))],
            root_identities: vec![PackageIdentity::plain("root")],
        };
        assert_eq!(
            compute_resolution_requirement(&set, &store),
            ResolutionRequirement::NotRequired
        );
    }

    #[test]
    fn resolved_states_map_to_pin_states() {
        let version = ResolvedState::Version {
            version: Version::parse("1.0.0").unwrap(),
            revision: "abc".into(),
        };
        assert_eq!(
            version.to_pin_state(),
            PinState::Version {
                version: Version::parse("1.0.0").unwrap(),
                revision: "abc".into(),
            }
        );
        let local = ResolvedState::Local {
            path: PathBuf::from("/work/bar"),
        };
        assert_eq!(local.to_pin_state(), PinState::LocalPackage);
        assert!(local.to_checkout_state().is_none());
    }
}
