//! The workspace core: resolution, managed state, prebuilts, binary
//! artifacts, and the module graph they fold into.
//!
//! `Workspace` is the sole owner of every store and manager; collaborators
//! (source control, HTTP, archiving, signature verification, manifest
//! loading) are injected as capability handles with no back-pointers.

#![allow(dead_code)]

pub mod archive;
pub mod artifacts;
pub mod constraints;
pub mod container;
pub mod diagnostics;
pub mod errors;
pub mod fsops;
pub mod graph;
pub mod http;
pub mod identity;
pub mod manifest;
pub mod pins;
pub mod platform;
pub mod prebuilts;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod scm;
pub mod signing;
pub mod state;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::WorkspaceConfig;

use self::artifacts::{ArtifactHost, BinaryArtifactsManager};
use self::constraints::{validate_overrides, ConstraintStore};
use self::container::ContainerProvider;
use self::diagnostics::{DiagnosticsScope, DiagnosticsSink};
use self::errors::{Result, StateError, WorkspaceError};
use self::fsops::{directory_stats, DirectoryStats, Sandbox, SandboxLock};
use self::graph::{GraphPackage, ModuleGraph, ModuleGraphBuilder, PackageState};
use self::http::HttpClient;
use self::identity::PackageIdentity;
use self::manifest::{JsonManifestLoader, Manifest, ManifestLoader, PackageDependency, ToolsVersion};
use self::pins::{Pin, PinsStore};
use self::platform::HostPlatform;
use self::prebuilts::{PrebuiltsConfig, PrebuiltsManager, PreparedPrebuilt};
use self::reconciler::Reconciler;
use self::registry::RegistryClient;
use self::resolver::{
    compute_resolution_requirement, Resolution, ResolutionRequirement, ResolvedNode,
    ResolvedState, Resolver,
};
use self::scm::{SourceControl, UpdateStrategy};
use self::signing::{SignatureVerifier, TrustDirectoryVerifier};
use self::state::{ManagedDependency, ManagedDependencyStore, ManagedState};

/// Injected collaborators. Tests pass in-memory fakes; `production`
/// wires the real implementations.
pub struct WorkspaceCapabilities {
    pub scm: Arc<dyn SourceControl>,
    pub http: Arc<dyn HttpClient>,
    pub archiver: Arc<dyn archive::Archiver>,
    pub verifier: Arc<dyn SignatureVerifier>,
    /// Defaults to the JSON loader over `scm` when absent.
    pub loader: Option<Arc<dyn ManifestLoader>>,
}

impl WorkspaceCapabilities {
    pub fn production(sandbox: &Sandbox, config: &WorkspaceConfig) -> Result<Self> {
        let scm: Arc<dyn SourceControl> = Arc::new(scm::GitCli::new(sandbox.repositories_dir()));
        let http: Arc<dyn HttpClient> =
            Arc::new(http::ReqwestClient::new(config.http.timeout())?);
        let trust_dir = config
            .prebuilts
            .trust_dir
            .clone()
            .unwrap_or_else(|| config.user_cache_dir().join("trust"));
        Ok(WorkspaceCapabilities {
            scm,
            http,
            archiver: Arc::new(archive::TarGzArchiver),
            verifier: Arc::new(TrustDirectoryVerifier::new(trust_dir)),
            loader: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Resolve,
    Update,
}

impl OperationKind {
    fn name(&self) -> &'static str {
        match self {
            OperationKind::Resolve => "resolve",
            OperationKind::Update => "update",
        }
    }
}

pub struct Workspace {
    sandbox: Sandbox,
    config: WorkspaceConfig,
    scm: Arc<dyn SourceControl>,
    http: Arc<dyn HttpClient>,
    archiver: Arc<dyn archive::Archiver>,
    provider: ContainerProvider,
    prebuilts: PrebuiltsManager,
    diagnostics: DiagnosticsSink,
    overrides: Vec<PackageDependency>,
    tools_version: ToolsVersion,
}

impl Workspace {
    pub fn new(
        root: PathBuf,
        config: WorkspaceConfig,
        capabilities: WorkspaceCapabilities,
        overrides: Vec<PackageDependency>,
    ) -> Result<Self> {
        let sandbox = Sandbox::new(root);
        let diagnostics = DiagnosticsSink::new();
        let tools_version = ToolsVersion::new(6, 1);

        let loader: Arc<dyn ManifestLoader> = capabilities
            .loader
            .unwrap_or_else(|| Arc::new(JsonManifestLoader::new(capabilities.scm.clone())));
        let registry = match config.registry.url.as_deref() {
            Some(url) => Some(Arc::new(RegistryClient::new(
                capabilities.http.clone(),
                url,
            )?)),
            None => None,
        };
        let provider = ContainerProvider::new(
            capabilities.scm.clone(),
            loader,
            registry,
            tools_version,
        );

        let platform = HostPlatform::detect(config.prebuilts.host_platform.as_deref());
        let prebuilts_config = PrebuiltsConfig {
            base_url: config
                .prebuilts
                .base_url
                .clone()
                .unwrap_or_else(|| prebuilts::DEFAULT_PREBUILTS_URL.to_string()),
            eligible: PrebuiltsConfig::default_eligible(),
            swift_version: config.swift_version(),
            platform,
            user_cache_dir: config.user_cache_dir(),
            disabled: config.prebuilts.disabled,
        };
        let prebuilts = PrebuiltsManager::new(
            capabilities.http.clone(),
            capabilities.verifier.clone(),
            capabilities.archiver.clone(),
            prebuilts_config,
            sandbox.clone(),
            diagnostics.root_scope(),
        );

        Ok(Workspace {
            sandbox,
            config,
            scm: capabilities.scm,
            http: capabilities.http,
            archiver: capabilities.archiver,
            provider,
            prebuilts,
            diagnostics,
            overrides,
            tools_version,
        })
    }

    pub fn diagnostics(&self) -> &DiagnosticsSink {
        &self.diagnostics
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn tools_version(&self) -> ToolsVersion {
        self.tools_version
    }

    /// Resolve the package graph for the given roots, reconciling the
    /// sandbox and producing a module graph. Pins bias the resolution.
    pub async fn resolve(&self, roots: &[Manifest]) -> Result<ModuleGraph> {
        self.run_operation(roots, OperationKind::Resolve).await
    }

    /// Re-resolve ignoring pin bias, bumping versions where constraints
    /// allow, and dropping stray pins.
    pub async fn update(&self, roots: &[Manifest]) -> Result<ModuleGraph> {
        self.run_operation(roots, OperationKind::Update).await
    }

    /// Preview what `update` would do: resolve without pin bias and
    /// report the version motions against the recorded pins. Nothing is
    /// written; pins, managed state, and checkouts stay as they are.
    pub async fn update_dry_run(&self, roots: &[Manifest]) -> Result<Vec<PinChange>> {
        let _lock = SandboxLock::acquire(&self.sandbox)?;
        let scope = self
            .diagnostics
            .root_scope()
            .with_metadata("operation", "update-dry-run");

        let pins = PinsStore::load(&self.sandbox.pins_file())?;
        let state = ManagedDependencyStore::load(&self.sandbox.state_file())?;
        let constraints =
            ConstraintStore::emit(roots, &self.overrides, &self.config.mirrors)?;
        let edited = self.edited_directories(&state);
        let overrides_map = validate_overrides(&self.overrides)?;
        let mut resolver = Resolver::new(
            &self.provider,
            None,
            overrides_map,
            &self.config.mirrors,
            UpdateStrategy::Always,
            scope,
        );
        let resolution = resolver.resolve(constraints, &edited).await?;
        Ok(pin_changes(&pins, &resolution.pins()))
    }

    /// Disk usage of the derived caches under the sandbox.
    pub fn cache_statistics(&self) -> CacheStatistics {
        CacheStatistics {
            prebuilts: directory_stats(&self.sandbox.prebuilts_dir()),
            artifacts: directory_stats(&self.sandbox.artifacts_dir()),
        }
    }

    async fn run_operation(
        &self,
        roots: &[Manifest],
        kind: OperationKind,
    ) -> Result<ModuleGraph> {
        let _lock = SandboxLock::acquire(&self.sandbox)?;
        let scope = self
            .diagnostics
            .root_scope()
            .with_metadata("operation", kind.name());

        let mut pins = PinsStore::load(&self.sandbox.pins_file())?;
        let mut state = ManagedDependencyStore::load(&self.sandbox.state_file())?;

        let constraints =
            ConstraintStore::emit(roots, &self.overrides, &self.config.mirrors)?;
        match compute_resolution_requirement(&constraints, &state) {
            ResolutionRequirement::NotRequired => {
                scope.debug("resolution precheck: managed state satisfies all constraints");
            }
            ResolutionRequirement::Required { reason } => {
                scope.debug(format!("resolution precheck: required ({:?})", reason));
            }
        }

        let edited = self.edited_directories(&state);
        let overrides_map = validate_overrides(&self.overrides)?;
        let (bias_pins, strategy) = match kind {
            OperationKind::Resolve => (Some(&pins), UpdateStrategy::Never),
            OperationKind::Update => (None, UpdateStrategy::Always),
        };
        let mut resolver = Resolver::new(
            &self.provider,
            bias_pins,
            overrides_map,
            &self.config.mirrors,
            strategy,
            scope.clone(),
        );
        let resolution = resolver.resolve(constraints, &edited).await?;

        // Pin writes land after resolution and before reconciliation.
        let new_pins = self.pins_for(&resolution, &pins, &state, kind, &scope);
        pins.replace_all(new_pins);
        pins.save()?;

        let reconciler = Reconciler::new(self.scm.clone(), &self.sandbox, scope.clone());
        let summary = reconciler.reconcile(&resolution, &mut state).await?;

        let prepared = self.prepare_prebuilts(&resolution, &state).await;
        let artifacts = self
            .bind_artifacts(roots, &resolution, &mut state)
            .await?;

        let mut packages: Vec<GraphPackage> = roots
            .iter()
            .map(|manifest| GraphPackage {
                identity: manifest.identity(),
                manifest: manifest.clone(),
                state: PackageState::Root,
                directory: PathBuf::from(&manifest.location),
            })
            .collect();
        for (identity, node) in &resolution.packages {
            packages.push(GraphPackage {
                identity: identity.clone(),
                manifest: node.manifest.clone(),
                state: PackageState::Resolved(node.state.clone()),
                directory: self.package_directory(identity, &state, node),
            });
        }

        let eligible = self.prebuilts.eligible_set();
        let builder =
            ModuleGraphBuilder::new(packages, &prepared, &artifacts, eligible, scope.clone());
        builder.build(summary.degraded)
    }

    /// Put a managed dependency into edit mode: a writable sibling
    /// checkout under `edits/` (or a user-supplied directory).
    pub async fn edit(
        &self,
        identity: &PackageIdentity,
        unmanaged_path: Option<PathBuf>,
    ) -> Result<()> {
        let _lock = SandboxLock::acquire(&self.sandbox)?;
        let mut state = ManagedDependencyStore::load(&self.sandbox.state_file())?;
        let dependency = state
            .dependency(identity)
            .cloned()
            .ok_or_else(|| StateError::UnknownDependency {
                identity: identity.clone(),
            })?;

        let checkout = match &dependency.state {
            ManagedState::Edited { .. } => {
                return Err(WorkspaceError::State(
                    StateError::DependencyAlreadyInEditMode {
                        identity: identity.clone(),
                    },
                ))
            }
            ManagedState::FileSystem { .. } => {
                return Err(WorkspaceError::State(
                    StateError::LocalDependencyCannotBeEdited {
                        identity: identity.clone(),
                    },
                ))
            }
            ManagedState::Checkout { state } => state.clone(),
        };

        let destination = unmanaged_path
            .clone()
            .unwrap_or_else(|| self.sandbox.edit_path(identity));
        self.scm
            .checkout(&dependency.location, checkout.revision(), &destination)
            .await?;

        state.add_dependency(ManagedDependency {
            identity: identity.clone(),
            location: dependency.location,
            subpath: dependency.subpath,
            state: ManagedState::Edited {
                based_on: Some(checkout),
                unmanaged_path,
            },
        });
        state.save()?;
        self.diagnostics
            .root_scope()
            .package_scope(identity.clone())
            .info(format!("'{}' is now being edited", identity));
        Ok(())
    }

    /// Leave edit mode, restoring the pre-edit checkout. Uncommitted
    /// changes in the edit directory block the transition unless forced.
    pub async fn unedit(&self, identity: &PackageIdentity, force: bool) -> Result<()> {
        let _lock = SandboxLock::acquire(&self.sandbox)?;
        let scope = self.diagnostics.root_scope().package_scope(identity.clone());
        let mut state = ManagedDependencyStore::load(&self.sandbox.state_file())?;
        let dependency = state
            .dependency(identity)
            .cloned()
            .ok_or_else(|| StateError::UnknownDependency {
                identity: identity.clone(),
            })?;
        let ManagedState::Edited {
            based_on,
            unmanaged_path,
        } = &dependency.state
        else {
            return Err(WorkspaceError::State(StateError::UnknownDependency {
                identity: identity.clone(),
            }));
        };

        let edit_dir = unmanaged_path
            .clone()
            .unwrap_or_else(|| self.sandbox.edit_path(identity));
        if !edit_dir.exists() {
            // Recoverable: fall back to the recorded checkout below.
            scope.warning(format!(
                "edit directory for '{}' is missing; restoring original checkout",
                identity
            ));
        } else if !force && self.scm.has_uncommitted_changes(&edit_dir).await? {
            return Err(WorkspaceError::State(StateError::UncommittedChangesInEdit {
                identity: identity.clone(),
            }));
        }

        match based_on {
            Some(previous) => {
                let destination = self.sandbox.checkout_path(identity);
                self.scm
                    .checkout(&dependency.location, previous.revision(), &destination)
                    .await?;
                state.add_dependency(ManagedDependency {
                    identity: identity.clone(),
                    location: dependency.location.clone(),
                    subpath: dependency.subpath.clone(),
                    state: ManagedState::Checkout {
                        state: previous.clone(),
                    },
                });
            }
            None => {
                state.remove_dependency(identity);
            }
        }
        state.save()?;

        // Only sandbox-managed edit directories are deleted; a
        // user-supplied directory stays behind.
        if unmanaged_path.is_none() {
            let managed_dir = self.sandbox.edit_path(identity);
            if managed_dir.exists() {
                tokio::fs::remove_dir_all(&managed_dir)
                    .await
                    .map_err(|e| WorkspaceError::io(managed_dir.display().to_string(), e))?;
            }
        }
        Ok(())
    }

    /// Drop pins, managed state, and all sandbox checkouts. Edit
    /// directories survive; they hold user changes.
    pub async fn reset(&self) -> Result<()> {
        let _lock = SandboxLock::acquire(&self.sandbox)?;
        let mut pins = PinsStore::load(&self.sandbox.pins_file())?;
        let mut state = ManagedDependencyStore::load(&self.sandbox.state_file())?;
        pins.reset()?;
        state.reset()?;
        for dir in [
            self.sandbox.checkouts_dir(),
            self.sandbox.artifacts_dir(),
            self.sandbox.prebuilts_dir(),
            self.sandbox.repositories_dir(),
        ] {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| WorkspaceError::io(dir.display().to_string(), e))?;
            }
        }
        Ok(())
    }

    /// Remove derived build state (extracted prebuilts and artifacts),
    /// keeping checkouts, pins, and the managed-state file.
    pub async fn clean(&self) -> Result<()> {
        let _lock = SandboxLock::acquire(&self.sandbox)?;
        for dir in [self.sandbox.prebuilts_dir(), self.sandbox.artifacts_dir()] {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| WorkspaceError::io(dir.display().to_string(), e))?;
            }
        }
        Ok(())
    }

    fn edited_directories(
        &self,
        state: &ManagedDependencyStore,
    ) -> BTreeMap<PackageIdentity, PathBuf> {
        state
            .dependencies()
            .values()
            .filter_map(|dep| match &dep.state {
                ManagedState::Edited { unmanaged_path, .. } => {
                    let dir = unmanaged_path
                        .clone()
                        .unwrap_or_else(|| self.sandbox.edit_path(&dep.identity));
                    Some((dep.identity.clone(), dir))
                }
                _ => None,
            })
            .collect()
    }

    /// The pin set to record for a finished resolution. A plain resolve
    /// retains pins of edited identities; `update` drops every stray pin
    /// and reports version motions.
    fn pins_for(
        &self,
        resolution: &Resolution,
        previous: &PinsStore,
        state: &ManagedDependencyStore,
        kind: OperationKind,
        scope: &DiagnosticsScope,
    ) -> Vec<Pin> {
        let mut pins = resolution.pins();

        match kind {
            OperationKind::Resolve => {
                for (identity, dependency) in state.dependencies() {
                    if dependency.state.is_edited() {
                        if let Some(pin) = previous.pin(identity) {
                            if !pins.iter().any(|p| &p.identity == identity) {
                                pins.push(pin.clone());
                            }
                        }
                    }
                }
            }
            OperationKind::Update => {
                for change in pin_changes(previous, &pins) {
                    scope.info(change.to_string());
                }
            }
        }
        pins
    }

    /// Prebuilt candidates are independent of each other; their pipelines
    /// run concurrently.
    async fn prepare_prebuilts(
        &self,
        resolution: &Resolution,
        state: &ManagedDependencyStore,
    ) -> Vec<PreparedPrebuilt> {
        let candidates: Vec<_> = resolution
            .packages
            .iter()
            .filter_map(|(identity, node)| match &node.state {
                ResolvedState::Version { version, .. }
                    if self.prebuilts.is_eligible(identity) =>
                {
                    Some((identity, version, self.package_directory(identity, state, node)))
                }
                _ => None,
            })
            .collect();
        let pipelines = candidates.into_iter().map(|(identity, version, directory)| {
            let manager = &self.prebuilts;
            async move { manager.prepare(identity, version, &directory).await }
        });
        futures::future::join_all(pipelines)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn bind_artifacts(
        &self,
        roots: &[Manifest],
        resolution: &Resolution,
        state: &mut ManagedDependencyStore,
    ) -> Result<Vec<state::ManagedArtifact>> {
        let scope = self.diagnostics.root_scope();
        let manager = BinaryArtifactsManager::new(
            self.http.clone(),
            self.archiver.clone(),
            self.sandbox.clone(),
            scope,
        );
        let mut hosts: Vec<ArtifactHost> = roots
            .iter()
            .map(|manifest| ArtifactHost {
                identity: manifest.identity(),
                manifest,
                directory: PathBuf::from(&manifest.location),
            })
            .collect();
        for (identity, node) in &resolution.packages {
            hosts.push(ArtifactHost {
                identity: identity.clone(),
                manifest: &node.manifest,
                directory: self.package_directory(identity, state, node),
            });
        }
        manager.bind_all(&hosts, state).await
    }

    fn package_directory(
        &self,
        identity: &PackageIdentity,
        state: &ManagedDependencyStore,
        node: &ResolvedNode,
    ) -> PathBuf {
        if let ResolvedState::Local { path } = &node.state {
            return path.clone();
        }
        if let Some(dependency) = state.dependency(identity) {
            if let ManagedState::Edited { unmanaged_path, .. } = &dependency.state {
                return unmanaged_path
                    .clone()
                    .unwrap_or_else(|| self.sandbox.edit_path(identity));
            }
        }
        self.sandbox.checkout_path(identity)
    }
}

/// One version motion between the recorded pins and a fresh resolution.
/// `old` is absent for newly added packages, `new` for dropped strays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinChange {
    pub identity: PackageIdentity,
    pub old: Option<pins::PinState>,
    pub new: Option<pins::PinState>,
}

impl std::fmt::Display for PinChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => write!(
                f,
                "'{}' {} -> {}",
                self.identity,
                describe_pin(old),
                describe_pin(new)
            ),
            (None, Some(new)) => write!(f, "'{}' added at {}", self.identity, describe_pin(new)),
            (Some(_), None) => write!(f, "'{}' removed (stray pin dropped)", self.identity),
            (None, None) => write!(f, "'{}' unchanged", self.identity),
        }
    }
}

/// Diff a fresh pin set against the recorded one.
fn pin_changes(previous: &PinsStore, next: &[Pin]) -> Vec<PinChange> {
    let mut changes = Vec::new();
    for pin in next {
        match previous.pin(&pin.identity) {
            Some(old) if old.state != pin.state => changes.push(PinChange {
                identity: pin.identity.clone(),
                old: Some(old.state.clone()),
                new: Some(pin.state.clone()),
            }),
            None => changes.push(PinChange {
                identity: pin.identity.clone(),
                old: None,
                new: Some(pin.state.clone()),
            }),
            _ => {}
        }
    }
    for (identity, old) in previous.pins() {
        if !next.iter().any(|p| &p.identity == identity) {
            changes.push(PinChange {
                identity: identity.clone(),
                old: Some(old.state.clone()),
                new: None,
            });
        }
    }
    changes
}

/// Entry counts and sizes of the sandbox caches.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub prebuilts: DirectoryStats,
    pub artifacts: DirectoryStats,
}

impl CacheStatistics {
    pub fn is_empty(&self) -> bool {
        self.prebuilts.entries == 0 && self.artifacts.entries == 0
    }
}

impl std::fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cache statistics:")?;
        writeln!(
            f,
            "  Prebuilts: {} entries, {:.2} MB",
            self.prebuilts.entries,
            self.prebuilts.total_bytes as f64 / 1024.0 / 1024.0
        )?;
        write!(
            f,
            "  Artifacts: {} entries, {:.2} MB",
            self.artifacts.entries,
            self.artifacts.total_bytes as f64 / 1024.0 / 1024.0
        )
    }
}

fn describe_pin(state: &pins::PinState) -> String {
    match state {
        pins::PinState::Version { version, .. } => version.to_string(),
        pins::PinState::Branch { name, revision } => {
            format!("branch '{}' at {}", name, short(revision))
        }
        pins::PinState::Revision { revision } => format!("revision {}", short(revision)),
        pins::PinState::LocalPackage => "local".to_string(),
    }
}

fn short(revision: &str) -> &str {
    &revision[..revision.len().min(8)]
}
