//! Reconciliation: make the sandbox match a resolution.
//!
//! The delta between the resolver's output and the managed-dependency
//! store is computed and enacted dependency by dependency. The store is
//! persisted after every step so a crash leaves a valid, if incomplete,
//! document. Per-dependency fetch failures are collected and the pass
//! continues for unaffected identities; the summary is marked degraded.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::workspace::diagnostics::DiagnosticsScope;
use crate::workspace::errors::Result;
use crate::workspace::fsops::Sandbox;
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::DependencyLocation;
use crate::workspace::resolver::{Resolution, ResolvedState};
use crate::workspace::scm::{SourceControl, UpdateStrategy};
use crate::workspace::state::{
    CheckoutState, ManagedDependency, ManagedDependencyStore, ManagedState,
};

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub added: Vec<PackageIdentity>,
    pub updated: Vec<PackageIdentity>,
    pub removed: Vec<PackageIdentity>,
    /// True when some identities failed and were skipped.
    pub degraded: bool,
}

pub struct Reconciler<'a> {
    scm: Arc<dyn SourceControl>,
    sandbox: &'a Sandbox,
    scope: DiagnosticsScope,
}

impl<'a> Reconciler<'a> {
    pub fn new(scm: Arc<dyn SourceControl>, sandbox: &'a Sandbox, scope: DiagnosticsScope) -> Self {
        Reconciler {
            scm,
            sandbox,
            scope,
        }
    }

    pub async fn reconcile(
        &self,
        resolution: &Resolution,
        store: &mut ManagedDependencyStore,
    ) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        // New and changed identities first, in deterministic order.
        for (identity, node) in &resolution.packages {
            let existing = store.dependency(identity).cloned();
            match existing {
                None => {
                    match self.materialize(identity, &node.location, &node.state).await {
                        Ok(managed) => {
                            store.add_dependency(managed);
                            store.save()?;
                            summary.added.push(identity.clone());
                        }
                        Err(e) => {
                            self.scope
                                .package_scope(identity.clone())
                                .error(format!("failed to fetch '{}': {}", identity, e));
                            summary.degraded = true;
                        }
                    }
                }
                Some(managed) if managed.state.is_edited() => {
                    // Edited dependencies are immune to resolver-driven
                    // mutation; repair them if their directory vanished.
                    self.repair_edit(identity, &managed, store).await?;
                }
                Some(managed) => {
                    let wanted = node.state.to_checkout_state();
                    let needs_update = match (&managed.state, &wanted) {
                        (ManagedState::Checkout { state }, Some(wanted)) => state != wanted,
                        (ManagedState::FileSystem { path }, None) => {
                            !matches!(&node.state, ResolvedState::Local { path: p } if p == path)
                        }
                        _ => true,
                    };
                    let missing = self.is_missing_on_disk(&managed).await;
                    if missing {
                        self.scope.package_scope(identity.clone()).warning(format!(
                            "dependency '{}' is missing; cloning again",
                            identity
                        ));
                    }
                    if needs_update || missing {
                        match self.materialize(identity, &node.location, &node.state).await {
                            Ok(updated) => {
                                store.add_dependency(updated);
                                store.save()?;
                                summary.updated.push(identity.clone());
                            }
                            Err(e) => {
                                self.scope
                                    .package_scope(identity.clone())
                                    .error(format!("failed to update '{}': {}", identity, e));
                                summary.degraded = true;
                            }
                        }
                    }
                }
            }
        }

        // Identities present in the store but absent from the resolution.
        let resolved: BTreeSet<PackageIdentity> = resolution.packages.keys().cloned().collect();
        let stale: Vec<ManagedDependency> = store
            .dependencies()
            .values()
            .filter(|d| !resolved.contains(&d.identity))
            .cloned()
            .collect();
        for dependency in stale {
            if dependency.state.is_edited() {
                self.scope
                    .package_scope(dependency.identity.clone())
                    .warning(format!(
                        "dependency '{}' is in edit mode but no longer referenced; retaining",
                        dependency.identity
                    ));
                continue;
            }
            let checkout = self.sandbox.checkout_path(&dependency.identity);
            if checkout.exists() {
                tokio::fs::remove_dir_all(&checkout).await.ok();
            }
            store.remove_dependency(&dependency.identity);
            store.save()?;
            summary.removed.push(dependency.identity);
        }

        Ok(summary)
    }

    /// Fetch and check out one identity into its sandbox subpath.
    async fn materialize(
        &self,
        identity: &PackageIdentity,
        location: &DependencyLocation,
        state: &ResolvedState,
    ) -> Result<ManagedDependency> {
        match state {
            ResolvedState::Local { path } => Ok(ManagedDependency {
                identity: identity.clone(),
                location: location.display_string(),
                subpath: path.clone(),
                state: ManagedState::FileSystem { path: path.clone() },
            }),
            _ => match state.to_checkout_state() {
                Some(checkout_state) => self.checkout(identity, location, &checkout_state).await,
                None => Ok(ManagedDependency {
                    identity: identity.clone(),
                    location: location.display_string(),
                    subpath: PathBuf::from(identity.as_str()),
                    state: ManagedState::FileSystem {
                        path: PathBuf::from(location.display_string()),
                    },
                }),
            },
        }
    }

    async fn checkout(
        &self,
        identity: &PackageIdentity,
        location: &DependencyLocation,
        state: &CheckoutState,
    ) -> Result<ManagedDependency> {
        let url = location.display_string();
        let destination = self.sandbox.checkout_path(identity);
        self.scm
            .ensure_fetched(
                &url,
                &UpdateStrategy::IfNeeded {
                    revision: state.revision().to_string(),
                },
            )
            .await?;
        self.scm
            .checkout(&url, state.revision(), &destination)
            .await?;
        Ok(ManagedDependency {
            identity: identity.clone(),
            location: url,
            subpath: PathBuf::from(identity.as_str()),
            state: ManagedState::Checkout {
                state: state.clone(),
            },
        })
    }

    async fn is_missing_on_disk(&self, dependency: &ManagedDependency) -> bool {
        match &dependency.state {
            ManagedState::Checkout { .. } => {
                !self.sandbox.checkout_path(&dependency.identity).exists()
            }
            ManagedState::Edited { unmanaged_path, .. } => {
                let dir = unmanaged_path
                    .clone()
                    .unwrap_or_else(|| self.sandbox.edit_path(&dependency.identity));
                !dir.exists()
            }
            ManagedState::FileSystem { path } => !path.exists(),
        }
    }

    /// An edited dependency whose working directory was deleted falls back
    /// to its previous checkout state, with a warning.
    async fn repair_edit(
        &self,
        identity: &PackageIdentity,
        managed: &ManagedDependency,
        store: &mut ManagedDependencyStore,
    ) -> Result<()> {
        let ManagedState::Edited {
            based_on,
            unmanaged_path,
        } = &managed.state
        else {
            return Ok(());
        };
        let edit_dir = unmanaged_path
            .clone()
            .unwrap_or_else(|| self.sandbox.edit_path(identity));
        if edit_dir.exists() {
            return Ok(());
        }

        self.scope.package_scope(identity.clone()).warning(format!(
            "edit directory for '{}' was deleted; restoring original checkout",
            identity
        ));
        if let Some(previous) = based_on {
            let location = DependencyLocation::SourceControl {
                url: managed.location.clone(),
            };
            let restored = self.checkout(identity, &location, previous).await?;
            store.add_dependency(restored);
        } else {
            store.remove_dependency(identity);
        }
        store.save()?;
        Ok(())
    }
}
