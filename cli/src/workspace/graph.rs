//! Folding resolved packages into the module graph.
//!
//! The builder is the only place that materializes build-setting overlays
//! on modules; resolution, prebuilt preparation and artifact binding all
//! stage their decisions and hand them in here.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::workspace::diagnostics::DiagnosticsScope;
use crate::workspace::errors::{ConstraintError, Result, WorkspaceError};
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{Manifest, TargetDependency, TargetKind};
use crate::workspace::prebuilts::{
    prebuilts_leak_into_products, PreparedPrebuilt, SchemaGeneration,
};
use crate::workspace::resolver::ResolvedState;
use crate::workspace::state::ManagedArtifact;

/// Build-setting overlay attached to one module. Current-generation
/// prebuilts populate the flag lists; legacy-generation prebuilts
/// populate the path maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSettings {
    pub other_swift_flags: Vec<String>,
    pub other_ldflags: Vec<String>,
    pub prebuilt_include_paths: Vec<PathBuf>,
    pub prebuilt_library_paths: Vec<PathBuf>,
    pub prebuilt_libraries: Vec<String>,
}

impl BuildSettings {
    pub fn is_empty(&self) -> bool {
        self.other_swift_flags.is_empty()
            && self.other_ldflags.is_empty()
            && self.prebuilt_include_paths.is_empty()
            && self.prebuilt_library_paths.is_empty()
            && self.prebuilt_libraries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub kind: TargetKind,
    pub dependencies: Vec<TargetDependency>,
    pub build_settings: BuildSettings,
    /// For binary modules, the artifact the module is bound to.
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageState {
    Root,
    Resolved(ResolvedState),
}

#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub identity: PackageIdentity,
    pub manifest: Manifest,
    pub state: PackageState,
    pub directory: PathBuf,
    pub modules: Vec<Module>,
}

impl ResolvedPackage {
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// The read-only output of a workspace operation.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    pub packages: BTreeMap<PackageIdentity, ResolvedPackage>,
    pub roots: Vec<PackageIdentity>,
    /// Some identities failed to fetch and are absent.
    pub degraded: bool,
}

impl ModuleGraph {
    pub fn package(&self, identity: &PackageIdentity) -> Option<&ResolvedPackage> {
        self.packages.get(identity)
    }

    pub fn root_packages(&self) -> impl Iterator<Item = &ResolvedPackage> {
        self.roots.iter().filter_map(|id| self.packages.get(id))
    }
}

/// Inputs for one package being folded in.
pub struct GraphPackage {
    pub identity: PackageIdentity,
    pub manifest: Manifest,
    pub state: PackageState,
    pub directory: PathBuf,
}

pub struct ModuleGraphBuilder<'a> {
    packages: Vec<GraphPackage>,
    prebuilts: &'a [PreparedPrebuilt],
    artifacts: &'a [ManagedArtifact],
    eligible: &'a BTreeSet<PackageIdentity>,
    scope: DiagnosticsScope,
}

impl<'a> ModuleGraphBuilder<'a> {
    pub fn new(
        packages: Vec<GraphPackage>,
        prebuilts: &'a [PreparedPrebuilt],
        artifacts: &'a [ManagedArtifact],
        eligible: &'a BTreeSet<PackageIdentity>,
        scope: DiagnosticsScope,
    ) -> Self {
        ModuleGraphBuilder {
            packages,
            prebuilts,
            artifacts,
            eligible,
            scope,
        }
    }

    pub fn build(self, degraded: bool) -> Result<ModuleGraph> {
        self.check_product_references()?;
        self.check_product_cycles()?;

        let roots: Vec<PackageIdentity> = self
            .packages
            .iter()
            .filter(|p| p.state == PackageState::Root)
            .map(|p| p.identity.clone())
            .collect();
        let root_manifests: Vec<Manifest> = self
            .packages
            .iter()
            .filter(|p| p.state == PackageState::Root)
            .map(|p| p.manifest.clone())
            .collect();
        let dependency_manifests: Vec<(PackageIdentity, Manifest)> = self
            .packages
            .iter()
            .filter(|p| p.state != PackageState::Root)
            .map(|p| (p.identity.clone(), p.manifest.clone()))
            .collect();

        // The leakage rule gates all injections at once: if a non-macro
        // non-test root target reaches a prebuilt consumer, every
        // injection is dropped, silently.
        let inject = !self.prebuilts.is_empty()
            && !prebuilts_leak_into_products(&root_manifests, &dependency_manifests, self.eligible);

        let mut graph = ModuleGraph {
            packages: BTreeMap::new(),
            roots: roots.clone(),
            degraded,
        };

        for package in &self.packages {
            let is_root = package.state == PackageState::Root;
            let mut modules = Vec::new();
            for target in &package.manifest.targets {
                let mut settings = BuildSettings::default();
                if inject
                    && is_root
                    && matches!(target.kind, TargetKind::Macro | TargetKind::Test)
                    && self.target_reaches_prebuilt(&package.identity, &target.name)
                {
                    for prepared in self.prebuilts {
                        apply_injections(&mut settings, prepared);
                    }
                }

                let artifact = self
                    .artifacts
                    .iter()
                    .find(|a| a.identity == package.identity && a.target_name == target.name)
                    .map(|a| a.path.clone());

                modules.push(Module {
                    name: target.name.clone(),
                    kind: target.kind,
                    dependencies: target.dependencies.clone(),
                    build_settings: settings,
                    artifact,
                });
            }
            graph.packages.insert(
                package.identity.clone(),
                ResolvedPackage {
                    identity: package.identity.clone(),
                    manifest: package.manifest.clone(),
                    state: package.state.clone(),
                    directory: package.directory.clone(),
                    modules,
                },
            );
        }

        self.scope.debug(format!(
            "module graph built: {} packages, prebuilt injections {}",
            graph.packages.len(),
            if inject { "enabled" } else { "disabled" }
        ));
        Ok(graph)
    }

    /// Every product named by a target dependency must exist in the
    /// package it points at.
    fn check_product_references(&self) -> Result<()> {
        for package in &self.packages {
            for target in &package.manifest.targets {
                for dep in &target.dependencies {
                    let TargetDependency::Product {
                        name,
                        package: Some(owner),
                    } = dep
                    else {
                        continue;
                    };
                    let Some(owner_package) =
                        self.packages.iter().find(|p| &p.identity == owner)
                    else {
                        // The owner may be absent in a degraded graph.
                        continue;
                    };
                    if owner_package.manifest.product(name).is_none() {
                        return Err(WorkspaceError::Constraint(
                            ConstraintError::ProductNotFound {
                                product: name.clone(),
                                package: owner.clone(),
                            },
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Reject cycles at the product level with a DFS over product
    /// references.
    fn check_product_cycles(&self) -> Result<()> {
        // product -> products it depends on (through its targets).
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for package in &self.packages {
            for product in &package.manifest.products {
                let entry = edges.entry(product.name.clone()).or_default();
                for target_name in &product.targets {
                    if let Some(target) = package.manifest.target(target_name) {
                        for dep in &target.dependencies {
                            if let TargetDependency::Product { name, .. } = dep {
                                entry.insert(name.clone());
                            }
                        }
                    }
                }
            }
        }

        let mut done: BTreeSet<&str> = BTreeSet::new();
        let empty: BTreeSet<String> = BTreeSet::new();
        for start in edges.keys() {
            if done.contains(start.as_str()) {
                continue;
            }
            let mut stack: Vec<(&str, std::collections::btree_set::Iter<'_, String>)> = Vec::new();
            let mut on_path: BTreeSet<&str> = BTreeSet::new();
            stack.push((
                start.as_str(),
                edges.get(start).unwrap_or(&empty).iter(),
            ));
            on_path.insert(start.as_str());
            while let Some((node, iter)) = stack.last_mut() {
                let node = *node;
                match iter.next() {
                    Some(next) => {
                        if on_path.contains(next.as_str()) {
                            return Err(WorkspaceError::CyclicDependencyDetected {
                                product: next.clone(),
                            });
                        }
                        if done.contains(next.as_str()) {
                            continue;
                        }
                        if let Some(targets) = edges.get(next) {
                            on_path.insert(next.as_str());
                            stack.push((next.as_str(), targets.iter()));
                        }
                    }
                    None => {
                        on_path.remove(node);
                        done.insert(node);
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether a target transitively depends on a product of a
    /// prebuilt-eligible package; only such targets receive injections.
    fn target_reaches_prebuilt(&self, identity: &PackageIdentity, target_name: &str) -> bool {
        let mut work = vec![(identity.clone(), target_name.to_string())];
        let mut visited = BTreeSet::new();
        while let Some((package, target)) = work.pop() {
            if !visited.insert((package.clone(), target.clone())) {
                continue;
            }
            if self.eligible.contains(&package) {
                return true;
            }
            let Some(graph_package) = self.packages.iter().find(|p| p.identity == package) else {
                continue;
            };
            let Some(target) = graph_package.manifest.target(&target) else {
                continue;
            };
            for dep in &target.dependencies {
                match dep {
                    TargetDependency::Target { name } => {
                        work.push((package.clone(), name.clone()));
                    }
                    TargetDependency::Product { name, package: owner } => {
                        let owner = owner.clone().or_else(|| {
                            self.packages
                                .iter()
                                .find(|p| p.manifest.product(name).is_some())
                                .map(|p| p.identity.clone())
                        });
                        let Some(owner) = owner else { continue };
                        if self.eligible.contains(&owner) {
                            return true;
                        }
                        if let Some(owner_package) =
                            self.packages.iter().find(|p| p.identity == owner)
                        {
                            if let Some(product) = owner_package.manifest.product(name) {
                                for t in &product.targets {
                                    work.push((owner.clone(), t.clone()));
                                }
                            }
                        }
                    }
                }
            }
        }
        false
    }
}

/// Stage one prepared prebuilt into a module's build settings.
fn apply_injections(settings: &mut BuildSettings, prepared: &PreparedPrebuilt) {
    for library in &prepared.libraries {
        match library.schema {
            SchemaGeneration::Current => {
                settings.other_swift_flags.push(format!(
                    "-I{}",
                    library.extract_dir.join("Modules").display()
                ));
                for module in &library.c_modules {
                    settings.other_swift_flags.push(format!(
                        "-I{}",
                        library.extract_dir.join("include").join(module).display()
                    ));
                }
                settings.other_ldflags.push(
                    library
                        .extract_dir
                        .join("lib")
                        .join(format!("lib{}.a", library.name))
                        .display()
                        .to_string(),
                );
            }
            SchemaGeneration::Legacy => {
                settings
                    .prebuilt_include_paths
                    .push(library.extract_dir.join("Modules"));
                for include in &library.include_paths {
                    settings
                        .prebuilt_include_paths
                        .push(prepared.checkout_dir.join(include));
                }
                settings
                    .prebuilt_library_paths
                    .push(library.extract_dir.join("lib"));
                settings.prebuilt_libraries.push(library.name.clone());
            }
        }
    }
}
