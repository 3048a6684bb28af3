//! Command implementations. This is the only layer that renders
//! diagnostics and writes to standard streams.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::WorkspaceConfig;
use crate::workspace::diagnostics::Severity;
use crate::workspace::graph::ModuleGraph;
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::workspace::{Workspace, WorkspaceCapabilities};

fn build_workspace(root: PathBuf, config: WorkspaceConfig) -> Result<Workspace> {
    let sandbox = crate::workspace::fsops::Sandbox::new(root.clone());
    let capabilities = WorkspaceCapabilities::production(&sandbox, &config)
        .context("initializing workspace collaborators")?;
    Workspace::new(root, config, capabilities, Vec::new()).context("opening workspace")
}

async fn load_root_manifest(root: &PathBuf) -> Result<Manifest> {
    let path = root.join(MANIFEST_FILE_NAME);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("no package manifest at {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Render collected diagnostics to stderr at or above `threshold`;
/// verbose mode shows everything.
fn render_diagnostics(workspace: &Workspace, verbose: bool, threshold: Severity) {
    let threshold = if verbose { Severity::Debug } else { threshold };
    for record in workspace.diagnostics().records() {
        if record.severity < threshold {
            continue;
        }
        match &record.package {
            Some(package) => {
                eprintln!("{}: {}: {}", record.severity, package, record.message)
            }
            None => eprintln!("{}: {}", record.severity, record.message),
        }
    }
}

fn print_graph_summary(graph: &ModuleGraph) {
    for package in graph.packages.values() {
        let state = match &package.state {
            crate::workspace::graph::PackageState::Root => "root".to_string(),
            crate::workspace::graph::PackageState::Resolved(state) => state.to_string(),
        };
        println!("{} ({})", package.identity, state);
    }
    if graph.degraded {
        eprintln!("warning: some dependencies could not be fetched; the graph is incomplete");
    }
}

pub async fn resolve_command(root: PathBuf, config: WorkspaceConfig) -> Result<()> {
    let verbose = config.verbose.unwrap_or(false);
    let workspace = build_workspace(root.clone(), config)?;
    let manifest = load_root_manifest(&root).await?;

    let result = workspace.resolve(std::slice::from_ref(&manifest)).await;
    render_diagnostics(&workspace, verbose, Severity::Warning);
    let graph = result?;
    print_graph_summary(&graph);
    Ok(())
}

pub async fn update_command(root: PathBuf, config: WorkspaceConfig, dry_run: bool) -> Result<()> {
    let verbose = config.verbose.unwrap_or(false);
    let workspace = build_workspace(root.clone(), config)?;
    let manifest = load_root_manifest(&root).await?;

    if dry_run {
        let result = workspace
            .update_dry_run(std::slice::from_ref(&manifest))
            .await;
        render_diagnostics(&workspace, verbose, Severity::Warning);
        let changes = result?;
        if changes.is_empty() {
            println!("everything is already up to date");
        }
        for change in &changes {
            println!("{}", change);
        }
        return Ok(());
    }

    let result = workspace.update(std::slice::from_ref(&manifest)).await;
    // Version motions are emitted as info records; an update shows them
    // by default.
    render_diagnostics(&workspace, verbose, Severity::Info);
    let graph = result?;
    print_graph_summary(&graph);
    Ok(())
}

pub async fn edit_command(
    root: PathBuf,
    config: WorkspaceConfig,
    package: &str,
    path: Option<PathBuf>,
) -> Result<()> {
    let verbose = config.verbose.unwrap_or(false);
    let workspace = build_workspace(root, config)?;
    let identity = PackageIdentity::plain(package);

    let result = workspace.edit(&identity, path).await;
    render_diagnostics(&workspace, verbose, Severity::Warning);
    result?;
    println!("'{}' is now in edit mode", identity);
    Ok(())
}

pub async fn unedit_command(
    root: PathBuf,
    config: WorkspaceConfig,
    package: &str,
    force: bool,
) -> Result<()> {
    let verbose = config.verbose.unwrap_or(false);
    let workspace = build_workspace(root, config)?;
    let identity = PackageIdentity::plain(package);

    let result = workspace.unedit(&identity, force).await;
    render_diagnostics(&workspace, verbose, Severity::Warning);
    result?;
    println!("'{}' restored to its recorded checkout", identity);
    Ok(())
}

pub async fn reset_command(root: PathBuf, config: WorkspaceConfig) -> Result<()> {
    let workspace = build_workspace(root, config)?;
    workspace.reset().await?;
    println!("workspace reset");
    Ok(())
}

pub async fn clean_command(root: PathBuf, config: WorkspaceConfig) -> Result<()> {
    let workspace = build_workspace(root, config)?;
    let stats = workspace.cache_statistics();
    if stats.is_empty() {
        println!("caches are already empty");
        return Ok(());
    }
    println!("{}", stats);
    workspace.clean().await?;
    println!("derived artifacts removed");
    Ok(())
}
