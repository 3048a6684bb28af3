//! Prebuilt-library acquisition.
//!
//! For dependencies in the prebuilt-eligible set, a signed manifest is
//! fetched, verified against the trust directory, and matching archives
//! are downloaded into a content-addressed user cache, revalidated by
//! SHA-256 on every use, and extracted under the sandbox. Nothing in this
//! pipeline is ever fatal to the graph: every failure either warns or
//! silently disables prebuilts for the candidate, because the fallback is
//! building from source.
//!
//! Two manifest schema generations coexist. The legacy generation carries
//! `includePath` entries and one platform-independent archive per library;
//! the current generation carries `cModules` plus per-platform `artifacts`.
//! Both are accepted and discriminated by field presence; injections
//! emitted for the current generation use compiler/linker flag maps, the
//! legacy generation produces the prebuilt path maps.

use semver::Version;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::workspace::archive::Archiver;
use crate::workspace::diagnostics::DiagnosticsScope;
use crate::workspace::fsops::{sha256_file, Sandbox};
use crate::workspace::http::HttpClient;
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{Manifest, TargetDependency, TargetKind};
use crate::workspace::platform::HostPlatform;
use crate::workspace::signing::{SignatureEnvelope, SignatureVerifier};

pub const DEFAULT_PREBUILTS_URL: &str = "https://download.swift.org/prebuilts";

/// Cache bucket under the user cache directory.
pub const USER_CACHE_BUCKET: &str = "org.swift.swiftpm";

#[derive(Debug, Clone)]
pub struct PrebuiltsConfig {
    pub base_url: String,
    /// Identities that may ship prebuilts at all.
    pub eligible: BTreeSet<PackageIdentity>,
    /// Toolchain version governing URL templates, `major.minor`.
    pub swift_version: String,
    pub platform: HostPlatform,
    /// `<user-cache>/org.swift.swiftpm`; archives land under `prebuilts/`.
    pub user_cache_dir: PathBuf,
    pub disabled: bool,
}

impl PrebuiltsConfig {
    pub fn default_eligible() -> BTreeSet<PackageIdentity> {
        std::iter::once(PackageIdentity::plain("swift-syntax")).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaGeneration {
    Legacy,
    Current,
}

/// One library ready for injection after download and extraction.
#[derive(Debug, Clone)]
pub struct PreparedLibrary {
    pub name: String,
    pub products: Vec<String>,
    pub schema: SchemaGeneration,
    pub extract_dir: PathBuf,
    /// Legacy: additional include paths anchored at the dependency's
    /// checkout root.
    pub include_paths: Vec<PathBuf>,
    /// Current: C modules whose headers are bundled with the archive.
    pub c_modules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PreparedPrebuilt {
    pub identity: PackageIdentity,
    pub version: Version,
    pub checkout_dir: PathBuf,
    pub libraries: Vec<PreparedLibrary>,
}

// Wire format, both generations.

#[derive(Debug, Deserialize)]
struct SignedContainer {
    manifest: serde_json::Value,
    signature: SignatureEnvelope,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    libraries: Vec<RawLibrary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLibrary {
    name: String,
    #[serde(default)]
    products: Vec<String>,
    #[serde(default)]
    c_modules: Vec<String>,
    #[serde(default)]
    include_path: Vec<PathBuf>,
    #[serde(default)]
    artifacts: Vec<RawArtifact>,
    /// Legacy single-archive checksum.
    #[serde(default)]
    checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawArtifact {
    platform: String,
    checksum: String,
}

impl RawLibrary {
    fn schema(&self) -> SchemaGeneration {
        if self.artifacts.is_empty() {
            SchemaGeneration::Legacy
        } else {
            SchemaGeneration::Current
        }
    }
}

pub struct PrebuiltsManager {
    http: Arc<dyn HttpClient>,
    verifier: Arc<dyn SignatureVerifier>,
    archiver: Arc<dyn Archiver>,
    config: PrebuiltsConfig,
    sandbox: Sandbox,
    scope: DiagnosticsScope,
    /// Manifest 404s already seen this process, so a second resolution
    /// pass does not refetch them.
    misses: Mutex<BTreeSet<(PackageIdentity, Version)>>,
}

impl PrebuiltsManager {
    pub fn new(
        http: Arc<dyn HttpClient>,
        verifier: Arc<dyn SignatureVerifier>,
        archiver: Arc<dyn Archiver>,
        config: PrebuiltsConfig,
        sandbox: Sandbox,
        scope: DiagnosticsScope,
    ) -> Self {
        PrebuiltsManager {
            http,
            verifier,
            archiver,
            config,
            sandbox,
            scope,
            misses: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn is_eligible(&self, identity: &PackageIdentity) -> bool {
        !self.config.disabled && self.config.eligible.contains(identity)
    }

    pub fn eligible_set(&self) -> &BTreeSet<PackageIdentity> {
        &self.config.eligible
    }

    /// Run the whole pipeline for one candidate. `None` means prebuilts
    /// are unavailable for it; the build falls back to source. Safe to
    /// re-enter: completed downloads are revalidated, not repeated.
    pub async fn prepare(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        checkout_dir: &Path,
    ) -> Option<PreparedPrebuilt> {
        if !self.is_eligible(identity) {
            return None;
        }
        if self
            .misses
            .lock()
            .unwrap()
            .contains(&(identity.clone(), version.clone()))
        {
            return None;
        }

        let Some(libraries) = self.fetch_manifest(identity, version).await else {
            self.misses
                .lock()
                .unwrap()
                .insert((identity.clone(), version.clone()));
            return None;
        };

        let mut prepared = Vec::new();
        for library in libraries {
            if let Some(lib) = self.prepare_library(identity, version, &library).await {
                prepared.push(lib);
            }
        }
        if prepared.is_empty() {
            return None;
        }
        Some(PreparedPrebuilt {
            identity: identity.clone(),
            version: version.clone(),
            checkout_dir: checkout_dir.to_path_buf(),
            libraries: prepared,
        })
    }

    /// Fetch and verify the signed manifest, trying the current URL
    /// template first and the legacy one second. A 404 on both is a
    /// silent miss.
    async fn fetch_manifest(
        &self,
        identity: &PackageIdentity,
        version: &Version,
    ) -> Option<Vec<RawLibrary>> {
        let base = format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            identity,
            version
        );
        let candidates = [
            format!("{}/{}-manifest.json", base, self.config.swift_version),
            format!("{}/{}.json", base, self.config.swift_version),
        ];

        for url in candidates {
            let response = match self.http.get(&url).await {
                Ok(response) => response,
                Err(e) => {
                    self.scope
                        .package_scope(identity.clone())
                        .debug(format!("prebuilt manifest fetch failed: {}", e));
                    continue;
                }
            };
            if !response.is_success() {
                continue;
            }

            // Keep the body in the per-version cache directory for
            // inspection and offline reuse.
            let cache_dir = self.cache_dir(identity, version);
            if std::fs::create_dir_all(&cache_dir).is_ok() {
                if let Some(file) = url.rsplit('/').next() {
                    let _ = std::fs::write(cache_dir.join(file), &response.body);
                }
            }

            let container: SignedContainer = match serde_json::from_slice(&response.body) {
                Ok(container) => container,
                Err(e) => {
                    self.scope
                        .package_scope(identity.clone())
                        .warning(format!("Failed to decode prebuilt manifest: {}", e));
                    return None;
                }
            };

            let payload = match serde_json::to_vec(&container.manifest) {
                Ok(payload) => payload,
                Err(_) => return None,
            };
            if let Err(e) = self.verifier.verify(&payload, &container.signature) {
                self.scope
                    .package_scope(identity.clone())
                    .warning(format!("Failed to decode prebuilt manifest: {}", e));
                return None;
            }

            let manifest: RawManifest = match serde_json::from_value(container.manifest) {
                Ok(manifest) => manifest,
                Err(e) => {
                    self.scope
                        .package_scope(identity.clone())
                        .warning(format!("Failed to decode prebuilt manifest: {}", e));
                    return None;
                }
            };
            return Some(manifest.libraries);
        }
        None
    }

    async fn prepare_library(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        library: &RawLibrary,
    ) -> Option<PreparedLibrary> {
        let schema = library.schema();

        // Select the artifact for the host platform. No entry means no
        // prebuilt for this host: not an error, not a warning.
        let (archive_name, checksum) = match schema {
            SchemaGeneration::Current => {
                let artifact = library
                    .artifacts
                    .iter()
                    .find(|a| a.platform == self.config.platform.key())?;
                (
                    format!(
                        "{}-{}-{}.zip",
                        self.config.swift_version,
                        library.name,
                        self.config.platform.key()
                    ),
                    artifact.checksum.clone(),
                )
            }
            SchemaGeneration::Legacy => {
                let checksum = library.checksum.clone()?;
                (
                    format!("{}-{}.zip", self.config.swift_version, library.name),
                    checksum,
                )
            }
        };

        let cache_path = self.cache_dir(identity, version).join(&archive_name);
        if !self.ensure_cached(identity, version, &archive_name, &checksum, &cache_path).await {
            return None;
        }

        // Extraction directory mirrors the archive name, minus extension.
        let extract_dir = self
            .sandbox
            .prebuilts_dir()
            .join(identity.as_str())
            .join(version.to_string())
            .join(archive_name.trim_end_matches(".zip"));
        if !extract_dir.exists() {
            if let Err(e) = self.archiver.extract(&cache_path, &extract_dir).await {
                self.scope
                    .package_scope(identity.clone())
                    .warning(format!("failed to extract prebuilt '{}': {}", library.name, e));
                return None;
            }
        }

        Some(PreparedLibrary {
            name: library.name.clone(),
            products: library.products.clone(),
            schema,
            extract_dir,
            include_paths: library.include_path.clone(),
            c_modules: library.c_modules.clone(),
        })
    }

    /// Ensure the archive sits in the user cache with the right checksum.
    /// The cache is never trusted blindly: a mismatching entry is
    /// overwritten, a matching one skips the network entirely.
    async fn ensure_cached(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        archive_name: &str,
        checksum: &str,
        cache_path: &Path,
    ) -> bool {
        if cache_path.exists() {
            if let Ok(actual) = sha256_file(cache_path).await {
                if actual == checksum {
                    log::debug!("prebuilt cache hit for {}", archive_name);
                    return true;
                }
            }
        }

        let Some(parent) = cache_path.parent() else {
            return false;
        };
        if std::fs::create_dir_all(parent).is_err() {
            return false;
        }

        let url = format!(
            "{}/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            identity,
            version,
            archive_name
        );
        // Download into a temporary sibling so a failed checksum leaves no
        // partial file behind.
        let staging = parent.join(format!("{}.download", archive_name));
        let status = match self.http.download(&url, &staging).await {
            Ok(status) => status,
            Err(_) => {
                let _ = std::fs::remove_file(&staging);
                return false;
            }
        };
        if !(200..300).contains(&status) {
            let _ = std::fs::remove_file(&staging);
            return false;
        }
        match sha256_file(&staging).await {
            Ok(actual) if actual == checksum => {}
            _ => {
                let _ = std::fs::remove_file(&staging);
                return false;
            }
        }
        if std::fs::rename(&staging, cache_path).is_err() {
            let _ = std::fs::remove_file(&staging);
            return false;
        }
        true
    }

    fn cache_dir(&self, identity: &PackageIdentity, version: &Version) -> PathBuf {
        self.config
            .user_cache_dir
            .join("prebuilts")
            .join(identity.as_str())
            .join(version.to_string())
    }
}

// ---------------------------------------------------------------------------
// Leakage rule
// ---------------------------------------------------------------------------

/// True when prebuilt injections must be globally disabled: some root
/// target that is neither macro- nor test-kind transitively reaches a
/// prebuilt-eligible package through target/product edges. Macro targets
/// form a boundary; a dependency used only behind one does not propagate
/// into the final binary.
pub fn prebuilts_leak_into_products(
    roots: &[Manifest],
    packages: &[(PackageIdentity, Manifest)],
    eligible: &BTreeSet<PackageIdentity>,
) -> bool {
    let all: Vec<(PackageIdentity, &Manifest)> = roots
        .iter()
        .map(|m| (m.identity(), m))
        .chain(packages.iter().map(|(id, m)| (id.clone(), m)))
        .collect();

    let manifest_for = |identity: &PackageIdentity| -> Option<&Manifest> {
        all.iter()
            .find(|(id, _)| id == identity)
            .map(|(_, manifest)| *manifest)
    };
    let owner_of_product = |product: &str| -> Option<PackageIdentity> {
        all.iter()
            .find(|(_, manifest)| manifest.product(product).is_some())
            .map(|(id, _)| id.clone())
    };

    let mut work: Vec<(PackageIdentity, String)> = Vec::new();
    for root in roots {
        for target in &root.targets {
            if !matches!(target.kind, TargetKind::Macro | TargetKind::Test) {
                work.push((root.identity(), target.name.clone()));
            }
        }
    }

    let mut visited: BTreeSet<(PackageIdentity, String)> = BTreeSet::new();
    while let Some((package, target_name)) = work.pop() {
        if !visited.insert((package.clone(), target_name.clone())) {
            continue;
        }
        if eligible.contains(&package) {
            return true;
        }
        let Some(manifest) = manifest_for(&package) else {
            continue;
        };
        let Some(target) = manifest.target(&target_name) else {
            continue;
        };
        // Do not walk into macro targets: they are loaded by the
        // compiler, not linked into the product.
        if matches!(target.kind, TargetKind::Macro) {
            continue;
        }
        for dep in &target.dependencies {
            match dep {
                TargetDependency::Target { name } => {
                    if let Some(next) = manifest.target(name) {
                        if !matches!(next.kind, TargetKind::Macro) {
                            work.push((package.clone(), name.clone()));
                        }
                    }
                }
                TargetDependency::Product { name, package: owner } => {
                    let owner = owner
                        .clone()
                        .or_else(|| owner_of_product(name));
                    let Some(owner) = owner else { continue };
                    if eligible.contains(&owner) {
                        return true;
                    }
                    if let Some(owner_manifest) = manifest_for(&owner) {
                        if let Some(product) = owner_manifest.product(name) {
                            for target in &product.targets {
                                if let Some(t) = owner_manifest.target(target) {
                                    if !matches!(t.kind, TargetKind::Macro) {
                                        work.push((owner.clone(), target.clone()));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    false
}
