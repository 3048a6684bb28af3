//! End-to-end workspace scenarios over in-memory collaborators.
//!
//! Diagnostics are asserted as sets; only resolution events are ordered.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use semver::Version;
use tempfile::TempDir;

use crate::config::WorkspaceConfig;
use crate::workspace::archive::testing::RecordingArchiver;
use crate::workspace::diagnostics::Severity;
use crate::workspace::errors::{ArtifactError, StateError, WorkspaceError};
use crate::workspace::fsops::sha256_hex;
use crate::workspace::http::testing::StaticHttpClient;
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{
    BinarySource, Manifest, PackageDependency, Product, ProductKind, Requirement, Target,
    TargetDependency, TargetKind, ToolsVersion, MANIFEST_FILE_NAME,
};
use crate::workspace::scm::testing::{FakeRepository, InMemorySourceControl};
use crate::workspace::signing::{payload_digest, pem_certificate, TrustDirectoryVerifier};
use crate::workspace::state::{ArtifactSource, ManagedDependencyStore, ManagedState};
use crate::workspace::{Workspace, WorkspaceCapabilities};

const SYNTAX_URL: &str = "https://github.com/apple/swift-syntax";
const PREBUILTS_URL: &str = "https://prebuilts.test";
const PLATFORM: &str = "ubuntu_noble_x86_64";
const ROOT_CERT: &[u8] = b"fixture-root-der";

struct Fixture {
    _dir: TempDir,
    root_dir: PathBuf,
    cache_dir: PathBuf,
    scm: Arc<InMemorySourceControl>,
    http: Arc<StaticHttpClient>,
    archiver: Arc<RecordingArchiver>,
    workspace: Workspace,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let sandbox_root = dir.path().join("sandbox");
        let root_dir = dir.path().join("roots/foo");
        let cache_dir = dir.path().join("user-cache");
        let trust_dir = dir.path().join("trust");
        std::fs::create_dir_all(&sandbox_root).unwrap();
        std::fs::create_dir_all(&root_dir).unwrap();
        std::fs::create_dir_all(&trust_dir).unwrap();
        std::fs::write(trust_dir.join("root.pem"), pem_certificate(ROOT_CERT)).unwrap();

        let mut config = WorkspaceConfig::default();
        config.prebuilts.base_url = Some(PREBUILTS_URL.to_string());
        config.prebuilts.swift_version = Some("6.1".to_string());
        config.prebuilts.host_platform = Some(PLATFORM.to_string());
        config.prebuilts.cache_dir = Some(cache_dir.clone());
        config.prebuilts.trust_dir = Some(trust_dir.clone());

        let scm = Arc::new(InMemorySourceControl::new());
        let http = Arc::new(StaticHttpClient::new());
        let archiver = Arc::new(RecordingArchiver::new());
        let capabilities = WorkspaceCapabilities {
            scm: scm.clone(),
            http: http.clone(),
            archiver: archiver.clone(),
            verifier: Arc::new(TrustDirectoryVerifier::new(trust_dir)),
            loader: None,
        };
        let workspace = Workspace::new(sandbox_root, config, capabilities, Vec::new()).unwrap();

        Fixture {
            _dir: dir,
            root_dir,
            cache_dir,
            scm,
            http,
            archiver,
            workspace,
        }
    }

    fn warnings(&self) -> Vec<String> {
        self.workspace
            .diagnostics()
            .messages_at_least(Severity::Warning)
    }
}

fn manifest_bytes(manifest: &Manifest) -> Vec<u8> {
    serde_json::to_vec(manifest).unwrap()
}

/// A repository whose tags each carry the same manifest (location-correct
/// per revision).
fn repository(versions: &[(&str, &Manifest)]) -> FakeRepository {
    let mut repo = FakeRepository::default();
    for (tag, manifest) in versions {
        let revision = format!("rev-{}", tag);
        repo.tags.insert(tag.to_string(), revision.clone());
        let mut files = BTreeMap::new();
        files.insert(MANIFEST_FILE_NAME.to_string(), manifest_bytes(manifest));
        repo.files.insert(revision, files);
    }
    repo
}

fn syntax_manifest() -> Manifest {
    let mut manifest = Manifest::new("SwiftSyntax", SYNTAX_URL, ToolsVersion::new(5, 9));
    manifest.targets.push(Target::library("SwiftSyntaxMacros"));
    manifest.products.push(Product {
        name: "SwiftSyntaxMacros".into(),
        kind: ProductKind::Library,
        targets: vec!["SwiftSyntaxMacros".into()],
    });
    manifest
}

/// Root package `Foo`: a library, a macro target using swift-syntax, a
/// test target, and a client library. The macro use does not leak.
fn foo_root(fixture: &Fixture, syntax_requirement: Requirement) -> Manifest {
    let mut root = Manifest::new(
        "Foo",
        &fixture.root_dir.display().to_string(),
        ToolsVersion::new(5, 9),
    );
    root.dependencies.push(PackageDependency::source_control(
        SYNTAX_URL,
        syntax_requirement,
    ));
    root.targets.push(
        Target::library("Foo").depending_on([TargetDependency::Target {
            name: "FooMacros".into(),
        }]),
    );
    root.targets.push(
        Target::of_kind("FooMacros", TargetKind::Macro).depending_on([
            TargetDependency::Product {
                name: "SwiftSyntaxMacros".into(),
                package: Some(PackageIdentity::plain("swift-syntax")),
            },
        ]),
    );
    root.targets.push(
        Target::of_kind("FooTests", TargetKind::Test).depending_on([TargetDependency::Target {
            name: "FooMacros".into(),
        }]),
    );
    root.targets.push(
        Target::library("FooClient").depending_on([TargetDependency::Target {
            name: "Foo".into(),
        }]),
    );
    root
}

fn signed_prebuilt_manifest(libraries: serde_json::Value) -> Vec<u8> {
    let manifest = serde_json::json!({ "libraries": libraries });
    let payload = serde_json::to_vec(&manifest).unwrap();
    let envelope = serde_json::json!({
        "manifest": manifest,
        "signature": {
            "bytes": payload_digest(&payload),
            "certChain": [
                BASE64.encode(b"fixture-leaf-der"),
                BASE64.encode(ROOT_CERT),
            ],
            "signingEntity": "release-signing",
        },
    });
    serde_json::to_vec(&envelope).unwrap()
}

fn route_prebuilt(fixture: &Fixture, version: &str, archive: &[u8]) -> String {
    let manifest_url = format!(
        "{}/swift-syntax/{}/6.1-manifest.json",
        PREBUILTS_URL, version
    );
    let archive_url = format!(
        "{}/swift-syntax/{}/6.1-MacroSupport-{}.zip",
        PREBUILTS_URL, version, PLATFORM
    );
    fixture.http.route(
        &manifest_url,
        signed_prebuilt_manifest(serde_json::json!([{
            "name": "MacroSupport",
            "products": ["SwiftSyntaxMacros"],
            "cModules": ["_SwiftSyntaxCShims"],
            "artifacts": [{ "platform": PLATFORM, "checksum": sha256_hex(archive) }],
        }])),
    );
    fixture.http.route(&archive_url, archive.to_vec());
    archive_url
}

// ---------------------------------------------------------------------------
// Prebuilt scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prebuilt_happy_path_injects_macro_and_test_targets() {
    let fixture = Fixture::new();
    fixture.scm.add_repository(
        SYNTAX_URL,
        repository(&[("600.0.1", &syntax_manifest())]),
    );
    let archive = b"macro-support-archive";
    route_prebuilt(&fixture, "600.0.1", archive);

    let root = foo_root(
        &fixture,
        Requirement::Exact(Version::parse("600.0.1").unwrap()),
    );
    let graph = fixture.workspace.resolve(&[root]).await.unwrap();

    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    let expected_dir = fixture
        .workspace
        .sandbox()
        .prebuilts_dir()
        .join("swift-syntax/600.0.1")
        .join(format!("6.1-MacroSupport-{}", PLATFORM));

    for name in ["FooMacros", "FooTests"] {
        let module = foo.module(name).unwrap();
        assert!(
            module
                .build_settings
                .other_swift_flags
                .contains(&format!("-I{}", expected_dir.join("Modules").display())),
            "{} should receive include flags",
            name
        );
        assert!(module.build_settings.other_ldflags.contains(
            &expected_dir
                .join("lib")
                .join("libMacroSupport.a")
                .display()
                .to_string()
        ));
    }
    for name in ["Foo", "FooClient"] {
        assert!(
            foo.module(name).unwrap().build_settings.is_empty(),
            "{} must not receive injections",
            name
        );
    }
    assert_eq!(fixture.archiver.extraction_count(), 1);

    let stats = fixture.workspace.cache_statistics();
    assert_eq!(stats.prebuilts.entries, 1);
    assert!(!stats.is_empty());
}

#[tokio::test]
async fn version_change_disables_then_reenables_from_cache() {
    let fixture = Fixture::new();
    let syntax = syntax_manifest();
    fixture.scm.add_repository(
        SYNTAX_URL,
        repository(&[("600.0.1", &syntax), ("601.0.0", &syntax)]),
    );
    let archive = b"macro-support-archive";
    let archive_url = route_prebuilt(&fixture, "600.0.1", archive);

    // First run at 600.0.1 downloads and injects.
    let graph = fixture
        .workspace
        .resolve(&[foo_root(
            &fixture,
            Requirement::Exact(Version::parse("600.0.1").unwrap()),
        )])
        .await
        .unwrap();
    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    assert!(!foo.module("FooMacros").unwrap().build_settings.is_empty());
    assert_eq!(fixture.http.request_count(&archive_url), 1);

    // 601.0.0 has no published prebuilt: the graph is still produced,
    // without injections.
    let graph = fixture
        .workspace
        .resolve(&[foo_root(
            &fixture,
            Requirement::Exact(Version::parse("601.0.0").unwrap()),
        )])
        .await
        .unwrap();
    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    assert!(foo.module("FooMacros").unwrap().build_settings.is_empty());

    // Reverting re-enables from the cache with no second download.
    let graph = fixture
        .workspace
        .resolve(&[foo_root(
            &fixture,
            Requirement::Exact(Version::parse("600.0.1").unwrap()),
        )])
        .await
        .unwrap();
    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    assert!(!foo.module("FooMacros").unwrap().build_settings.is_empty());
    assert_eq!(fixture.http.request_count(&archive_url), 1);
}

#[tokio::test]
async fn missing_host_platform_is_silent() {
    let fixture = Fixture::new();
    fixture.scm.add_repository(
        SYNTAX_URL,
        repository(&[("600.0.1", &syntax_manifest())]),
    );
    let archive = b"macro-support-archive";
    fixture.http.route(
        &format!("{}/swift-syntax/600.0.1/6.1-manifest.json", PREBUILTS_URL),
        signed_prebuilt_manifest(serde_json::json!([{
            "name": "MacroSupport",
            "products": ["SwiftSyntaxMacros"],
            "cModules": [],
            "artifacts": [{ "platform": "macos_universal", "checksum": sha256_hex(archive) }],
        }])),
    );

    let graph = fixture
        .workspace
        .resolve(&[foo_root(
            &fixture,
            Requirement::Exact(Version::parse("600.0.1").unwrap()),
        )])
        .await
        .unwrap();

    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    assert!(foo.module("FooMacros").unwrap().build_settings.is_empty());
    assert!(fixture.warnings().is_empty());
}

#[tokio::test]
async fn tampered_manifest_warns_and_skips_download() {
    let fixture = Fixture::new();
    fixture.scm.add_repository(
        SYNTAX_URL,
        repository(&[("600.0.1", &syntax_manifest())]),
    );

    // Sign one manifest, then serve a tampered body under the same
    // signature.
    let genuine = serde_json::json!({ "libraries": [{
        "name": "MacroSupport",
        "products": ["SwiftSyntaxMacros"],
        "cModules": [],
        "artifacts": [{ "platform": PLATFORM, "checksum": "0".repeat(64) }],
    }]});
    let payload = serde_json::to_vec(&genuine).unwrap();
    let mut tampered = genuine.clone();
    tampered["libraries"][0]["artifacts"][0]["checksum"] = serde_json::json!("BAD");
    let envelope = serde_json::json!({
        "manifest": tampered,
        "signature": {
            "bytes": payload_digest(&payload),
            "certChain": [BASE64.encode(ROOT_CERT)],
            "signingEntity": "release-signing",
        },
    });
    fixture.http.route(
        &format!("{}/swift-syntax/600.0.1/6.1-manifest.json", PREBUILTS_URL),
        serde_json::to_vec(&envelope).unwrap(),
    );

    let graph = fixture
        .workspace
        .resolve(&[foo_root(
            &fixture,
            Requirement::Exact(Version::parse("600.0.1").unwrap()),
        )])
        .await
        .unwrap();

    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    assert!(foo.module("FooMacros").unwrap().build_settings.is_empty());
    assert!(fixture
        .warnings()
        .iter()
        .any(|w| w == "Failed to decode prebuilt manifest: invalidSignature"));
    // Only the two manifest templates were tried; no archive request.
    let archive_url = format!(
        "{}/swift-syntax/600.0.1/6.1-MacroSupport-{}.zip",
        PREBUILTS_URL, PLATFORM
    );
    assert_eq!(fixture.http.request_count(&archive_url), 0);
}

#[tokio::test]
async fn bad_archive_checksum_is_silent_and_not_cached() {
    let fixture = Fixture::new();
    fixture.scm.add_repository(
        SYNTAX_URL,
        repository(&[("600.0.1", &syntax_manifest())]),
    );
    fixture.http.route(
        &format!("{}/swift-syntax/600.0.1/6.1-manifest.json", PREBUILTS_URL),
        signed_prebuilt_manifest(serde_json::json!([{
            "name": "MacroSupport",
            "products": ["SwiftSyntaxMacros"],
            "cModules": [],
            "artifacts": [{ "platform": PLATFORM, "checksum": "1".repeat(64) }],
        }])),
    );
    fixture.http.route(
        &format!(
            "{}/swift-syntax/600.0.1/6.1-MacroSupport-{}.zip",
            PREBUILTS_URL, PLATFORM
        ),
        b"different bytes".to_vec(),
    );

    let graph = fixture
        .workspace
        .resolve(&[foo_root(
            &fixture,
            Requirement::Exact(Version::parse("600.0.1").unwrap()),
        )])
        .await
        .unwrap();

    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    assert!(foo.module("FooMacros").unwrap().build_settings.is_empty());
    assert_eq!(fixture.archiver.extraction_count(), 0);

    let cache_file = fixture
        .cache_dir
        .join("prebuilts/swift-syntax/600.0.1")
        .join(format!("6.1-MacroSupport-{}.zip", PLATFORM));
    assert!(!cache_file.exists(), "mismatching archive must not be promoted");
}

#[tokio::test]
async fn leaky_library_disables_all_injections() {
    let fixture = Fixture::new();
    fixture.scm.add_repository(
        SYNTAX_URL,
        repository(&[("600.0.1", &syntax_manifest())]),
    );
    let intermediate_url = "https://github.com/x/intermediate";
    let mut intermediate = Manifest::new("Intermediate", intermediate_url, ToolsVersion::new(5, 9));
    intermediate.dependencies.push(PackageDependency::source_control(
        SYNTAX_URL,
        Requirement::up_to_next_major(Version::parse("600.0.0").unwrap()),
    ));
    intermediate.targets.push(
        Target::library("Intermediate").depending_on([TargetDependency::Product {
            name: "SwiftSyntaxMacros".into(),
            package: Some(PackageIdentity::plain("swift-syntax")),
        }]),
    );
    intermediate.products.push(Product {
        name: "Intermediate".into(),
        kind: ProductKind::Library,
        targets: vec!["Intermediate".into()],
    });
    fixture
        .scm
        .add_repository(intermediate_url, repository(&[("1.0.0", &intermediate)]));

    let archive = b"macro-support-archive";
    route_prebuilt(&fixture, "600.0.1", archive);

    // FooMacros goes through Intermediate; FooClient also exposes
    // Intermediate through a plain library path.
    let mut root = Manifest::new(
        "Foo",
        &fixture.root_dir.display().to_string(),
        ToolsVersion::new(5, 9),
    );
    root.dependencies.push(PackageDependency::source_control(
        SYNTAX_URL,
        Requirement::Exact(Version::parse("600.0.1").unwrap()),
    ));
    root.dependencies.push(PackageDependency::source_control(
        intermediate_url,
        Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
    ));
    root.targets.push(
        Target::of_kind("FooMacros", TargetKind::Macro).depending_on([
            TargetDependency::Product {
                name: "Intermediate".into(),
                package: Some(PackageIdentity::plain("intermediate")),
            },
        ]),
    );
    root.targets.push(
        Target::library("FooClient").depending_on([TargetDependency::Product {
            name: "Intermediate".into(),
            package: Some(PackageIdentity::plain("intermediate")),
        }]),
    );

    let graph = fixture.workspace.resolve(&[root]).await.unwrap();
    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    for module in &foo.modules {
        assert!(
            module.build_settings.is_empty(),
            "leakage must disable injections for '{}'",
            module.name
        );
    }
}

// ---------------------------------------------------------------------------
// Binary target scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_binary_target_binds_in_place() {
    let fixture = Fixture::new();
    let artifact = fixture.root_dir.join("A4.xcframework");
    std::fs::write(&artifact, b"framework bytes").unwrap();

    let mut root = Manifest::new(
        "Foo",
        &fixture.root_dir.display().to_string(),
        ToolsVersion::new(5, 9),
    );
    let mut target = Target::of_kind("A4", TargetKind::Binary);
    target.binary = Some(BinarySource::Local {
        path: PathBuf::from("A4.xcframework"),
    });
    root.targets.push(target);

    let graph = fixture.workspace.resolve(&[root]).await.unwrap();
    let foo = graph.package(&PackageIdentity::plain("foo")).unwrap();
    assert_eq!(foo.module("A4").unwrap().artifact.as_ref().unwrap(), &artifact);
    assert_eq!(fixture.http.total_requests(), 0);

    let state =
        ManagedDependencyStore::load(&fixture.workspace.sandbox().state_file()).unwrap();
    let managed = state
        .artifact(&PackageIdentity::plain("foo"), "A4")
        .unwrap();
    assert!(matches!(managed.source, ArtifactSource::Local { .. }));
}

#[tokio::test]
async fn remote_binary_checksum_change_purges_and_refetches() {
    let fixture = Fixture::new();
    let url = "https://artifacts.test/A4.zip";
    let body = b"artifact body v1".to_vec();
    fixture.http.route(url, body.clone());

    let make_root = |checksum: String| {
        let mut root = Manifest::new(
            "Foo",
            &fixture.root_dir.display().to_string(),
            ToolsVersion::new(5, 9),
        );
        let mut target = Target::of_kind("A4", TargetKind::Binary);
        target.binary = Some(BinarySource::Remote {
            url: url.to_string(),
            checksum,
        });
        root.targets.push(target);
        root
    };

    // First resolution succeeds against the matching checksum.
    fixture
        .workspace
        .resolve(&[make_root(sha256_hex(&body))])
        .await
        .unwrap();
    assert_eq!(fixture.http.request_count(url), 1);

    // A second resolution with the same checksum reuses the cache.
    fixture
        .workspace
        .resolve(&[make_root(sha256_hex(&body))])
        .await
        .unwrap();
    assert_eq!(fixture.http.request_count(url), 1);

    // The manifest now declares a different checksum under the same URL:
    // the cached artifact is purged, a fresh download happens, and the
    // persistent mismatch aborts the graph build.
    let err = fixture
        .workspace
        .resolve(&[make_root("2".repeat(64))])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkspaceError::Artifact(ArtifactError::ChecksumMismatch { .. })
    ));
    assert_eq!(fixture.http.request_count(url), 2);
}

// ---------------------------------------------------------------------------
// Resolution and lifecycle
// ---------------------------------------------------------------------------

fn bar_package(url: &str, versions: &[&str]) -> (String, Manifest, FakeRepository) {
    let mut manifest = Manifest::new("Bar", url, ToolsVersion::new(5, 9));
    manifest.targets.push(Target::library("Bar"));
    manifest.products.push(Product {
        name: "Bar".into(),
        kind: ProductKind::Library,
        targets: vec!["Bar".into()],
    });
    let pairs: Vec<(&str, &Manifest)> = versions.iter().map(|v| (*v, &manifest)).collect();
    let repo = repository(&pairs);
    (url.to_string(), manifest.clone(), repo)
}

fn root_depending_on_bar(fixture: &Fixture, url: &str, requirement: Requirement) -> Manifest {
    let mut root = Manifest::new(
        "App",
        &fixture.root_dir.display().to_string(),
        ToolsVersion::new(5, 9),
    );
    root.dependencies
        .push(PackageDependency::source_control(url, requirement));
    root.targets.push(
        Target::library("App").depending_on([TargetDependency::Product {
            name: "Bar".into(),
            package: Some(PackageIdentity::plain("bar")),
        }]),
    );
    root
}

#[tokio::test]
async fn resolution_is_deterministic_and_pins_bias() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0", "1.1.0", "1.2.0"]);
    fixture.scm.add_repository(url, repo);

    let requirement = Requirement::up_to_next_major(Version::parse("1.0.0").unwrap());
    fixture
        .workspace
        .resolve(&[root_depending_on_bar(&fixture, url, requirement.clone())])
        .await
        .unwrap();
    let first = std::fs::read_to_string(fixture.workspace.sandbox().pins_file()).unwrap();
    assert!(first.contains("1.2.0"));

    fixture
        .workspace
        .resolve(&[root_depending_on_bar(&fixture, url, requirement)])
        .await
        .unwrap();
    let second = std::fs::read_to_string(fixture.workspace.sandbox().pins_file()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0"]);
    fixture.scm.add_repository(url, repo);

    let root = || {
        root_depending_on_bar(
            &fixture,
            url,
            Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
        )
    };
    fixture.workspace.resolve(&[root()]).await.unwrap();
    let state_file = fixture.workspace.sandbox().state_file();
    let first_state = std::fs::read_to_string(&state_file).unwrap();
    let checkout = fixture
        .workspace
        .sandbox()
        .checkout_path(&PackageIdentity::plain("bar"));
    assert!(checkout.join(MANIFEST_FILE_NAME).exists());

    fixture.workspace.resolve(&[root()]).await.unwrap();
    let second_state = std::fs::read_to_string(&state_file).unwrap();
    assert_eq!(first_state, second_state);
    assert!(fixture.warnings().is_empty());
}

#[tokio::test]
async fn update_drops_stray_pins_and_removes_checkouts() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0"]);
    fixture.scm.add_repository(url, repo);

    fixture
        .workspace
        .resolve(&[root_depending_on_bar(
            &fixture,
            url,
            Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
        )])
        .await
        .unwrap();
    assert!(fixture
        .workspace
        .sandbox()
        .checkout_path(&PackageIdentity::plain("bar"))
        .exists());

    // A root that no longer references bar: update drops the pin and the
    // checkout.
    let bare_root = Manifest::new(
        "App",
        &fixture.root_dir.display().to_string(),
        ToolsVersion::new(5, 9),
    );
    fixture.workspace.update(&[bare_root]).await.unwrap();

    let pins = std::fs::read_to_string(fixture.workspace.sandbox().pins_file()).unwrap();
    assert!(!pins.contains("\"bar\""));
    assert!(!fixture
        .workspace
        .sandbox()
        .checkout_path(&PackageIdentity::plain("bar"))
        .exists());
}

#[tokio::test]
async fn update_dry_run_previews_without_mutation() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0", "1.1.0"]);
    fixture.scm.add_repository(url, repo);
    let requirement = Requirement::up_to_next_major(Version::parse("1.0.0").unwrap());

    fixture
        .workspace
        .resolve(&[root_depending_on_bar(&fixture, url, requirement.clone())])
        .await
        .unwrap();
    let pins_before = std::fs::read_to_string(fixture.workspace.sandbox().pins_file()).unwrap();
    let state_before = std::fs::read_to_string(fixture.workspace.sandbox().state_file()).unwrap();
    assert!(pins_before.contains("1.1.0"));

    // A newer release appears; the dry run reports the motion but
    // touches nothing.
    let (_, _, repo) = bar_package(url, &["1.0.0", "1.1.0", "1.2.0"]);
    fixture.scm.add_repository(url, repo);

    let changes = fixture
        .workspace
        .update_dry_run(&[root_depending_on_bar(&fixture, url, requirement)])
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].identity, PackageIdentity::plain("bar"));
    let rendered = changes[0].to_string();
    assert!(rendered.contains("1.1.0") && rendered.contains("1.2.0"));

    assert_eq!(
        std::fs::read_to_string(fixture.workspace.sandbox().pins_file()).unwrap(),
        pins_before
    );
    assert_eq!(
        std::fs::read_to_string(fixture.workspace.sandbox().state_file()).unwrap(),
        state_before
    );
}

#[tokio::test]
async fn update_moves_to_newest_satisfying_version() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0", "1.1.0"]);
    fixture.scm.add_repository(url, repo);
    let requirement = Requirement::up_to_next_major(Version::parse("1.0.0").unwrap());

    fixture
        .workspace
        .resolve(&[root_depending_on_bar(&fixture, url, requirement.clone())])
        .await
        .unwrap();
    // Pin lands on 1.1.0; re-tag a newer release and update past it.
    let (_, _, repo) = bar_package(url, &["1.0.0", "1.1.0", "1.2.0"]);
    fixture.scm.add_repository(url, repo);

    fixture
        .workspace
        .update(&[root_depending_on_bar(&fixture, url, requirement)])
        .await
        .unwrap();
    let pins = std::fs::read_to_string(fixture.workspace.sandbox().pins_file()).unwrap();
    assert!(pins.contains("1.2.0"));
}

#[tokio::test]
async fn edit_freezes_and_unedit_restores() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0", "1.1.0"]);
    fixture.scm.add_repository(url, repo);
    let bar = PackageIdentity::plain("bar");

    let root = || {
        root_depending_on_bar(
            &fixture,
            url,
            Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
        )
    };
    fixture.workspace.resolve(&[root()]).await.unwrap();

    fixture.workspace.edit(&bar, None).await.unwrap();
    let edit_dir = fixture.workspace.sandbox().edit_path(&bar);
    assert!(edit_dir.join(MANIFEST_FILE_NAME).exists());

    // Editing twice is an error.
    assert!(matches!(
        fixture.workspace.edit(&bar, None).await.unwrap_err(),
        WorkspaceError::State(StateError::DependencyAlreadyInEditMode { .. })
    ));

    // While edited, resolution leaves the dependency frozen.
    fixture.workspace.resolve(&[root()]).await.unwrap();
    let state = ManagedDependencyStore::load(&fixture.workspace.sandbox().state_file()).unwrap();
    assert!(state.dependency(&bar).unwrap().state.is_edited());

    // Dirty edits block unedit unless forced.
    fixture.scm.mark_dirty(&edit_dir);
    assert!(matches!(
        fixture.workspace.unedit(&bar, false).await.unwrap_err(),
        WorkspaceError::State(StateError::UncommittedChangesInEdit { .. })
    ));
    fixture.workspace.unedit(&bar, true).await.unwrap();

    let state = ManagedDependencyStore::load(&fixture.workspace.sandbox().state_file()).unwrap();
    assert!(matches!(
        state.dependency(&bar).unwrap().state,
        ManagedState::Checkout { .. }
    ));
    assert!(!edit_dir.exists());
}

#[tokio::test]
async fn deleted_edit_directory_recovers_with_warning() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0"]);
    fixture.scm.add_repository(url, repo);
    let bar = PackageIdentity::plain("bar");

    let root = || {
        root_depending_on_bar(
            &fixture,
            url,
            Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
        )
    };
    fixture.workspace.resolve(&[root()]).await.unwrap();
    fixture.workspace.edit(&bar, None).await.unwrap();

    let edit_dir = fixture.workspace.sandbox().edit_path(&bar);
    std::fs::remove_dir_all(&edit_dir).unwrap();

    fixture.workspace.resolve(&[root()]).await.unwrap();
    let state = ManagedDependencyStore::load(&fixture.workspace.sandbox().state_file()).unwrap();
    assert!(matches!(
        state.dependency(&bar).unwrap().state,
        ManagedState::Checkout { .. }
    ));
    assert!(fixture
        .warnings()
        .iter()
        .any(|w| w.contains("edit directory") && w.contains("deleted")));
}

#[tokio::test]
async fn reset_drops_pins_state_and_checkouts() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";
    let (_, _, repo) = bar_package(url, &["1.0.0"]);
    fixture.scm.add_repository(url, repo);

    fixture
        .workspace
        .resolve(&[root_depending_on_bar(
            &fixture,
            url,
            Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
        )])
        .await
        .unwrap();
    fixture.workspace.reset().await.unwrap();

    let sandbox = fixture.workspace.sandbox();
    assert!(!sandbox.pins_file().exists());
    assert!(!sandbox.state_file().exists());
    assert!(!sandbox.checkouts_dir().exists());
}

#[tokio::test]
async fn root_shadows_remote_copy_of_itself() {
    let fixture = Fixture::new();
    let url = "https://github.com/x/bar";

    // bar depends on app remotely, but app is the root package. The
    // remote repository for app is intentionally not registered: fetching
    // it would fail the resolution.
    let app_url = "https://github.com/x/app";
    // An old-tools manifest: every declared dependency contributes
    // constraints regardless of target usage.
    let mut bar = Manifest::new("Bar", url, ToolsVersion::new(5, 1));
    bar.dependencies.push(PackageDependency::source_control(
        app_url,
        Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
    ));
    bar.targets.push(Target::library("Bar"));
    bar.products.push(Product {
        name: "Bar".into(),
        kind: ProductKind::Library,
        targets: vec!["Bar".into()],
    });
    fixture.scm.add_repository(url, repository(&[("1.0.0", &bar)]));

    let app_dir = fixture.root_dir.parent().unwrap().join("app");
    std::fs::create_dir_all(&app_dir).unwrap();
    let mut root = Manifest::new("App", &app_dir.display().to_string(), ToolsVersion::new(5, 9));
    root.dependencies.push(PackageDependency::source_control(
        url,
        Requirement::up_to_next_major(Version::parse("1.0.0").unwrap()),
    ));
    root.targets.push(
        Target::library("App").depending_on([TargetDependency::Product {
            name: "Bar".into(),
            package: Some(PackageIdentity::plain("bar")),
        }]),
    );
    root.products.push(Product {
        name: "App".into(),
        kind: ProductKind::Library,
        targets: vec!["App".into()],
    });

    let graph = fixture.workspace.resolve(&[root]).await.unwrap();
    assert_eq!(
        graph.package(&PackageIdentity::plain("app")).unwrap().state,
        crate::workspace::graph::PackageState::Root
    );
    assert!(graph.package(&PackageIdentity::plain("bar")).is_some());
}
