//! Binary-target acquisition.
//!
//! Every `binary` target in any reachable manifest is bound to an
//! artifact on disk: local declarations are validated and bound in place,
//! remote declarations are downloaded into the sandbox artifact cache,
//! checksum-verified, and extracted. Checksum mismatches are hard errors;
//! a checksum that changed under a stable URL purges the old artifact and
//! refetches with a diagnostic.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::workspace::archive::Archiver;
use crate::workspace::diagnostics::DiagnosticsScope;
use crate::workspace::errors::{ArtifactError, FetchError, Result, WorkspaceError};
use crate::workspace::fsops::{sha256_file, Sandbox};
use crate::workspace::http::HttpClient;
use crate::workspace::identity::PackageIdentity;
use crate::workspace::manifest::{BinarySource, Manifest, TargetKind};
use crate::workspace::state::{ArtifactSource, ManagedArtifact, ManagedDependencyStore};

const EXPECTED_EXTENSIONS: &[&str] = &["zip", "xcframework", "artifactbundle"];

/// A package whose manifest may declare binary targets, with the
/// directory its relative paths anchor at.
pub struct ArtifactHost<'a> {
    pub identity: PackageIdentity,
    pub manifest: &'a Manifest,
    pub directory: PathBuf,
}

pub struct BinaryArtifactsManager {
    http: Arc<dyn HttpClient>,
    archiver: Arc<dyn Archiver>,
    sandbox: Sandbox,
    scope: DiagnosticsScope,
}

impl BinaryArtifactsManager {
    pub fn new(
        http: Arc<dyn HttpClient>,
        archiver: Arc<dyn Archiver>,
        sandbox: Sandbox,
        scope: DiagnosticsScope,
    ) -> Self {
        BinaryArtifactsManager {
            http,
            archiver,
            sandbox,
            scope,
        }
    }

    /// Bind every binary target of the given packages, updating the
    /// managed-artifact map as we go and pruning entries whose targets
    /// disappeared.
    pub async fn bind_all(
        &self,
        hosts: &[ArtifactHost<'_>],
        store: &mut ManagedDependencyStore,
    ) -> Result<Vec<ManagedArtifact>> {
        let mut bound = Vec::new();
        let mut live = BTreeSet::new();

        for host in hosts {
            for target in &host.manifest.targets {
                if target.kind != TargetKind::Binary {
                    continue;
                }
                let Some(source) = &target.binary else {
                    continue;
                };
                let artifact = match source {
                    BinarySource::Local { path } => {
                        self.bind_local(&host.identity, &target.name, &host.directory, path)?
                    }
                    BinarySource::Remote { url, checksum } => {
                        self.bind_remote(&host.identity, &target.name, url, checksum, store)
                            .await?
                    }
                };
                live.insert(ManagedArtifact::key(&artifact.identity, &artifact.target_name));
                store.add_artifact(artifact.clone());
                store.save()?;
                bound.push(artifact);
            }
        }

        store.retain_artifacts(&live);
        store.save()?;
        Ok(bound)
    }

    /// A local declaration binds the absolute path as-is after shape
    /// checks; nothing is copied or downloaded.
    fn bind_local(
        &self,
        identity: &PackageIdentity,
        target_name: &str,
        package_dir: &Path,
        declared: &Path,
    ) -> Result<ManagedArtifact> {
        let absolute = if declared.is_absolute() {
            declared.to_path_buf()
        } else {
            package_dir.join(declared)
        };
        let extension_ok = absolute
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| EXPECTED_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !absolute.exists() || !extension_ok {
            self.scope.package_scope(identity.clone()).error(format!(
                "binary target '{}' points at an unexpected artifact: {}",
                target_name,
                absolute.display()
            ));
            return Err(WorkspaceError::Artifact(
                ArtifactError::UnexpectedArtifactType {
                    target: target_name.to_string(),
                    path: absolute,
                },
            ));
        }
        Ok(ManagedArtifact {
            identity: identity.clone(),
            target_name: target_name.to_string(),
            source: ArtifactSource::Local {
                path: absolute.clone(),
            },
            path: absolute,
        })
    }

    async fn bind_remote(
        &self,
        identity: &PackageIdentity,
        target_name: &str,
        url: &str,
        checksum: &str,
        store: &ManagedDependencyStore,
    ) -> Result<ManagedArtifact> {
        let extension = url.rsplit('.').next().unwrap_or("zip");
        let archive_name = format!("{}.{}", target_name, extension);
        let archive_dir = self.sandbox.artifacts_dir().join(identity.as_str());
        let archive_path = archive_dir.join(&archive_name);
        let extract_dir = archive_dir.join(target_name);

        // Detect a checksum change under a stable URL: the previous
        // artifact is purged before refetching.
        if let Some(previous) = store.artifact(identity, target_name) {
            if let ArtifactSource::Remote {
                url: old_url,
                checksum: old_checksum,
                ..
            } = &previous.source
            {
                if old_url == url && old_checksum != checksum {
                    self.scope.package_scope(identity.clone()).warning(format!(
                        "checksum of binary target '{}' changed; discarding cached artifact",
                        target_name
                    ));
                    let _ = tokio::fs::remove_file(&archive_path).await;
                    let _ = tokio::fs::remove_dir_all(&extract_dir).await;
                }
            }
        }

        let cached = archive_path.exists()
            && sha256_file(&archive_path).await.ok().as_deref() == Some(checksum);
        if !cached {
            tokio::fs::create_dir_all(&archive_dir)
                .await
                .map_err(|e| WorkspaceError::io(archive_dir.display().to_string(), e))?;
            let staging = archive_dir.join(format!("{}.download", archive_name));
            let status = self.http.download(url, &staging).await?;
            if !(200..300).contains(&status) {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(WorkspaceError::Fetch(FetchError::Failed {
                    url: url.to_string(),
                    status,
                }));
            }
            let actual = sha256_file(&staging).await?;
            if actual != checksum {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(WorkspaceError::Artifact(ArtifactError::ChecksumMismatch {
                    target: target_name.to_string(),
                    expected: checksum.to_string(),
                    actual,
                }));
            }
            tokio::fs::rename(&staging, &archive_path)
                .await
                .map_err(|e| WorkspaceError::io(archive_path.display().to_string(), e))?;
            let _ = tokio::fs::remove_dir_all(&extract_dir).await;
        }

        if !extract_dir.exists() {
            self.archiver
                .extract(&archive_path, &extract_dir)
                .await
                .map_err(|e| match e {
                    ArtifactError::ExtractionFailed { message, .. } => {
                        WorkspaceError::Artifact(ArtifactError::ExtractionFailed {
                            target: target_name.to_string(),
                            message,
                        })
                    }
                    other => WorkspaceError::Artifact(other),
                })?;
        }

        Ok(ManagedArtifact {
            identity: identity.clone(),
            target_name: target_name.to_string(),
            source: ArtifactSource::Remote {
                url: url.to_string(),
                checksum: checksum.to_string(),
                subpath: PathBuf::from(identity.as_str()).join(&archive_name),
            },
            path: extract_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::archive::testing::RecordingArchiver;
    use crate::workspace::diagnostics::DiagnosticsSink;
    use crate::workspace::fsops::sha256_hex;
    use crate::workspace::http::testing::StaticHttpClient;
    use crate::workspace::manifest::{Target, TargetKind, ToolsVersion};
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        http: Arc<StaticHttpClient>,
        manager: BinaryArtifactsManager,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let http = Arc::new(StaticHttpClient::new());
        let manager = BinaryArtifactsManager::new(
            http.clone(),
            Arc::new(RecordingArchiver::new()),
            Sandbox::new(dir.path().to_path_buf()),
            DiagnosticsSink::new().root_scope(),
        );
        Harness { dir, http, manager }
    }

    fn manifest_with_binary(source: BinarySource) -> Manifest {
        let mut manifest = Manifest::new("Host", "/pkgs/host", ToolsVersion::new(5, 9));
        let mut target = Target::of_kind("A4", TargetKind::Binary);
        target.binary = Some(source);
        manifest.targets.push(target);
        manifest
    }

    #[tokio::test]
    async fn local_artifact_with_wrong_extension_is_rejected() {
        let h = harness();
        let declared = h.dir.path().join("A4.tar.gz.backup");
        std::fs::write(&declared, b"whatever").unwrap();
        let manifest = manifest_with_binary(BinarySource::Local {
            path: declared.clone(),
        });

        let mut store =
            ManagedDependencyStore::load(&h.dir.path().join(".workspace-state.json")).unwrap();
        let hosts = [ArtifactHost {
            identity: PackageIdentity::plain("host"),
            manifest: &manifest,
            directory: h.dir.path().to_path_buf(),
        }];
        let err = h.manager.bind_all(&hosts, &mut store).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::Artifact(ArtifactError::UnexpectedArtifactType { .. })
        ));
    }

    #[tokio::test]
    async fn remote_artifact_downloads_once_and_reuses_cache() {
        let h = harness();
        let body = b"archive contents".to_vec();
        let url = "https://artifacts.test/A4.zip";
        h.http.route(url, body.clone());
        let manifest = manifest_with_binary(BinarySource::Remote {
            url: url.to_string(),
            checksum: sha256_hex(&body),
        });

        let mut store =
            ManagedDependencyStore::load(&h.dir.path().join(".workspace-state.json")).unwrap();
        let hosts = [ArtifactHost {
            identity: PackageIdentity::plain("host"),
            manifest: &manifest,
            directory: h.dir.path().to_path_buf(),
        }];

        let bound = h.manager.bind_all(&hosts, &mut store).await.unwrap();
        assert_eq!(bound.len(), 1);
        assert!(bound[0].path.exists());

        let again = h.manager.bind_all(&hosts, &mut store).await.unwrap();
        assert_eq!(again, bound);
        assert_eq!(h.http.request_count(url), 1);
    }

    #[tokio::test]
    async fn stale_artifacts_are_pruned_from_the_store() {
        let h = harness();
        let declared = h.dir.path().join("A4.xcframework");
        std::fs::write(&declared, b"framework").unwrap();
        let manifest = manifest_with_binary(BinarySource::Local {
            path: declared.clone(),
        });

        let mut store =
            ManagedDependencyStore::load(&h.dir.path().join(".workspace-state.json")).unwrap();
        let hosts = [ArtifactHost {
            identity: PackageIdentity::plain("host"),
            manifest: &manifest,
            directory: h.dir.path().to_path_buf(),
        }];
        h.manager.bind_all(&hosts, &mut store).await.unwrap();
        assert!(store.artifact(&PackageIdentity::plain("host"), "A4").is_some());

        // The target disappeared; binding with no hosts prunes the entry.
        h.manager.bind_all(&[], &mut store).await.unwrap();
        assert!(store.artifact(&PackageIdentity::plain("host"), "A4").is_none());
    }
}
