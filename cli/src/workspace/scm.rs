//! The source-control capability seam.
//!
//! The lower-level SCM layer (clone, fetch, tag listing, checkout) is an
//! external collaborator. The workspace consumes it through the
//! [`SourceControl`] trait; the production implementation shells out to
//! the `git` binary and keeps bare database clones under the sandbox,
//! while tests inject an in-memory fake.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::workspace::errors::FetchError;
use crate::workspace::identity::PackageIdentity;

pub type ScmResult<T> = std::result::Result<T, FetchError>;

/// How eagerly a container refreshes its local database clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Use the existing clone as-is.
    Never,
    /// Always fetch from the remote.
    Always,
    /// Fetch only when the given revision is not present locally.
    IfNeeded { revision: String },
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Make sure a local database clone for `location` exists and is as
    /// fresh as the strategy demands.
    async fn ensure_fetched(&self, location: &str, strategy: &UpdateStrategy) -> ScmResult<()>;

    /// All tag names of the repository.
    async fn tags(&self, location: &str) -> ScmResult<Vec<String>>;

    /// All branch names of the repository.
    async fn branches(&self, location: &str) -> ScmResult<Vec<String>>;

    /// The tip revision of a branch, or `None` when the branch is unknown.
    async fn resolve_branch(&self, location: &str, branch: &str) -> ScmResult<Option<String>>;

    /// The commit a tag points at, or `None` when the tag is unknown.
    async fn resolve_tag(&self, location: &str, tag: &str) -> ScmResult<Option<String>>;

    /// Whether the repository contains the given revision.
    async fn contains_revision(&self, location: &str, revision: &str) -> ScmResult<bool>;

    /// Materialize a working tree for `revision` at `destination`.
    async fn checkout(
        &self,
        location: &str,
        revision: &str,
        destination: &Path,
    ) -> ScmResult<()>;

    /// Read one file at a revision without materializing a working tree.
    async fn read_file(&self, location: &str, revision: &str, path: &str) -> ScmResult<Vec<u8>>;

    /// Whether a working tree has local modifications.
    async fn has_uncommitted_changes(&self, working_copy: &Path) -> ScmResult<bool>;
}

/// Production implementation backed by the `git` command-line tool. Bare
/// database clones live under `databases_dir`, one per location.
pub struct GitCli {
    databases_dir: PathBuf,
}

impl GitCli {
    pub fn new(databases_dir: PathBuf) -> Self {
        GitCli { databases_dir }
    }

    /// Database path: `<identity>-<first 16 hex of sha256(location)>`, so
    /// two remotes that share a basename do not collide.
    fn database_path(&self, location: &str) -> PathBuf {
        let identity = PackageIdentity::for_location(location);
        let digest = Sha256::digest(location.as_bytes());
        let short = hex::encode_short(&digest);
        self.databases_dir.join(format!("{}-{}", identity, short))
    }

    async fn git(&self, args: &[&str], context: &str) -> ScmResult<String> {
        let output = Command::new("git")
            .args(args)
            .output()
            .await
            .map_err(|e| FetchError::Network {
                url: context.to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(FetchError::Network {
                url: context.to_string(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn git_ok(&self, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn ensure_fetched(&self, location: &str, strategy: &UpdateStrategy) -> ScmResult<()> {
        let db = self.database_path(location);
        let db_str = db.display().to_string();
        if !db.join("HEAD").exists() {
            tokio::fs::create_dir_all(&self.databases_dir)
                .await
                .map_err(|e| FetchError::Network {
                    url: location.to_string(),
                    message: e.to_string(),
                })?;
            self.git(&["clone", "--bare", location, &db_str], location)
                .await?;
            return Ok(());
        }
        let fetch_needed = match strategy {
            UpdateStrategy::Never => false,
            UpdateStrategy::Always => true,
            UpdateStrategy::IfNeeded { revision } => {
                !self.contains_revision(location, revision).await?
            }
        };
        if fetch_needed {
            self.git(
                &["-C", &db_str, "fetch", "--tags", "--force", "origin"],
                location,
            )
            .await?;
        }
        Ok(())
    }

    async fn tags(&self, location: &str) -> ScmResult<Vec<String>> {
        let db = self.database_path(location).display().to_string();
        let out = self.git(&["-C", &db, "tag", "-l"], location).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn branches(&self, location: &str) -> ScmResult<Vec<String>> {
        let db = self.database_path(location).display().to_string();
        let out = self
            .git(
                &[
                    "-C",
                    &db,
                    "for-each-ref",
                    "--format=%(refname:short)",
                    "refs/heads",
                ],
                location,
            )
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn resolve_branch(&self, location: &str, branch: &str) -> ScmResult<Option<String>> {
        let db = self.database_path(location).display().to_string();
        let refname = format!("refs/heads/{}", branch);
        match self.git(&["-C", &db, "rev-parse", &refname], location).await {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn resolve_tag(&self, location: &str, tag: &str) -> ScmResult<Option<String>> {
        let db = self.database_path(location).display().to_string();
        let spec = format!("{}^{{commit}}", tag);
        match self.git(&["-C", &db, "rev-parse", &spec], location).await {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn contains_revision(&self, location: &str, revision: &str) -> ScmResult<bool> {
        let db = self.database_path(location).display().to_string();
        let spec = format!("{}^{{commit}}", revision);
        Ok(self.git_ok(&["-C", &db, "cat-file", "-e", &spec]).await)
    }

    async fn checkout(
        &self,
        location: &str,
        revision: &str,
        destination: &Path,
    ) -> ScmResult<()> {
        let db = self.database_path(location).display().to_string();
        let dest = destination.display().to_string();
        if destination.exists() {
            tokio::fs::remove_dir_all(destination)
                .await
                .map_err(|e| FetchError::CheckoutFailed {
                    identity: PackageIdentity::for_location(location),
                    revision: revision.to_string(),
                    message: e.to_string(),
                })?;
        }
        self.git(&["clone", &db, &dest], location).await?;
        self.git(&["-C", &dest, "checkout", "--detach", revision], location)
            .await
            .map_err(|e| FetchError::CheckoutFailed {
                identity: PackageIdentity::for_location(location),
                revision: revision.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn read_file(&self, location: &str, revision: &str, path: &str) -> ScmResult<Vec<u8>> {
        let db = self.database_path(location).display().to_string();
        let spec = format!("{}:{}", revision, path);
        let out = self.git(&["-C", &db, "show", &spec], location).await?;
        Ok(out.into_bytes())
    }

    async fn has_uncommitted_changes(&self, working_copy: &Path) -> ScmResult<bool> {
        let dir = working_copy.display().to_string();
        let out = self
            .git(&["-C", &dir, "status", "--porcelain"], &dir)
            .await?;
        Ok(!out.trim().is_empty())
    }
}

mod hex {
    pub fn encode_short(digest: &[u8]) -> String {
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory source control for tests: repositories are described as
    //! tag/branch maps plus per-revision file contents.

    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    #[derive(Debug, Default, Clone)]
    pub struct FakeRepository {
        /// tag name -> revision
        pub tags: BTreeMap<String, String>,
        /// branch name -> tip revision
        pub branches: BTreeMap<String, String>,
        /// revision -> (file path -> contents)
        pub files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    }

    impl FakeRepository {
        fn revisions(&self) -> impl Iterator<Item = &String> {
            self.files.keys()
        }
    }

    #[derive(Default)]
    pub struct InMemorySourceControl {
        repositories: Mutex<HashMap<String, FakeRepository>>,
        fetch_count: Mutex<HashMap<String, usize>>,
        dirty_working_copies: Mutex<Vec<PathBuf>>,
    }

    impl InMemorySourceControl {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_repository(&self, location: &str, repo: FakeRepository) {
            self.repositories
                .lock()
                .unwrap()
                .insert(location.to_string(), repo);
        }

        pub fn fetch_count(&self, location: &str) -> usize {
            *self
                .fetch_count
                .lock()
                .unwrap()
                .get(location)
                .unwrap_or(&0)
        }

        pub fn mark_dirty(&self, working_copy: &Path) {
            self.dirty_working_copies
                .lock()
                .unwrap()
                .push(working_copy.to_path_buf());
        }

        fn with_repo<T>(
            &self,
            location: &str,
            f: impl FnOnce(&FakeRepository) -> T,
        ) -> ScmResult<T> {
            let repos = self.repositories.lock().unwrap();
            match repos.get(location) {
                Some(repo) => Ok(f(repo)),
                None => Err(FetchError::Network {
                    url: location.to_string(),
                    message: "unknown repository".to_string(),
                }),
            }
        }
    }

    #[async_trait]
    impl SourceControl for InMemorySourceControl {
        async fn ensure_fetched(
            &self,
            location: &str,
            _strategy: &UpdateStrategy,
        ) -> ScmResult<()> {
            *self
                .fetch_count
                .lock()
                .unwrap()
                .entry(location.to_string())
                .or_insert(0) += 1;
            self.with_repo(location, |_| ())
        }

        async fn tags(&self, location: &str) -> ScmResult<Vec<String>> {
            self.with_repo(location, |r| r.tags.keys().cloned().collect())
        }

        async fn branches(&self, location: &str) -> ScmResult<Vec<String>> {
            self.with_repo(location, |r| r.branches.keys().cloned().collect())
        }

        async fn resolve_branch(
            &self,
            location: &str,
            branch: &str,
        ) -> ScmResult<Option<String>> {
            self.with_repo(location, |r| r.branches.get(branch).cloned())
        }

        async fn resolve_tag(&self, location: &str, tag: &str) -> ScmResult<Option<String>> {
            self.with_repo(location, |r| r.tags.get(tag).cloned())
        }

        async fn contains_revision(&self, location: &str, revision: &str) -> ScmResult<bool> {
            self.with_repo(location, |r| r.revisions().any(|rev| rev == revision))
        }

        async fn checkout(
            &self,
            location: &str,
            revision: &str,
            destination: &Path,
        ) -> ScmResult<()> {
            let files = self.with_repo(location, |r| r.files.get(revision).cloned())?;
            let files = files.ok_or_else(|| FetchError::CheckoutFailed {
                identity: PackageIdentity::for_location(location),
                revision: revision.to_string(),
                message: "unknown revision".to_string(),
            })?;
            tokio::fs::create_dir_all(destination)
                .await
                .map_err(|e| FetchError::Network {
                    url: location.to_string(),
                    message: e.to_string(),
                })?;
            for (path, contents) in files {
                let full = destination.join(&path);
                if let Some(parent) = full.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                tokio::fs::write(&full, &contents)
                    .await
                    .map_err(|e| FetchError::Network {
                        url: location.to_string(),
                        message: e.to_string(),
                    })?;
            }
            Ok(())
        }

        async fn read_file(
            &self,
            location: &str,
            revision: &str,
            path: &str,
        ) -> ScmResult<Vec<u8>> {
            let bytes = self.with_repo(location, |r| {
                r.files
                    .get(revision)
                    .and_then(|files| files.get(path).cloned())
            })?;
            bytes.ok_or_else(|| FetchError::Network {
                url: location.to_string(),
                message: format!("no file {} at {}", path, revision),
            })
        }

        async fn has_uncommitted_changes(&self, working_copy: &Path) -> ScmResult<bool> {
            Ok(self
                .dirty_working_copies
                .lock()
                .unwrap()
                .iter()
                .any(|p| p == working_copy))
        }
    }
}
