//! Sandbox layout and atomic file operations.

use std::path::{Path, PathBuf};

use crate::workspace::errors::{StateError, WorkspaceError};
use crate::workspace::identity::PackageIdentity;

/// The per-invocation directory tree under which all derived state lives.
///
/// ```text
/// <root>/
///   .build/
///     checkouts/<identity>/
///     edits/<identity>/
///     artifacts/<identity>/<target>.<ext>
///     prebuilts/<identity>/<version>/...
///     repositories/            bare SCM databases
///   Package.resolved
///   .workspace-state.json
/// ```
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: PathBuf) -> Self {
        Sandbox { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join(".build")
    }

    pub fn checkouts_dir(&self) -> PathBuf {
        self.build_dir().join("checkouts")
    }

    pub fn checkout_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.checkouts_dir().join(identity.as_str())
    }

    pub fn edits_dir(&self) -> PathBuf {
        self.build_dir().join("edits")
    }

    pub fn edit_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.edits_dir().join(identity.as_str())
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.build_dir().join("artifacts")
    }

    pub fn prebuilts_dir(&self) -> PathBuf {
        self.build_dir().join("prebuilts")
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.build_dir().join("repositories")
    }

    pub fn pins_file(&self) -> PathBuf {
        self.root.join("Package.resolved")
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(".workspace-state.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.build_dir().join("workspace.lock")
    }
}

/// Write `contents` to `path` atomically: stage into a temporary sibling,
/// then rename over the destination. Readers never observe a partial
/// document.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), WorkspaceError> {
    let context = path.display().to_string();
    let dir = path
        .parent()
        .ok_or_else(|| WorkspaceError::io(&context, std::io::Error::other("no parent dir")))?;
    std::fs::create_dir_all(dir).map_err(|e| WorkspaceError::io(&context, e))?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| WorkspaceError::io(&context, e))?;
    std::io::Write::write_all(&mut staged, contents)
        .map_err(|e| WorkspaceError::io(&context, e))?;
    staged
        .persist(path)
        .map_err(|e| WorkspaceError::io(&context, e.error))?;
    Ok(())
}

/// Entry count and recursive size of one cache directory tree. A missing
/// directory reads as empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Immediate children of the directory.
    pub entries: usize,
    /// Bytes of every file under it.
    pub total_bytes: u64,
}

pub fn directory_stats(path: &Path) -> DirectoryStats {
    let mut stats = DirectoryStats::default();
    let Ok(children) = std::fs::read_dir(path) else {
        return stats;
    };
    for child in children.flatten() {
        stats.entries += 1;
        stats.total_bytes += tree_size(&child.path());
    }
    stats
}

fn tree_size(path: &Path) -> u64 {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if metadata.is_file() {
        return metadata.len();
    }
    if !metadata.is_dir() {
        return 0;
    }
    let mut total = 0;
    if let Ok(children) = std::fs::read_dir(path) {
        for child in children.flatten() {
            total += tree_size(&child.path());
        }
    }
    total
}

/// SHA-256 of a byte slice, lowercased hex without a prefix.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 of a file's raw bytes; hashing large archives runs off the
/// async executor.
pub async fn sha256_file(path: &Path) -> Result<String, WorkspaceError> {
    let path = path.to_path_buf();
    let context = path.display().to_string();
    tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        use sha2::{Digest, Sha256};
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect())
    })
    .await
    .map_err(|e| WorkspaceError::io(&context, std::io::Error::other(e)))?
    .map_err(|e| WorkspaceError::io(&context, e))
}

/// Exclusive ownership of the sandbox for the duration of one workspace
/// operation. The lock file carries the owning process id; a lock whose
/// owner is gone is considered stale and replaced.
pub struct SandboxLock {
    path: PathBuf,
}

impl SandboxLock {
    pub fn acquire(sandbox: &Sandbox) -> Result<Self, WorkspaceError> {
        let path = sandbox.lock_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WorkspaceError::io(path.display().to_string(), e))?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = std::io::Write::write_all(&mut file, std::process::id().to_string().as_bytes());
                Ok(SandboxLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_is_stale(&path) {
                    let _ = std::fs::remove_file(&path);
                    return Self::acquire(sandbox);
                }
                Err(WorkspaceError::State(StateError::WorkspaceLocked { path }))
            }
            Err(e) => Err(WorkspaceError::io(path.display().to_string(), e)),
        }
    }
}

impl Drop for SandboxLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return true;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return true;
    };
    if pid == std::process::id() {
        return false;
    }
    // Probing /proc is good enough on the platforms we run on; elsewhere
    // assume the lock is live.
    #[cfg(target_os = "linux")]
    {
        !Path::new(&format!("/proc/{}", pid)).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pins.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn lock_excludes_second_acquirer() {
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::new(dir.path().to_path_buf());
        let lock = SandboxLock::acquire(&sandbox).unwrap();
        assert!(matches!(
            SandboxLock::acquire(&sandbox),
            Err(WorkspaceError::State(StateError::WorkspaceLocked { .. }))
        ));
        drop(lock);
        assert!(SandboxLock::acquire(&sandbox).is_ok());
    }

    #[test]
    fn directory_stats_count_children_and_bytes() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            directory_stats(&dir.path().join("missing")),
            DirectoryStats::default()
        );

        std::fs::create_dir_all(dir.path().join("a/nested")).unwrap();
        std::fs::write(dir.path().join("a/nested/file"), b"12345").unwrap();
        std::fs::write(dir.path().join("b"), b"123").unwrap();

        let stats = directory_stats(dir.path());
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 8);
    }

    #[test]
    fn sandbox_paths() {
        let sandbox = Sandbox::new(PathBuf::from("/ws"));
        assert_eq!(
            sandbox.checkout_path(&PackageIdentity::plain("foo")),
            PathBuf::from("/ws/.build/checkouts/foo")
        );
        assert_eq!(sandbox.pins_file(), PathBuf::from("/ws/Package.resolved"));
    }
}
