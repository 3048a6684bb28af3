//! The archive-extraction capability seam.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::path::Path;

use crate::workspace::errors::ArtifactError;

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Extract `archive` into `destination`, creating it if needed.
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArtifactError>;
}

/// Default extractor for gzip-compressed tarballs. Archives with other
/// extensions are handed to it as well; callers that need a different
/// format swap the implementation at construction time.
pub struct TarGzArchiver;

#[async_trait]
impl Archiver for TarGzArchiver {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArtifactError> {
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        let target = archive.display().to_string();
        // Extraction is blocking work; run it off the async executor.
        tokio::task::spawn_blocking(move || -> Result<(), String> {
            std::fs::create_dir_all(&destination).map_err(|e| e.to_string())?;
            let file = std::fs::File::open(&archive).map_err(|e| e.to_string())?;
            let mut tarball = tar::Archive::new(GzDecoder::new(file));
            tarball.unpack(&destination).map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| ArtifactError::ExtractionFailed {
            target: target.clone(),
            message: e.to_string(),
        })?
        .map_err(|message| ArtifactError::ExtractionFailed { target, message })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Fake extractor: records every call and writes a marker file so
    /// callers can observe the extraction root. Can be poisoned to fail.
    #[derive(Default)]
    pub struct RecordingArchiver {
        pub extractions: Mutex<Vec<(PathBuf, PathBuf)>>,
        fail: Mutex<bool>,
    }

    impl RecordingArchiver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next(&self) {
            *self.fail.lock().unwrap() = true;
        }

        pub fn extraction_count(&self) -> usize {
            self.extractions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Archiver for RecordingArchiver {
        async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArtifactError> {
            if std::mem::take(&mut *self.fail.lock().unwrap()) {
                return Err(ArtifactError::ExtractionFailed {
                    target: archive.display().to_string(),
                    message: "poisoned".to_string(),
                });
            }
            tokio::fs::create_dir_all(destination)
                .await
                .map_err(|e| ArtifactError::ExtractionFailed {
                    target: archive.display().to_string(),
                    message: e.to_string(),
                })?;
            tokio::fs::write(destination.join(".extracted"), b"ok")
                .await
                .map_err(|e| ArtifactError::ExtractionFailed {
                    target: archive.display().to_string(),
                    message: e.to_string(),
                })?;
            self.extractions
                .lock()
                .unwrap()
                .push((archive.to_path_buf(), destination.to_path_buf()));
            Ok(())
        }
    }
}
