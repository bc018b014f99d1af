//! Result storage on a local or mounted filesystem.
//!
//! Objects live at `{root}/results/{job_id}/{digest}.{ext}` and are
//! referenced as `file://` URLs. Each write lands in a temporary file that is
//! renamed into place, so a reader never sees a partial image.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use productsnap_core::JobId;

use crate::adapter::Artifact;
use crate::persister::{ResultPersister, StableRef, StorageError};

#[derive(Debug, Clone)]
pub struct FsResultPersister {
    root: PathBuf,
}

impl FsResultPersister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the artifact with `digest` for `job_id` is stored.
    pub fn object_path(&self, job_id: JobId, digest: &str, content_type: &str) -> PathBuf {
        self.root
            .join("results")
            .join(job_id.to_string())
            .join(format!("{digest}.{}", extension(content_type)))
    }
}

fn extension(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "bin",
    }
}

fn file_ref(path: &Path) -> StableRef {
    StableRef::new(format!("file://{}", path.display()))
}

fn unavailable(action: &str, path: &Path, err: io::Error) -> StorageError {
    StorageError::Unavailable(format!("failed to {action} {}: {err}", path.display()))
}

#[async_trait]
impl ResultPersister for FsResultPersister {
    async fn store(&self, job_id: JobId, artifact: &Artifact) -> Result<StableRef, StorageError> {
        if artifact.bytes.is_empty() {
            return Err(StorageError::InvalidArtifact("empty artifact".to_string()));
        }

        let digest = artifact.digest();
        let path = self.object_path(job_id, &digest, &artifact.content_type);

        // Content-addressed: an existing object already holds these bytes.
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| unavailable("inspect", &path, e))?
        {
            debug!(job_id = %job_id, path = %path.display(), "result already stored");
            return Ok(file_ref(&path));
        }

        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidArtifact("object path has no parent".to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| unavailable("create", dir, e))?;

        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, &artifact.bytes)
            .await
            .map_err(|e| unavailable("write", &partial, e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| unavailable("publish", &path, e))?;

        debug!(job_id = %job_id, path = %path.display(), bytes = artifact.bytes.len(), "result stored");
        Ok(file_ref(&path))
    }
}
