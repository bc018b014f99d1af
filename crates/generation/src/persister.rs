//! Durable storage for generated artifacts.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use productsnap_core::JobId;

use crate::adapter::Artifact;

/// Stable reference to a stored result (URL or object key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableRef(String);

impl StableRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("result storage unavailable: {0}")]
    Unavailable(String),

    #[error("artifact rejected by storage: {0}")]
    InvalidArtifact(String),
}

impl StorageError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Writes artifacts to durable storage.
///
/// `store` must be idempotent per `(job_id, artifact)`: writing the same
/// content twice for a job returns the same reference.
#[async_trait]
pub trait ResultPersister: Send + Sync + 'static {
    async fn store(&self, job_id: JobId, artifact: &Artifact) -> Result<StableRef, StorageError>;
}

#[async_trait]
impl<P: ResultPersister> ResultPersister for Arc<P> {
    async fn store(&self, job_id: JobId, artifact: &Artifact) -> Result<StableRef, StorageError> {
        (**self).store(job_id, artifact).await
    }
}

#[derive(Debug, Default)]
struct PersisterState {
    objects: HashMap<(JobId, String), Vec<u8>>,
    pending_failures: usize,
    writes: usize,
}

/// In-memory persister. Failures can be injected to exercise retry paths.
#[derive(Debug, Default)]
pub struct InMemoryResultPersister {
    state: Mutex<PersisterState>,
}

impl InMemoryResultPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `store` fail with [`StorageError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().pending_failures = n;
    }

    /// Distinct objects currently stored.
    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Successful `store` calls, including idempotent repeats.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn get(&self, reference: &StableRef) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .find(|((job_id, digest), _)| object_ref(*job_id, digest) == *reference)
            .map(|(_, bytes)| bytes.clone())
    }
}

fn object_ref(job_id: JobId, digest: &str) -> StableRef {
    StableRef(format!("mem://results/{job_id}/{digest}.png"))
}

#[async_trait]
impl ResultPersister for InMemoryResultPersister {
    async fn store(&self, job_id: JobId, artifact: &Artifact) -> Result<StableRef, StorageError> {
        if artifact.bytes.is_empty() {
            return Err(StorageError::InvalidArtifact("empty artifact".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }

        let digest = artifact.digest();
        let reference = object_ref(job_id, &digest);
        state
            .objects
            .entry((job_id, digest))
            .or_insert_with(|| artifact.bytes.clone());
        state.writes += 1;
        Ok(reference)
    }
}
