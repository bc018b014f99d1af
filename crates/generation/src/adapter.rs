use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::Digest as _;
use tokio::sync::mpsc;

use productsnap_core::JobId;
use productsnap_jobs::{GenerationParameters, JobMode};

use crate::error::GenerationError;

/// Everything a provider needs to run one attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub job_id: JobId,
    pub input_ref: String,
    pub mode: JobMode,
    pub parameters: GenerationParameters,
    /// Deadline for the whole call; the worker enforces it as well.
    pub timeout: Duration,
}

/// One generated image, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "image/png")
    }

    /// Hex SHA-256 of the content; identifies the artifact for idempotent writes.
    pub fn digest(&self) -> String {
        let hash = sha2::Sha256::digest(&self.bytes);
        hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Sending half of a job's progress channel.
///
/// Providers report percentages here; the worker that owns the job drains the
/// channel and writes monotonic progress to the job store.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<u8>>,
}

/// Receiving half of a job's progress channel.
pub type ProgressReceiver = mpsc::UnboundedReceiver<u8>;

impl ProgressReporter {
    pub fn channel() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, percent: u8) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the attempt is over; late reports are moot.
            let _ = tx.send(percent.min(100));
        }
    }
}

/// The external AI image generation provider.
///
/// Implementations must be substitutable without changes to the worker pool:
/// the pool depends only on this contract.
#[async_trait]
pub trait GenerationAdapter: Send + Sync + 'static {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Run one generation attempt.
    async fn generate(
        &self,
        request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Artifact>, GenerationError>;
}

#[async_trait]
impl<G: GenerationAdapter> GenerationAdapter for Arc<G> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Artifact>, GenerationError> {
        (**self).generate(request, progress).await
    }
}
