//! Deterministic provider for tests and local runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::adapter::{Artifact, GenerationAdapter, GenerationRequest, ProgressReporter};
use crate::error::GenerationError;

/// One scripted response, consumed per call in order.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Success(Vec<Artifact>),
    Fail(GenerationError),
    /// Sleep, then resolve with the inner outcome.
    Delay(Duration, Box<ScriptedOutcome>),
    /// Report the given percentages, then resolve with the inner outcome.
    Progress(Vec<u8>, Box<ScriptedOutcome>),
    /// Never resolve; only a timeout or cancellation ends the call.
    Hang,
}

impl ScriptedOutcome {
    pub fn success() -> Self {
        ScriptedOutcome::Success(vec![Artifact::png(b"scripted-image".to_vec())])
    }

    pub fn fail(err: GenerationError) -> Self {
        ScriptedOutcome::Fail(err)
    }

    pub fn after(self, delay: Duration) -> Self {
        ScriptedOutcome::Delay(delay, Box::new(self))
    }

    pub fn with_progress(self, steps: Vec<u8>) -> Self {
        ScriptedOutcome::Progress(steps, Box::new(self))
    }
}

/// Replays a queue of outcomes; once the script runs out every call uses the
/// fallback outcome.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    calls: AtomicUsize,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedGenerator {
    pub fn new(script: Vec<ScriptedOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: ScriptedOutcome::success(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call resolves with `outcome`.
    pub fn always(outcome: ScriptedOutcome) -> Self {
        Self::new(Vec::new()).with_fallback(outcome)
    }

    pub fn with_fallback(mut self, outcome: ScriptedOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Number of `generate` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

async fn resolve(
    mut outcome: ScriptedOutcome,
    progress: &ProgressReporter,
) -> Result<Vec<Artifact>, GenerationError> {
    loop {
        outcome = match outcome {
            ScriptedOutcome::Success(artifacts) => return Ok(artifacts),
            ScriptedOutcome::Fail(err) => return Err(err),
            ScriptedOutcome::Delay(delay, inner) => {
                tokio::time::sleep(delay).await;
                *inner
            }
            ScriptedOutcome::Progress(steps, inner) => {
                for step in steps {
                    progress.report(step);
                    tokio::task::yield_now().await;
                }
                *inner
            }
            ScriptedOutcome::Hang => std::future::pending().await,
        };
    }
}

#[async_trait]
impl GenerationAdapter for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(
        &self,
        _request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Artifact>, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        resolve(outcome, &progress).await
    }
}
