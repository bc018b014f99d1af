use async_trait::async_trait;

use crate::adapter::{Artifact, GenerationAdapter, GenerationRequest, ProgressReporter};
use crate::error::GenerationError;
use crate::http::HttpGenerator;
use crate::scripted::ScriptedGenerator;

/// Provider chosen at startup.
#[derive(Debug)]
pub enum Generator {
    Http(HttpGenerator),
    Scripted(ScriptedGenerator),
}

#[async_trait]
impl GenerationAdapter for Generator {
    fn name(&self) -> &'static str {
        match self {
            Generator::Http(g) => g.name(),
            Generator::Scripted(g) => g.name(),
        }
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Artifact>, GenerationError> {
        match self {
            Generator::Http(g) => g.generate(request, progress).await,
            Generator::Scripted(g) => g.generate(request, progress).await,
        }
    }
}

impl From<HttpGenerator> for Generator {
    fn from(g: HttpGenerator) -> Self {
        Generator::Http(g)
    }
}

impl From<ScriptedGenerator> for Generator {
    fn from(g: ScriptedGenerator) -> Self {
        Generator::Scripted(g)
    }
}
