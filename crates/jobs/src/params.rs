use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Caller-supplied knobs forwarded to the generation provider.
///
/// All fields are optional; providers fall back to the mode's template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParameters {
    /// Free-form prompt submitted with the job.
    pub prompt: Option<String>,
    /// Extra instructions appended to the mode's prompt template.
    pub prompt_override: Option<String>,
    /// Studio mode: shadow style.
    pub shadow_option: Option<String>,
    /// Try-on mode: model presentation.
    pub model_gender: Option<String>,
    /// Lifestyle mode: scene setting.
    pub scene_environment: Option<String>,
}

impl GenerationParameters {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_prompt_override(mut self, prompt_override: impl Into<String>) -> Self {
        self.prompt_override = Some(prompt_override.into());
        self
    }

    /// Build parameters from a prompt that may carry JSON sub-option metadata.
    ///
    /// Clients encode sub-options as a JSON object in the prompt field. A
    /// prompt that is not a JSON object is kept verbatim as free text.
    pub fn from_prompt_metadata(prompt: &str) -> Self {
        let mut params = Self {
            prompt: Some(prompt.to_string()),
            ..Self::default()
        };

        match serde_json::from_str::<JsonValue>(prompt) {
            Ok(JsonValue::Object(map)) => {
                let field = |key: &str| map.get(key).and_then(JsonValue::as_str).map(str::to_string);
                params.shadow_option = field("shadow_option");
                params.model_gender = field("model_gender");
                params.scene_environment = field("scene_environment");
                params.prompt = field("prompt");
            }
            Ok(_) => {}
            Err(_) if prompt.trim_start().starts_with('{') => {
                warn!("prompt looks like metadata but is not valid JSON; keeping as text");
            }
            Err(_) => {}
        }

        params
    }
}
