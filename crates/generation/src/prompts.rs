//! Prompt templates per transformation mode.

use productsnap_jobs::{GenerationParameters, JobMode};

fn template(mode: JobMode) -> &'static str {
    match mode {
        JobMode::StudioWhite => {
            "Cut the product out cleanly with crisp edges. Place it on a pure white \
             (#FFFFFF) background with a subtle studio shadow. No props, no text."
        }
        JobMode::ModelTryon => {
            "Show the product worn or held by a realistic model at correct scale. \
             Clean studio lighting, neutral backdrop, natural pose, product in focus."
        }
        JobMode::LifestyleScene => {
            "Place the product in a natural setting suited to its category. Balanced \
             lighting, photorealistic materials, consistent shadows, no logos or text."
        }
    }
}

/// Full provider prompt for a job.
pub fn build_prompt(mode: JobMode, params: &GenerationParameters) -> String {
    let mut prompt = template(mode).to_string();

    let sub_option = match mode {
        JobMode::StudioWhite => params.shadow_option.as_deref().map(|s| format!("Shadow style: {s}.")),
        JobMode::ModelTryon => params.model_gender.as_deref().map(|g| format!("Model: {g}.")),
        JobMode::LifestyleScene => params
            .scene_environment
            .as_deref()
            .map(|e| format!("Scene environment: {e}.")),
    };
    if let Some(line) = sub_option {
        prompt.push(' ');
        prompt.push_str(&line);
    }

    if let Some(extra) = params.prompt_override.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\nAdditional instructions: ");
        prompt.push_str(extra.trim());
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_is_appended() {
        let params = GenerationParameters::default().with_prompt_override("  warmer tones ");
        let prompt = build_prompt(JobMode::StudioWhite, &params);
        assert!(prompt.starts_with("Cut the product out"));
        assert!(prompt.ends_with("Additional instructions: warmer tones"));
    }

    #[test]
    fn only_the_matching_sub_option_is_used() {
        let params = GenerationParameters {
            shadow_option: Some("none".into()),
            scene_environment: Some("beach".into()),
            ..GenerationParameters::default()
        };
        let prompt = build_prompt(JobMode::LifestyleScene, &params);
        assert!(prompt.contains("Scene environment: beach."));
        assert!(!prompt.contains("Shadow style"));
    }
}
