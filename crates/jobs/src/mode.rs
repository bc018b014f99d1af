use core::str::FromStr;

use serde::{Deserialize, Serialize};

use productsnap_core::DomainError;

/// Transformation variant requested for a photo.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Isolated product on a pure white studio background.
    StudioWhite,
    /// Product presented on a model (virtual try-on).
    ModelTryon,
    /// Product placed in a natural lifestyle scene.
    LifestyleScene,
}

impl JobMode {
    pub const ALL: [JobMode; 3] = [
        JobMode::StudioWhite,
        JobMode::ModelTryon,
        JobMode::LifestyleScene,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::StudioWhite => "studio_white",
            JobMode::ModelTryon => "model_tryon",
            JobMode::LifestyleScene => "lifestyle_scene",
        }
    }
}

impl core::fmt::Display for JobMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job mode: {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_back() {
        for mode in JobMode::ALL {
            assert_eq!(mode.as_str().parse::<JobMode>().unwrap(), mode);
        }
    }

    #[test]
    fn unknown_mode_is_a_validation_error() {
        let err = "oil_painting".parse::<JobMode>().unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&JobMode::ModelTryon).unwrap();
        assert_eq!(json, "\"model_tryon\"");
    }
}
