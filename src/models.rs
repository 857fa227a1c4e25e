use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::GenerateError;

pub const MAX_PROMPT_CHARS: usize = 500;
pub const MIN_DIMENSION: u32 = 256;
pub const MAX_DIMENSION: u32 = 2048;
pub const MODELS: [&str; 2] = ["flux", "turbo"];

fn default_dimension() -> u32 {
    1024
}

fn default_model() -> String {
    "flux".to_string()
}

// Generation request from the browser
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerateRequest {
    /// Trims the prompt, lowercases the model and checks ranges.
    pub fn normalized(mut self) -> Result<Self, GenerateError> {
        self.prompt = self.prompt.trim().to_string();
        if self.prompt.is_empty() {
            return Err(GenerateError::InvalidRequest("Prompt is required".into()));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(GenerateError::InvalidRequest(format!(
                "Prompt must be {MAX_PROMPT_CHARS} characters or less"
            )));
        }

        let dims = MIN_DIMENSION..=MAX_DIMENSION;
        if !dims.contains(&self.width) || !dims.contains(&self.height) {
            return Err(GenerateError::InvalidRequest(format!(
                "Width and height must be between {MIN_DIMENSION} and {MAX_DIMENSION} pixels"
            )));
        }

        self.model = self.model.trim().to_ascii_lowercase();
        if self.model.is_empty() {
            self.model = default_model();
        }
        if !MODELS.contains(&self.model.as_str()) {
            return Err(GenerateError::InvalidRequest(format!(
                "Model must be one of: {}",
                MODELS.join(", ")
            )));
        }
        Ok(self)
    }
}

// Response after a successful generation
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct GenerateResponse {
    pub success: bool,
    pub filename: String,
    pub download_url: String,
    pub generation_time: f64,
    pub file_size: u64,
}

#[derive(Deserialize, Debug, Default)]
pub struct ListQuery {
    pub date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CleanupRequest {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerateRequest {
        serde_json::from_value(serde_json::json!({ "prompt": prompt })).unwrap()
    }

    #[test]
    fn defaults_applied() {
        let req = request("  a lighthouse at dusk ").normalized().unwrap();
        assert_eq!(req.prompt, "a lighthouse at dusk");
        assert_eq!((req.width, req.height), (1024, 1024));
        assert_eq!(req.model, "flux");
        assert_eq!(req.seed, None);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(request("   ").normalized().is_err());
        assert!(request(&"x".repeat(501)).normalized().is_err());

        let mut req = request("ok");
        req.width = 100;
        assert!(req.normalized().is_err());

        let mut req = request("ok");
        req.model = "dalle".into();
        assert!(req.normalized().is_err());
    }
}
