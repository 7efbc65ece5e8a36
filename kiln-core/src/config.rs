use std::path::PathBuf;

use anyhow::{Context, Result};

pub const DEFAULT_MODEL_ID: &str = "SimianLuo/LCM_Dreamshaper_v7";
pub const DEFAULT_MODEL_REVISION: &str = "fb9c5d";
pub const DEFAULT_OUTPUT_DIR: &str = "lcm_images";

/// Default generation parameters, overridable per request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub steps: usize,
    pub guidance: f64,
    pub origin_steps: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            steps: 8,
            guidance: 30.0,
            origin_steps: 8,
        }
    }
}

/// Engine configuration, sourced entirely from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub model_id: String,
    pub revision: String,
    pub output_dir: PathBuf,
    pub defaults: GenerationDefaults,
    pub preload: bool,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = GenerationDefaults::default();
        Ok(Self {
            model_id: lookup("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            revision: lookup("MODEL_REVISION").unwrap_or_else(|| DEFAULT_MODEL_REVISION.to_string()),
            output_dir: lookup("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            defaults: GenerationDefaults {
                steps: parse_var(&lookup, "NUM_INFERENCE_STEPS")?.unwrap_or(defaults.steps),
                guidance: parse_var(&lookup, "GUIDANCE_SCALE")?.unwrap_or(defaults.guidance),
                origin_steps: parse_var(&lookup, "LCM_ORIGIN_STEPS")?.unwrap_or(defaults.origin_steps),
            },
            preload: lookup("PRELOAD_MODEL")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(true),
        })
    }

    /// Create the output directory if it does not exist yet.
    pub fn ensure_output_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create output dir {}", self.output_dir.display()))
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
