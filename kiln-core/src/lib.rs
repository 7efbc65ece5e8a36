pub mod config;
pub mod device_map;
pub mod loader;
pub mod output;
mod registry;
mod util;

mod lcm;

pub use config::{EngineConfig, GenerationDefaults};
pub use device_map::*;
use image::DynamicImage;
pub use lcm::LcmLoader;
pub use loader::*;
pub use registry::*;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

// Define the request type shared by the server and the CLI.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    pub num_images: Option<usize>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub origin_steps: Option<usize>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            num_images: None,
            width: None,
            height: None,
            steps: None,
            guidance: None,
            origin_steps: None,
            seed: None,
        }
    }

    /// Fill unset generation parameters from the configured defaults.
    pub fn with_defaults(mut self, defaults: &GenerationDefaults) -> Self {
        self.steps = self.steps.or(Some(defaults.steps));
        self.guidance = self.guidance.or(Some(defaults.guidance));
        self.origin_steps = self.origin_steps.or(Some(defaults.origin_steps));
        self
    }
}

pub trait TextToImage: Send + Sync {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<Vec<DynamicImage>>;
}
