use std::sync::Arc;

use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{DeviceMap, LcmLoader, Loader, ModelSpec, TextToImage};

/// Model families the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    LatentConsistency,
}

impl ModelFamily {
    /// Detect the model family from a hub model id.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("LCM") || name_upper.contains("DREAMSHAPER") {
            Some(ModelFamily::LatentConsistency)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&serde_plain::to_string(self).map_err(|_| std::fmt::Error)?)
    }
}

/// Load a model based on its id, picking the appropriate loader.
pub async fn load_model(
    spec: ModelSpec,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn TextToImage>> {
    let family = ModelFamily::from_name(&spec.model_id)
        .ok_or_else(|| anyhow!("unsupported model: {}", spec.model_id))?;

    info!(model_id = %spec.model_id, %family, "loading model");

    match family {
        ModelFamily::LatentConsistency => {
            let model = LcmLoader::load(spec, api, device_map).await?;
            Ok(Arc::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_latent_consistency_ids() {
        for id in [
            "SimianLuo/LCM_Dreamshaper_v7",
            "Lykon/dreamshaper-7",
            "latent-consistency/lcm-sdxl",
        ] {
            assert_eq!(ModelFamily::from_name(id), Some(ModelFamily::LatentConsistency), "{id}");
        }
    }

    #[test]
    fn rejects_unknown_ids() {
        assert_eq!(ModelFamily::from_name("black-forest-labs/FLUX.1-schnell"), None);
        assert_eq!(ModelFamily::from_name("stabilityai/sdxl-turbo"), None);
    }

    #[test]
    fn family_displays_as_kebab_case() {
        assert_eq!(ModelFamily::LatentConsistency.to_string(), "latent-consistency");
    }
}
