//! HTTP front end: one generation endpoint, a health check, an HTML form
//! page and a file-serving route for the output directory. The pipeline is
//! built lazily on first use; concurrent first requests are serialized by
//! the once-cell so the model is only loaded once.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Form, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use kiln_core::{
    load_model, output, DeviceMap, EngineConfig, GenerationRequest, ModelSpec, TextToImage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{error, info};

const INDEX_HTML: &str = include_str!("index.html");

/// Shared application state: configuration plus the lazily-built pipeline.
pub struct AppState {
    config: EngineConfig,
    device_map: DeviceMap,
    pipeline: OnceCell<Arc<dyn TextToImage>>,
}

impl AppState {
    pub fn new(config: EngineConfig, device_map: DeviceMap) -> Self {
        Self {
            config,
            device_map,
            pipeline: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared pipeline, built on first call. Later callers wait on the
    /// same initialization instead of racing to build a second instance.
    pub async fn pipeline(&self) -> Result<Arc<dyn TextToImage>> {
        let pipeline = self
            .pipeline
            .get_or_try_init(|| async {
                let api = Api::new().context("failed to create hub api")?;
                let spec = ModelSpec::new(&self.config.model_id, &self.config.revision);
                load_model(spec, api, self.device_map).await
            })
            .await?;
        Ok(pipeline.clone())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/", get(index))
        .route("/api/generate", post(generate_handler))
        .route("/outputs/{filename}", get(serve_output))
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let defaults = &state.config.defaults;
    Html(
        INDEX_HTML
            .replace("{DEFAULT_STEPS}", &defaults.steps.to_string())
            .replace("{DEFAULT_GUIDANCE}", &defaults.guidance.to_string())
            .replace("{DEFAULT_ORIGIN_STEPS}", &defaults.origin_steps.to_string()),
    )
}

#[derive(Deserialize, Debug)]
pub struct GenerateForm {
    prompt: String,
    num_images: Option<usize>,
    num_inference_steps: Option<usize>,
    guidance_scale: Option<f64>,
    lcm_origin_steps: Option<usize>,
    /// When set, each response entry also carries the PNG as base64.
    include_data: Option<bool>,
}

#[derive(Serialize, Debug)]
pub struct GeneratedFile {
    pub name: String,
    pub path: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct GenerateResponse {
    pub files: Vec<GeneratedFile>,
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<GenerateForm>,
) -> Response {
    if form.prompt.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "prompt is required").into_response();
    }
    let defaults = &state.config.defaults;
    let steps = form.num_inference_steps.unwrap_or(defaults.steps);
    let origin_steps = form.lcm_origin_steps.unwrap_or(defaults.origin_steps);
    if steps == 0 || origin_steps == 0 || steps > origin_steps {
        return (
            StatusCode::BAD_REQUEST,
            format!("num_inference_steps ({steps}) must be between 1 and lcm_origin_steps ({origin_steps})"),
        )
            .into_response();
    }

    match generate(&state, form).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!("generation failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("generation failed: {e:#}"),
            )
                .into_response()
        }
    }
}

async fn generate(state: &AppState, form: GenerateForm) -> Result<GenerateResponse> {
    let defaults = &state.config.defaults;
    let request = GenerationRequest {
        num_images: Some(form.num_images.unwrap_or(1).max(1)),
        steps: form.num_inference_steps,
        guidance: form.guidance_scale,
        origin_steps: form.lcm_origin_steps,
        ..GenerationRequest::new(form.prompt.clone())
    }
    .with_defaults(defaults);

    info!(
        prompt = %request.prompt.chars().take(80).collect::<String>(),
        num_images = request.num_images,
        steps = request.steps,
        guidance = request.guidance,
        origin_steps = request.origin_steps,
        "generation request"
    );

    let metadata = output::ImageMetadata {
        prompt: request.prompt.clone(),
        num_steps: request.steps.unwrap_or(defaults.steps),
        guidance: request.guidance.unwrap_or(defaults.guidance),
        origin_steps: request.origin_steps.unwrap_or(defaults.origin_steps),
    };

    let pipeline = state.pipeline().await?;
    let images = {
        let request = request.clone();
        tokio::task::spawn_blocking(move || pipeline.run(request))
            .await
            .context("generation task panicked")??
    };

    let timestamp = output::timestamp_slug();
    let include_data = form.include_data.unwrap_or(false);
    let mut files = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let name = output::filename_for(&request.prompt, &timestamp, index);
        let path = state.config.output_dir.join(&name);
        output::save_png(image, &path, &metadata)?;
        let data = if include_data {
            Some(image_to_base64_png(image)?)
        } else {
            None
        };
        files.push(GeneratedFile {
            url: format!("/outputs/{name}"),
            path: path.display().to_string(),
            name,
            data,
        });
    }
    info!(count = files.len(), "saved generated images");
    Ok(GenerateResponse { files })
}

/// Serves saved images back out of the output directory. Only bare PNG
/// filenames are accepted; anything path-like is treated as missing.
async fn serve_output(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Response {
    let path_like = filename.contains('/') || filename.contains('\\') || filename.contains("..");
    if path_like || !filename.ends_with(".png") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = state.config.output_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}
