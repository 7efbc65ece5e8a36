use std::path::PathBuf;
use std::sync::Arc;

use kiln_core::{output, DeviceMap, EngineConfig, GenerationDefaults};
use kiln_server::{router, AppState};
use tempfile::TempDir;

async fn spawn_app(output_dir: PathBuf) -> String {
    let config = EngineConfig {
        model_id: "SimianLuo/LCM_Dreamshaper_v7".to_string(),
        revision: "fb9c5d".to_string(),
        output_dir,
        defaults: GenerationDefaults::default(),
        preload: false,
    };
    let state = Arc::new(AppState::new(config, DeviceMap::ForceCpu));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let dir = TempDir::new().unwrap();
    let base = spawn_app(dir.path().to_path_buf()).await;

    let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn index_page_embeds_defaults() {
    let dir = TempDir::new().unwrap();
    let base = spawn_app(dir.path().to_path_buf()).await;

    let response = reqwest::get(format!("{base}/")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"name="prompt""#));
    assert!(body.contains(r#"value="8""#), "default steps not substituted");
    assert!(body.contains(r#"value="30""#), "default guidance not substituted");
}

#[tokio::test]
async fn empty_prompt_is_rejected() {
    let dir = TempDir::new().unwrap();
    let base = spawn_app(dir.path().to_path_buf()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/generate"))
        .form(&[("prompt", "   ")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn step_counts_are_validated_before_generation() {
    let dir = TempDir::new().unwrap();
    let base = spawn_app(dir.path().to_path_buf()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/generate"))
        .form(&[
            ("prompt", "a lighthouse"),
            ("num_inference_steps", "9"),
            ("lcm_origin_steps", "8"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body = response.text().await.unwrap();
    assert!(body.contains("num_inference_steps"), "{body}");
}

#[tokio::test]
async fn outputs_serves_saved_files() {
    let dir = TempDir::new().unwrap();
    let base = spawn_app(dir.path().to_path_buf()).await;

    let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(4, 4));
    let metadata = output::ImageMetadata {
        prompt: "saved".to_string(),
        num_steps: 8,
        guidance: 30.0,
        origin_steps: 8,
    };
    let path = dir.path().join("saved_0.png");
    output::save_png(&image, &path, &metadata).unwrap();

    let response = reqwest::get(format!("{base}/outputs/saved_0.png")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "image/png"
    );
    assert!(!response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn outputs_rejects_traversal_and_unknown_files() {
    let dir = TempDir::new().unwrap();
    let base = spawn_app(dir.path().to_path_buf()).await;

    let client = reqwest::Client::new();
    for name in ["missing.png", "..%2Fsecret.png", "notes.txt"] {
        let response = client
            .get(format!("{base}/outputs/{name}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404, "{name}");
    }
}
