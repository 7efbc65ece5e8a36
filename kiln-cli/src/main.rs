//! Interactive prompt loop: load the pipeline once, then generate and save
//! image batches until the user quits.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Input;
use hf_hub::api::tokio::Api;
use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{
    load_model, output, DeviceMap, EngineConfig, GenerationRequest, ModelSpec, TextToImage,
};
use tracing::error;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive text2image prompt loop")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = EngineConfig::from_env()?;
    config.ensure_output_dir()?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}").context("bad template")?);
    spinner.set_message(format!("Loading {}...", config.model_id));
    let pipeline = load_model(
        ModelSpec::new(&config.model_id, &config.revision),
        Api::new()?,
        DeviceMap::from_cpu_flag(args.cpu),
    )
    .await?;
    spinner.finish_with_message("Pipeline ready");

    loop {
        let prompt: String = Input::new()
            .with_prompt("Enter prompt (or 'q' to quit)")
            .interact_text()?;
        if prompt.eq_ignore_ascii_case("q") {
            break;
        }

        let num_images: usize = Input::new()
            .with_prompt("Number of images")
            .default(1)
            .interact_text()?;
        let steps: usize = Input::new()
            .with_prompt("Inference steps")
            .default(config.defaults.steps)
            .interact_text()?;
        let guidance: f64 = Input::new()
            .with_prompt("Guidance scale")
            .default(config.defaults.guidance)
            .interact_text()?;
        let origin_steps: usize = Input::new()
            .with_prompt("Origin steps")
            .default(config.defaults.origin_steps)
            .interact_text()?;

        println!("Generating {num_images} images for: '{prompt}'");
        let request = GenerationRequest {
            num_images: Some(num_images.max(1)),
            steps: Some(steps),
            guidance: Some(guidance),
            origin_steps: Some(origin_steps),
            ..GenerationRequest::new(prompt.clone())
        };

        let images = match pipeline.run(request) {
            Ok(images) => images,
            Err(e) => {
                error!("error generating image: {e:#}");
                continue;
            }
        };

        let metadata = output::ImageMetadata {
            prompt: prompt.clone(),
            num_steps: steps,
            guidance,
            origin_steps,
        };
        let timestamp = output::timestamp_slug();
        let progress = ProgressBar::new(images.len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}").context("bad template")?,
        );
        progress.set_message("Saving images");
        for (index, image) in images.iter().enumerate() {
            let filename = output::filename_for(&prompt, &timestamp, index);
            let path = config.output_dir.join(filename);
            if let Err(e) = output::save_png(image, &path, &metadata) {
                error!("failed to save image: {e:#}");
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        println!("Images saved to {}", config.output_dir.display());
    }

    println!("Image generation completed.");
    Ok(())
}
