use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::{DeviceMap, EngineConfig};
use kiln_server::{router, AppState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
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

    let state = Arc::new(AppState::new(config, DeviceMap::from_cpu_flag(args.cpu)));

    // Optionally pay the model-load cost at startup instead of on the
    // first request.
    if state.config().preload {
        info!("preloading pipeline");
        state.pipeline().await?;
    }

    let app = router(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
