mod api;
mod preview;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use kiln_core::{ComputeBackend, Orchestrator, OrchestratorConfig, Precision, Registry};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Diffusion image generation server")]
struct Args {
    /// Compute backend: cpu, cuda, or metal.
    #[arg(long, default_value = "cpu")]
    backend: ComputeBackend,

    /// Numeric precision: fp32 or fp16.
    #[arg(long, default_value = "fp32")]
    precision: Precision,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Directory finished images are written to and served from.
    #[arg(long, default_value = "./generated_images")]
    output_dir: std::path::PathBuf,

    #[arg(long, default_value_t = 2)]
    max_concurrent_jobs: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = OrchestratorConfig {
        backend: args.backend,
        precision: args.precision,
        output_dir: args.output_dir.clone(),
        max_concurrent_jobs: args.max_concurrent_jobs,
        ..OrchestratorConfig::default()
    };

    let registry = Arc::new(Registry::builtin().context("invalid model catalog")?);
    let provider = Arc::new(preview::PreviewProvider);
    let orchestrator = Arc::new(
        Orchestrator::new(registry, provider, config).context("orchestrator init")?,
    );

    let app = Router::new()
        .merge(api::router(Arc::clone(&orchestrator)))
        .nest_service("/images", ServeDir::new(&args.output_dir))
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        addr = %addr,
        backend = %args.backend,
        precision = %args.precision,
        "listening"
    );
    axum::serve(listener, app).await.context("server")?;
    Ok(())
}
