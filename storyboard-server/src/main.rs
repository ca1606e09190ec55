use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use storyboard_core::{DeviceMap, HandlerVariant, LoadSettings, SdxlLoader, SdxlWeights, Worker};
use tokio::{self, net::TcpListener};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Storyboard frame generation worker")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "STORYBOARD_CPU")]
    cpu: bool,

    /// SDXL base model repo on the Hugging Face hub
    #[arg(long, env = "STORYBOARD_MODEL", default_value = "stabilityai/stable-diffusion-xl-base-1.0")]
    model: String,

    /// `text` for plain generation, `reference` to also accept reference images
    #[arg(long, env = "STORYBOARD_VARIANT", default_value_t = HandlerVariant::Text)]
    variant: HandlerVariant,

    /// Model artifact cache; defaults to the hub cache under HF_HOME
    #[arg(long, env = "STORYBOARD_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Compute attention in slices of this size to save accelerator memory
    #[arg(long, env = "STORYBOARD_SLICED_ATTENTION_SIZE")]
    sliced_attention_size: Option<usize>,

    /// Host address to bind the server to
    #[arg(long, env = "STORYBOARD_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "STORYBOARD_PORT", default_value_t = 8000)]
    port: u16,

    /// Load the pipeline before accepting jobs instead of on the first job
    #[arg(long)]
    eager: bool,

    /// Run the job envelope in this JSON file, print the result and exit
    #[arg(long, value_name = "FILE")]
    test_input: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every model file into the cache and exit
    Download,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_test_input(worker: &Worker<SdxlLoader>, path: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let envelope: Value = serde_json::from_str(&text).context("test input is not valid JSON")?;
    let output = worker.handle(&envelope).await;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let settings = LoadSettings {
        device_map: DeviceMap::from_cpu_flag(args.cpu),
        variant: args.variant,
        cache_dir: args.cache_dir.clone(),
        sliced_attention_size: args.sliced_attention_size,
    };
    let weights = SdxlWeights::with_base_repo(&args.model);

    if let Some(Command::Download) = args.command {
        for path in weights.prefetch(&settings).await? {
            info!(path = %path.display(), "cached");
        }
        return Ok(());
    }

    let worker = Arc::new(Worker::new(SdxlLoader::new(weights), settings));

    if let Some(path) = &args.test_input {
        return run_test_input(&worker, path).await;
    }

    if args.eager {
        worker.cache().ensure_loaded().await?;
    }

    let app = routes::router(worker);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(variant = %args.variant, "Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attention_slicing_is_off_unless_asked_for() {
        let args = Args::try_parse_from(["storyboard-server"]).unwrap();
        assert_eq!(args.sliced_attention_size, None);

        let args = Args::try_parse_from(["storyboard-server", "--sliced-attention-size", "2"]).unwrap();
        assert_eq!(args.sliced_attention_size, Some(2));
    }
}
