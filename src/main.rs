//! Model Keeper - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_keeper::models::{AcquireOutcome, ModelKey, PrecisionLevel};
use model_keeper::{KeeperConfig, ModelRegistry, TextGenerator, metrics};
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "model-keeper")]
#[command(about = "Acquire, reduce and serve local inference models", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the artifact store directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show every configured model as JSON
    Status,
    /// Download a model's artifacts without loading it
    Fetch {
        /// Model key, e.g. language-gpt2-medium
        model: ModelKey,
    },
    /// Derive a reduced-precision variant
    Quantize {
        model: ModelKey,
        #[arg(short, long, default_value = "int8")]
        precision: PrecisionLevel,
    },
    /// Load and smoke-test a model, then unload it
    Load { model: ModelKey },
    /// Generate text with a language model
    Generate {
        model: ModelKey,
        #[arg(short, long)]
        prompt: String,
        #[arg(long, default_value_t = 128)]
        max_tokens: u32,
    },
    /// Load every configured model and keep it resident until Ctrl+C/SIGTERM
    Warm,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    let mut config = KeeperConfig::load(cli.config)?;
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }
    config.validate()?;

    tracing::info!(
        base_dir = ?config.base_dir,
        models = config.models.len(),
        precision = %config.precision,
        "Configuration loaded"
    );

    let prometheus_handle = metrics::setup_metrics()?;

    match cli.command {
        Command::Status => {
            let registry = config.build_registry()?;
            let entries = registry.list();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Fetch { model } => {
            let catalog = config.catalog();
            let desc = catalog
                .get(&model)
                .with_context(|| format!("model '{}' is not configured", model))?;
            let outcome = config.acquirer()?.acquire(desc).await?;
            match outcome {
                AcquireOutcome::AlreadyPresent => println!("{}: already present", model),
                AcquireOutcome::Downloaded { files, bytes } => {
                    println!("{}: downloaded {} ({} bytes)", model, files.join(", "), bytes)
                }
            }
        }
        Command::Quantize { model, precision } => {
            let registry = config.build_registry()?;
            let variant = registry.reduce(&model, precision).await?;
            println!("{}", serde_json::to_string_pretty(&variant)?);
        }
        Command::Load { model } => {
            let registry = config.build_registry()?;
            let handle = registry.ensure_loaded(&model).await?;
            println!(
                "{}: loaded at {} from {:?}",
                model,
                handle.precision(),
                handle.weights_path()
            );
            drop(handle);
            registry.shutdown().await;
        }
        Command::Generate {
            model,
            prompt,
            max_tokens,
        } => {
            let registry = config.build_registry()?;
            let generator = TextGenerator::new(registry.clone(), model);
            let result = generator.generate_text(&prompt, max_tokens).await;
            registry.shutdown().await;
            println!("{}", result?);
        }
        Command::Warm => {
            let registry = config.build_registry()?;
            warm(&registry).await;

            shutdown_signal().await;
            tracing::info!("Shutting down...");
            registry.shutdown().await;

            print!("{}", prometheus_handle.render());
            tracing::info!("Shutdown complete");
        }
    }

    Ok(())
}

/// Load every configured model concurrently, logging failures
async fn warm(registry: &ModelRegistry) {
    let keys = registry.catalog().keys();
    let loads = keys.iter().map(|key| async move {
        match registry.ensure_loaded(key).await {
            Ok(_) => tracing::info!(model = %key, "Model warm"),
            Err(e) => tracing::error!(
                model = %key,
                error = %e,
                availability = ?e.availability(),
                "Failed to warm model"
            ),
        }
    });
    futures::future::join_all(loads).await;

    tracing::info!(
        loaded = registry.loaded_count(),
        configured = keys.len(),
        "Warm-up finished"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
