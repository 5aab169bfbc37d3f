//! gpugate CLI
//!
//! Command-line interface for inspecting and calling a gpugate gateway.

mod commands;

use clap::{Parser, Subcommand};
use gpugate_core::CallerSource;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpugate - client for the on-demand GPU model gateway
#[derive(Parser, Debug)]
#[command(name = "gpugate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Gateway address
    #[arg(long, default_value = "http://127.0.0.1:8080", global = true)]
    api: String,

    /// API key sent as a bearer token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List model names the gateway accepts
    Models,

    /// Show per-model state and GPU reservations
    Status {
        /// Only show this model or alias
        model: Option<String>,
    },

    /// Check that the gateway is up
    Health,

    /// Send a single chat message and print the reply
    Chat {
        /// Model name or alias
        model: String,

        /// User message
        prompt: String,

        /// Request source (interactive or batch)
        #[arg(long)]
        source: Option<CallerSource>,

        /// Completion token limit
        #[arg(long)]
        max_tokens: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api, cli.token)?;

    match cli.command {
        Commands::Models => {
            commands::models(&client).await?;
        }
        Commands::Status { model } => {
            commands::status(&client, model).await?;
        }
        Commands::Health => {
            commands::health(&client).await?;
        }
        Commands::Chat {
            model,
            prompt,
            source,
            max_tokens,
        } => {
            commands::chat(&client, model, prompt, source, max_tokens).await?;
        }
    }

    Ok(())
}
