use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod client;

use client::{ClientError, FaceClient};

#[derive(Parser)]
#[command(name = "facemirror", about = "FaceMirror face identification CLI")]
struct Cli {
    /// Daemon base URL
    #[arg(long, env = "FACEMIRROR_SERVER", default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the face in an image
    Recognize {
        /// Probe image
        image: PathBuf,
    },
    /// Add a face to the gallery
    Register {
        /// Identity name (one gallery folder per person)
        #[arg(short, long)]
        name: String,
        /// Image of the person
        image: PathBuf,
    },
    /// Run every configured model against an image
    Compare {
        image: PathBuf,
    },
    /// Reconcile the local mirror with the store now
    Sync,
    /// Show what a sync would download and delete
    Plan,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = FaceClient::new(&cli.server)?;

    let outcome = match cli.command {
        Commands::Recognize { image } => client.recognize(&image).await,
        Commands::Register { name, image } => client.register(&name, &image).await,
        Commands::Compare { image } => client.compare(&image).await,
        Commands::Sync => client.sync().await,
        Commands::Plan => client.plan().await,
        Commands::Status => client.health().await,
    };

    match outcome {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(ClientError::HttpStatus(status, body)) => {
            // Error bodies are structured too; show them before failing.
            println!("{}", serde_json::to_string_pretty(&body)?);
            anyhow::bail!("server answered {status}")
        }
        Err(e) => Err(e.into()),
    }
}
