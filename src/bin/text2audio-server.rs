//! text2audio-server - HTTP API and browser UI for text2audio.
//!
//! Usage:
//!   text2audio-server [--host 0.0.0.0] [--port 8000] [--output-dir data]

use clap::Parser;
use std::path::PathBuf;
use text2audio::api::{router, AppState};
use text2audio::config_loader::SETTINGS;
use text2audio::Synthesizer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "text2audio-server")]
#[command(version)]
#[command(about = "HTTP API for text2audio", long_about = None)]
struct Args {
    /// Address to bind (default from settings)
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Directory audio files are written to and served from
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("text2audio=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let settings = SETTINGS.read().map_err(|e| e.to_string())?.clone();

    let output_dir = args.output_dir.unwrap_or_else(|| settings.output_dir());
    std::fs::create_dir_all(&output_dir)?;
    let host = args.host.unwrap_or_else(|| settings.server_host.clone());
    let port = args.port.unwrap_or(settings.server_port);

    let state = AppState::new(Synthesizer::from_settings(&settings), output_dir.clone())
        .with_ocr_lang(settings.ocr_lang.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        output_dir = %output_dir.display(),
        "text2audio API listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
