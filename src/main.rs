//! text2audio - turn text or documents into speech from the command line.

use clap::Parser;
use std::error::Error;
use std::io::Read;
use std::path::PathBuf;
use text2audio::backends::piper::PiperParams;
use text2audio::chunking;
use text2audio::config_loader::SETTINGS;
use text2audio::document::{self, ExtractOptions};
use text2audio::model_repo;
use text2audio::{Backend, PiperOptions, SynthesisRequest, Synthesizer};
use tracing_subscriber::EnvFilter;

/// Text → Audio
#[derive(Parser)]
#[command(name = "text2audio")]
#[command(version)]
#[command(about = "Synthesize speech with gTTS, espeak-ng (pyttsx3) or Piper voices", long_about = None)]
struct Cli {
    /// Text to speak. If neither --text nor --file is given, stdin is read
    #[arg(short, long)]
    text: Option<String>,

    /// Read text from a .txt, .docx or .pdf file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Use OCR for PDF input (needs pdftoppm and tesseract)
    #[arg(long)]
    ocr: bool,

    /// Backend: gtts, pyttsx3 or piper
    #[arg(short, long)]
    backend: Option<String>,

    /// Language code (e.g. en, de, fr)
    #[arg(short, long)]
    lang: Option<String>,

    /// Output path; the extension is set by the backend (.mp3 or .wav)
    #[arg(short, long, default_value = "out.mp3")]
    out: PathBuf,

    /// Piper voice: registry key (see --list-models) or path to an .onnx file
    #[arg(long)]
    piper_model: Option<String>,

    #[arg(long)]
    length_scale: Option<f32>,

    #[arg(long)]
    noise_scale: Option<f32>,

    #[arg(long)]
    noise_w: Option<f32>,

    /// Split text longer than this many characters into numbered files plus a ZIP
    #[arg(long)]
    chunk_size: Option<usize>,

    /// List the Piper voice keys that can be downloaded
    #[arg(long)]
    list_models: bool,
}

fn read_input(cli: &Cli, ocr_lang: &str) -> Result<String, Box<dyn Error>> {
    if let Some(path) = &cli.file {
        let options = ExtractOptions {
            use_ocr: cli.ocr,
            ocr_lang: ocr_lang.to_string(),
        };
        return Ok(document::extract_text_from_path(path, &options, &|msg: &str| {
            eprintln!("{}", msg)
        })?);
    }
    if let Some(text) = &cli.text {
        return Ok(text.clone());
    }
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;
    Ok(text)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("text2audio=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = SETTINGS.read().map_err(|e| e.to_string())?.clone();

    if cli.list_models {
        for key in model_repo::model_keys() {
            println!("{}", key);
        }
        return Ok(());
    }

    let text = read_input(&cli, &settings.ocr_lang)?;
    if text.trim().is_empty() {
        eprintln!("No text provided.");
        std::process::exit(1);
    }

    let backend: Backend = cli
        .backend
        .as_deref()
        .unwrap_or(&settings.default_backend)
        .parse()?;
    let lang = cli.lang.clone().unwrap_or_else(|| settings.default_lang.clone());

    let req = SynthesisRequest::new(text, backend, cli.out.clone())
        .with_lang(lang)
        .with_piper(PiperOptions {
            model: cli.piper_model.clone(),
            params: PiperParams {
                length_scale: cli.length_scale,
                noise_scale: cli.noise_scale,
                noise_w: cli.noise_w,
            },
        });

    if let Some(size) = cli.chunk_size {
        chunking::check_chunk_size(size)?;
    }

    let synth = Synthesizer::from_settings(&settings);
    match cli.chunk_size {
        Some(size) if req.text.trim().chars().count() > size => {
            let out = chunking::synthesize_chunked(&synth, &req, size)?;
            for path in &out.outputs {
                println!("{}", path.display());
            }
            println!("{}", out.zip.display());
        }
        _ => {
            let path = synth.synthesize(&req)?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
