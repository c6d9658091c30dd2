//! Splits long texts into fixed-size pieces, synthesizes each piece and
//! packs the audio files into one ZIP archive.

use crate::dispatcher::{normalize_output_path, SynthesisRequest, Synthesizer};
use crate::error::{Result, TtsError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MIN_CHUNK_SIZE: usize = 200;
pub const MAX_CHUNK_SIZE: usize = 8000;
pub const DEFAULT_CHUNK_SIZE: usize = 1200;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChunkedOutput {
    pub outputs: Vec<PathBuf>,
    pub zip: PathBuf,
}

pub fn check_chunk_size(size: usize) -> Result<()> {
    if (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(TtsError::InvalidArgument(format!(
            "chunk_size must be between {} and {}, got {}",
            MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, size
        )))
    }
}

/// Consecutive pieces of `size` characters of the trimmed text. The last
/// piece may be shorter.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.trim().chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Path of chunk `idx` (1-based): `{stem}_{idx}.{ext}` next to `out`.
pub fn chunk_path(out: &Path, idx: usize) -> PathBuf {
    let stem = out
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "speech".to_string());
    let name = match out.extension() {
        Some(ext) => format!("{}_{}.{}", stem, idx, ext.to_string_lossy()),
        None => format!("{}_{}", stem, idx),
    };
    out.with_file_name(name)
}

/// Synthesizes `req.text` piece by piece. Every part and the archive land
/// beside `req.out`; the archive is named `{stem}.zip`.
pub fn synthesize_chunked(
    synth: &Synthesizer,
    req: &SynthesisRequest,
    chunk_size: usize,
) -> Result<ChunkedOutput> {
    check_chunk_size(chunk_size)?;
    let out = normalize_output_path(&req.out, req.backend);
    let pieces = chunk_text(&req.text, chunk_size);
    if pieces.is_empty() {
        return Err(TtsError::InvalidArgument("Text must not be empty".into()));
    }

    let mut outputs = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.into_iter().enumerate() {
        let idx = i + 1;
        tracing::info!(chunk = idx, chars = piece.chars().count(), "Synthesizing chunk");
        let part = SynthesisRequest {
            text: piece,
            out: chunk_path(&out, idx),
            ..req.clone()
        };
        outputs.push(synth.synthesize(&part)?);
    }

    let zip = out.with_extension("zip");
    write_zip(&zip, &outputs)?;
    tracing::info!(chunks = outputs.len(), zip = %zip.display(), "Chunked synthesis done");
    Ok(ChunkedOutput { outputs, zip })
}

/// Writes every file in `files` into a deflated archive at `dest`, each
/// under its bare file name.
pub fn write_zip(dest: &Path, files: &[PathBuf]) -> Result<()> {
    let zip_error = |e: zip::result::ZipError| TtsError::Runtime(format!("ZIP write failed: {}", e));

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TtsError::InvalidArgument(format!("Not a file: {}", path.display())))?;
        writer.start_file(name, options).map_err(zip_error)?;
        writer.write_all(&std::fs::read(path)?)?;
    }
    writer.finish().map_err(zip_error)?.flush()?;
    Ok(())
}
