//! Plain text from `.txt`, `.docx` and `.pdf` files, with optional OCR for
//! scanned PDFs through `pdftoppm` and `tesseract`.

use crate::backends::find_on_path;
use crate::error::{Result, TtsError};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

const PDFTOPPM: &str = "pdftoppm";
const TESSERACT: &str = "tesseract";
const OCR_DPI: &str = "300";
const BODY_PART: &str = "word/document.xml";

lazy_static! {
    static ref PARAGRAPH_END: Regex = Regex::new(r"</w:p>").unwrap();
    static ref LINE_BREAK: Regex = Regex::new(r"<w:(?:br|cr)\b[^>]*/>").unwrap();
    static ref TAB: Regex = Regex::new(r"<w:tab\b[^>]*/>").unwrap();
    static ref TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref ENTITY: Regex = Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|[a-z]+);").unwrap();
    static ref HEADER_PART: Regex = Regex::new(r"^word/header\d*\.xml$").unwrap();
    static ref FOOTER_PART: Regex = Regex::new(r"^word/footer\d*\.xml$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub use_ocr: bool,
    /// Tesseract language spec, e.g. `eng+deu`
    pub ocr_lang: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            use_ocr: false,
            ocr_lang: "eng+deu".to_string(),
        }
    }
}

/// True when both OCR executables are on PATH.
pub fn has_ocr_stack() -> bool {
    find_on_path(PDFTOPPM).is_some() && find_on_path(TESSERACT).is_some()
}

/// Extracts text from `data`, choosing the format by `filename`'s
/// extension. `on_info` receives progress messages during OCR.
pub fn extract_text_from_bytes(
    filename: &str,
    data: &[u8],
    options: &ExtractOptions,
    on_info: &dyn Fn(&str),
) -> Result<String> {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" => Ok(decode_text(data)),
        "docx" => docx_text(data),
        "pdf" if options.use_ocr => ocr_pdf(data, &options.ocr_lang, on_info),
        "pdf" => pdf_extract::extract_text_from_mem(data)
            .map_err(|e| TtsError::Extraction(format!("PDF text extraction failed: {}", e))),
        _ => Err(TtsError::UnsupportedFileType(filename.to_string())),
    }
}

pub fn extract_text_from_path(
    path: &Path,
    options: &ExtractOptions,
    on_info: &dyn Fn(&str),
) -> Result<String> {
    let data = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    extract_text_from_bytes(&name, &data, options, on_info)
}

/// UTF-8, or Latin-1 when the bytes are not valid UTF-8.
fn decode_text(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(s) => s.to_string(),
        Err(_) => data.iter().map(|&b| b as char).collect(),
    }
}

fn docx_text(data: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| TtsError::Extraction(format!("Not a valid .docx archive: {}", e)))?;

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    if !names.iter().any(|n| n == BODY_PART) {
        return Err(TtsError::Extraction(format!("{} missing from .docx", BODY_PART)));
    }
    let mut headers: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| HEADER_PART.is_match(n))
        .collect();
    let mut footers: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| FOOTER_PART.is_match(n))
        .collect();
    headers.sort_unstable();
    footers.sort_unstable();

    let mut parts = headers;
    parts.push(BODY_PART);
    parts.extend(footers);

    let mut text = String::new();
    for name in parts {
        let mut xml = String::new();
        archive
            .by_name(name)
            .map_err(|e| TtsError::Extraction(format!("{}: {}", name, e)))?
            .read_to_string(&mut xml)?;
        text.push_str(&xml_to_text(&xml));
    }
    Ok(text.trim().to_string())
}

/// WordprocessingML to plain text: paragraphs and breaks become newlines,
/// tabs stay tabs, all other markup is dropped.
fn xml_to_text(xml: &str) -> String {
    let s = PARAGRAPH_END.replace_all(xml, "\n");
    let s = LINE_BREAK.replace_all(&s, "\n");
    let s = TAB.replace_all(&s, "\t");
    let s = TAG.replace_all(&s, "");
    unescape_xml(&s)
}

fn unescape_xml(s: &str) -> String {
    ENTITY
        .replace_all(s, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16)
                    .ok()
                    .and_then(char::from_u32),
                _ if entity.starts_with('#') => entity[1..].parse().ok().and_then(char::from_u32),
                _ => None,
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn ocr_pdf(data: &[u8], lang: &str, on_info: &dyn Fn(&str)) -> Result<String> {
    let pdftoppm = find_on_path(PDFTOPPM)
        .ok_or_else(|| TtsError::ExternalToolMissing(PDFTOPPM.to_string()))?;
    let tesseract = find_on_path(TESSERACT)
        .ok_or_else(|| TtsError::ExternalToolMissing(TESSERACT.to_string()))?;

    let work = tempfile::tempdir()?;
    let pdf = work.path().join("input.pdf");
    std::fs::write(&pdf, data)?;

    run_tool(
        PDFTOPPM,
        Command::new(&pdftoppm)
            .args(["-r", OCR_DPI, "-png"])
            .arg(&pdf)
            .arg(work.path().join("page")),
    )?;

    let pages = rendered_pages(work.path())?;
    let total = pages.len();
    tracing::info!(pages = total, lang, "Running OCR");

    let mut out = Vec::with_capacity(total);
    for (i, page) in pages.iter().enumerate() {
        on_info(&format!("OCR page {}/{}…", i + 1, total));
        let text = run_tool(
            TESSERACT,
            Command::new(&tesseract)
                .arg(page)
                .arg("stdout")
                .args(["-l", lang]),
        )?;
        out.push(text);
    }
    Ok(out.join("\n"))
}

/// `pdftoppm` writes `page-1.png`, `page-01.png`, ... depending on the page
/// count; the padding keeps lexical order equal to page order.
fn rendered_pages(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().is_some_and(|e| e == "png")
                && p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("page-"))
        })
        .collect();
    pages.sort();
    Ok(pages)
}

fn run_tool(tool: &str, cmd: &mut Command) -> Result<String> {
    tracing::debug!(command = ?cmd, "Running OCR tool");
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(TtsError::ExternalToolFailed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
