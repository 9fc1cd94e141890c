//! Plain-text extraction from uploaded document bytes.
use std::path::Path;

use docx_rs::{DocumentChild, ParagraphChild, RunChild};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("{0}")]
    Failed(String),
}

/// Turns raw document bytes into text, given a format hint such as `"pdf"`.
pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, raw: &[u8], format_hint: &str) -> Result<String, ExtractError>;
}

/// Lowercased file extension used as the format hint.
#[must_use]
pub fn format_hint(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Handles plain text, PDF (lopdf) and DOCX (docx-rs).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl TextExtractor for DefaultExtractor {
    fn extract_text(&self, raw: &[u8], format_hint: &str) -> Result<String, ExtractError> {
        match format_hint.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "txt" | "text" | "md" | "markdown" | "csv" | "log" => extract_plain(raw),
            "pdf" => extract_pdf(raw),
            "docx" => extract_docx(raw),
            "" => Err(ExtractError::UnsupportedFormat(
                "file has no extension".to_string(),
            )),
            other => Err(ExtractError::UnsupportedFormat(other.to_string())),
        }
    }
}

fn extract_plain(raw: &[u8]) -> Result<String, ExtractError> {
    let raw = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);
    String::from_utf8(raw.to_vec())
        .map_err(|e| ExtractError::Failed(format!("not valid UTF-8: {e}")))
}

fn extract_pdf(raw: &[u8]) -> Result<String, ExtractError> {
    let doc = lopdf::Document::load_mem(raw)
        .map_err(|e| ExtractError::Failed(format!("unreadable PDF: {e}")))?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Ok(String::new());
    }
    doc.extract_text(&pages)
        .map_err(|e| ExtractError::Failed(format!("PDF text extraction failed: {e}")))
}

fn extract_docx(raw: &[u8]) -> Result<String, ExtractError> {
    let docx = docx_rs::read_docx(raw)
        .map_err(|e| ExtractError::Failed(format!("unreadable DOCX: {e}")))?;

    let mut text = String::new();
    for child in &docx.document.children {
        if let DocumentChild::Paragraph(paragraph) = child {
            for item in &paragraph.children {
                if let ParagraphChild::Run(run) = item {
                    for part in &run.children {
                        if let RunChild::Text(t) = part {
                            text.push_str(&t.text);
                        }
                    }
                }
            }
            text.push('\n');
        }
    }
    Ok(text)
}
