use anyhow::{anyhow, Result};
use std::path::Path;

use crate::models::DocumentRef;

/// OCR boundary. Implementations are blocking and run on the worker pool.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, document: &DocumentRef) -> Result<String>;
}

pub struct TesseractRecognizer {
    language: String,
}

impl TesseractRecognizer {
    pub fn new(language: impl Into<String>) -> Self {
        TesseractRecognizer {
            language: language.into(),
        }
    }

    fn extract_from_pdf(&self, path: &Path) -> Result<String> {
        if let Ok(text) = pdf_extract::extract_text(path) {
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }
        self.extract_via_ocr(path)
    }

    fn extract_via_ocr(&self, path: &Path) -> Result<String> {
        let text = tesseract::Tesseract::new(None, Some(self.language.as_str()))
            .map_err(|e| anyhow!("Tesseract init: {}", e))?
            .set_image(path.to_str().ok_or_else(|| anyhow!("Invalid path"))?)
            .map_err(|e| anyhow!("Tesseract image: {}", e))?
            .recognize()
            .map_err(|e| anyhow!("Tesseract recognize: {}", e))?
            .get_text()
            .map_err(|e| anyhow!("OCR text: {}", e))?;
        Ok(text)
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, document: &DocumentRef) -> Result<String> {
        let raw = if document.is_pdf() {
            self.extract_from_pdf(&document.path)?
        } else {
            self.extract_via_ocr(&document.path)?
        };
        Ok(join_fragments(raw.lines()))
    }
}

/// One fragment per line, blanks dropped, engine order kept.
pub fn join_fragments<'a>(fragments: impl IntoIterator<Item = &'a str>) -> String {
    fragments
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
