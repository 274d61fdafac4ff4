use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::db::Database;
use crate::error::ExtractionError;
use crate::models::{DocumentRef, Settings};
use crate::services::openai::FieldExtractor;
use crate::services::state::AppState;
use crate::services::text_extraction::TextRecognizer;

pub struct NoText;

impl TextRecognizer for NoText {
    fn recognize(&self, _document: &DocumentRef) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Extractor that always answers with the same reply.
pub struct Canned(pub &'static str);

#[async_trait]
impl FieldExtractor for Canned {
    async fn extract(&self, _document: &DocumentRef, _ocr_text: &str) -> Result<String, ExtractionError> {
        Ok(self.0.to_string())
    }
}

pub fn state_in(dir: &Path, reply: &'static str) -> AppState {
    AppState::with_components(
        Settings::with_data_dir(dir.to_path_buf()),
        Database::open_in_memory().unwrap(),
        Arc::new(NoText),
        Arc::new(Canned(reply)),
    )
}
