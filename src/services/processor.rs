use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{ExtractionError, IngestError};
use crate::models::{DocumentRef, InvoiceRecord, OutcomeStatus, StoredInvoice, Upload, UploadOutcome};
use crate::services::normalizer::normalize_response;
use crate::services::openai::FieldExtractor;
use crate::services::text_extraction::TextRecognizer;
use crate::utils::{now_rfc3339, sha256_bytes, today};

/// Where one upload is in its single forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Received,
    OcrDone,
    ExtractionAttempted,
    Normalized,
    Degraded,
    Persisted,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStage::Received => "received",
            UploadStage::OcrDone => "ocr_done",
            UploadStage::ExtractionAttempted => "extraction_attempted",
            UploadStage::Normalized => "normalized",
            UploadStage::Degraded => "degraded",
            UploadStage::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// `"Image/PNG; q=1"` -> `"image/png"`
pub fn content_type_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_supported_content_type(content_type: &str) -> bool {
    let essence = content_type_essence(content_type);
    essence.starts_with("image/") || essence == "application/pdf"
}

#[derive(Clone)]
pub struct InvoicePipeline {
    db: Arc<Mutex<Database>>,
    recognizer: Arc<dyn TextRecognizer>,
    extractor: Arc<dyn FieldExtractor>,
    upload_dir: PathBuf,
}

impl InvoicePipeline {
    pub fn new(
        db: Arc<Mutex<Database>>,
        recognizer: Arc<dyn TextRecognizer>,
        extractor: Arc<dyn FieldExtractor>,
        upload_dir: PathBuf,
    ) -> Self {
        InvoicePipeline {
            db,
            recognizer,
            extractor,
            upload_dir,
        }
    }

    /// Runs one upload through OCR, extraction and normalization, then
    /// stores it. Extraction problems degrade to the fallback record; only
    /// a rejected content type or a storage failure is returned as `Err`.
    pub async fn process_upload(&self, upload: Upload) -> Result<UploadOutcome, IngestError> {
        if !is_supported_content_type(&upload.content_type) {
            warn!(filename = %upload.filename, content_type = %upload.content_type, "Rejected upload");
            return Err(IngestError::Validation {
                content_type: upload.content_type,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let file_hash = sha256_bytes(&upload.bytes);
        let document = self.store_upload(&id, &upload).await?;
        trace_stage(&id, UploadStage::Received);

        let ocr_text = self.run_ocr(&document).await;
        trace_stage(&id, UploadStage::OcrDone);

        let extracted = self.extractor.extract(&document, &ocr_text).await;
        trace_stage(&id, UploadStage::ExtractionAttempted);

        let outcome = match extracted.and_then(|raw| normalize_response(&raw)) {
            Ok(record) => {
                trace_stage(&id, UploadStage::Normalized);
                UploadOutcome {
                    id: id.clone(),
                    filename: upload.filename.clone(),
                    status: OutcomeStatus::Success,
                    message: None,
                    extracted_data: record,
                }
            }
            Err(err) => {
                warn!(id = %id, error = %err, "Extraction degraded to fallback record");
                trace_stage(&id, UploadStage::Degraded);
                degraded_outcome(&id, &upload.filename, &err)
            }
        };

        self.persist(&outcome, &upload.content_type, &file_hash)?;
        trace_stage(&id, UploadStage::Persisted);
        Ok(outcome)
    }

    async fn store_upload(&self, id: &str, upload: &Upload) -> Result<DocumentRef, IngestError> {
        let io_err = |source: std::io::Error| IngestError::Io {
            filename: upload.filename.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(io_err)?;
        let path = self
            .upload_dir
            .join(format!("{}{}", id, extension_of(&upload.filename)));
        tokio::fs::write(&path, &upload.bytes).await.map_err(io_err)?;

        Ok(DocumentRef {
            path,
            content_type: content_type_essence(&upload.content_type),
        })
    }

    /// OCR failures leave the extractor with the image alone.
    async fn run_ocr(&self, document: &DocumentRef) -> String {
        let recognizer = self.recognizer.clone();
        let doc = document.clone();
        let result = tokio::task::spawn_blocking(move || recognizer.recognize(&doc)).await;

        match result {
            Ok(Ok(text)) => {
                let (chars, excerpt) = ocr_preview(&text);
                debug!(chars, excerpt = %excerpt, "OCR text");
                text
            }
            Ok(Err(err)) => {
                warn!(path = %document.path.display(), error = %err, "OCR failed, continuing without text");
                String::new()
            }
            Err(join_err) => {
                warn!(path = %document.path.display(), error = %join_err, "OCR worker panicked, continuing without text");
                String::new()
            }
        }
    }

    fn persist(&self, outcome: &UploadOutcome, content_type: &str, file_hash: &str) -> Result<(), IngestError> {
        let row = StoredInvoice::from_outcome(outcome, content_type, file_hash, now_rfc3339());
        let db = self
            .db
            .lock()
            .map_err(|_| IngestError::Storage("DB lock poisoned".to_string()))?;
        db.save_invoice(&row)
            .map_err(|e| IngestError::Storage(e.to_string()))?;
        if let Err(err) = db.log_processing(
            Some(&outcome.id),
            "extraction",
            outcome.status.as_str(),
            outcome.message.as_deref(),
        ) {
            warn!(id = %outcome.id, error = %err, "Could not write processing log");
        }
        Ok(())
    }
}

fn degraded_outcome(id: &str, filename: &str, err: &ExtractionError) -> UploadOutcome {
    UploadOutcome {
        id: id.to_string(),
        filename: filename.to_string(),
        status: OutcomeStatus::Warning,
        message: Some(err.to_string()),
        extracted_data: InvoiceRecord::fallback(today()),
    }
}

/// Character count and leading excerpt of OCR text, for debug logs.
fn ocr_preview(text: &str) -> (usize, String) {
    (text.chars().count(), text.chars().take(500).collect())
}

fn trace_stage(id: &str, stage: UploadStage) {
    info!(id = %id, stage = %stage, "Upload stage");
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_gate() {
        assert!(is_supported_content_type("image/png"));
        assert!(is_supported_content_type("IMAGE/JPEG"));
        assert!(is_supported_content_type("application/pdf"));
        assert!(is_supported_content_type("application/pdf; charset=binary"));
        assert!(!is_supported_content_type("text/plain"));
        assert!(!is_supported_content_type("application/json"));
        assert!(!is_supported_content_type(""));
    }

    #[test]
    fn extensions_are_kept_lowercase() {
        assert_eq!(extension_of("Scan.JPG"), ".jpg");
        assert_eq!(extension_of("invoice"), "");
        assert_eq!(extension_of("a.b.pdf"), ".pdf");
    }

    #[test]
    fn ocr_preview_counts_characters() {
        let (chars, excerpt) = ocr_preview("₹ 1,500");
        assert_eq!(chars, 7);
        assert_eq!(excerpt, "₹ 1,500");

        let long = "é".repeat(600);
        let (chars, excerpt) = ocr_preview(&long);
        assert_eq!(chars, 600);
        assert_eq!(excerpt.chars().count(), 500);
    }

    #[test]
    fn degraded_outcome_carries_reason_and_fallback() {
        let err = ExtractionError::Configuration {
            credential: "OPENAI_API_KEY".to_string(),
        };
        let outcome = degraded_outcome("id-1", "scan.png", &err);
        assert_eq!(outcome.status, OutcomeStatus::Warning);
        assert_eq!(outcome.message.as_deref(), Some("OPENAI_API_KEY NOT SET"));
        assert_eq!(outcome.extracted_data.invoice_number.as_deref(), Some("PENDING"));
        assert_eq!(outcome.extracted_data.items, Some(Vec::new()));
    }
}
