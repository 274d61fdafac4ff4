use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use invoice_tally::db::Database;
use invoice_tally::models::{DocumentRef, Settings};
use invoice_tally::services::openai::{FieldExtractor, OpenAIExtractor};
use invoice_tally::services::text_extraction::TextRecognizer;
use invoice_tally::services::voucher::{render_voucher, VoucherOptions};
use invoice_tally::{AppState, Category, ExtractionError, IngestError, OutcomeStatus, Upload};

#[derive(Default)]
struct CountingRecognizer {
    calls: AtomicUsize,
    fail: bool,
}

impl TextRecognizer for CountingRecognizer {
    fn recognize(&self, _document: &DocumentRef) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("tesseract exploded");
        }
        Ok("ACME CORP\nInvoice INV-1\nTotal 100.00".to_string())
    }
}

struct CannedExtractor {
    reply: String,
    calls: AtomicUsize,
    seen_ocr: std::sync::Mutex<Vec<String>>,
}

impl CannedExtractor {
    fn new(reply: &str) -> Self {
        CannedExtractor {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            seen_ocr: Default::default(),
        }
    }
}

#[async_trait]
impl FieldExtractor for CannedExtractor {
    async fn extract(&self, document: &DocumentRef, ocr_text: &str) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(document.path.exists(), "upload must be saved before extraction");
        self.seen_ocr.lock().unwrap().push(ocr_text.to_string());
        Ok(self.reply.clone())
    }
}

fn png(name: &str) -> Upload {
    Upload {
        filename: name.to_string(),
        content_type: "image/png".to_string(),
        bytes: format!("fake image {}", name).into_bytes(),
    }
}

fn build_state(
    dir: &std::path::Path,
    recognizer: Arc<dyn TextRecognizer>,
    extractor: Arc<dyn FieldExtractor>,
) -> AppState {
    AppState::with_components(
        Settings::with_data_dir(dir.to_path_buf()),
        Database::new(&dir.join("invoices.sqlite")).unwrap(),
        recognizer,
        extractor,
    )
}

#[tokio::test]
async fn missing_credential_degrades_to_pending_record() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::with_data_dir(dir.path().to_path_buf());
    let state = build_state(
        dir.path(),
        Arc::new(CountingRecognizer::default()),
        Arc::new(OpenAIExtractor::new(&settings)),
    );

    let outcome = state.pipeline.process_upload(png("scan.png")).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Warning);
    assert!(outcome.message.as_deref().unwrap().contains("OPENAI_API_KEY"));
    assert_eq!(outcome.extracted_data.invoice_number.as_deref(), Some("PENDING"));
    assert_eq!(outcome.extracted_data.vendor_name.as_deref(), Some("Unknown Vendor"));
    assert_eq!(outcome.extracted_data.category, Some(Category::Others));

    let stored = state
        .with_db(|db| db.get_invoice_by_id(&outcome.id))
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OutcomeStatus::Warning);
    assert_eq!(stored.invoice_number, "PENDING");
}

#[tokio::test]
async fn fenced_reply_is_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let recognizer = Arc::new(CountingRecognizer::default());
    let extractor = Arc::new(CannedExtractor::new(
        "Here is the data:\n```json\n{\"invoice_number\": \"INV-1\", \"total_amount\": 100, \"tax_amount\": 18, \"category\": \"software\"}\n```",
    ));
    let state = build_state(dir.path(), recognizer.clone(), extractor.clone());

    let outcome = state.pipeline.process_upload(png("inv.png")).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.message, None);
    let record = &outcome.extracted_data;
    assert_eq!(record.invoice_number.as_deref(), Some("INV-1"));
    assert_eq!(record.total_amount, Some(100.0));
    assert_eq!(record.subtotal, Some(82.0));
    assert_eq!(record.category, Some(Category::Software));
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        extractor.seen_ocr.lock().unwrap().as_slice(),
        ["ACME CORP\nInvoice INV-1\nTotal 100.00".to_string()]
    );
}

#[tokio::test]
async fn listing_is_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(
        dir.path(),
        Arc::new(CountingRecognizer::default()),
        Arc::new(CannedExtractor::new("{\"vendor_name\": \"Acme\"}")),
    );

    let mut ids = Vec::new();
    for name in ["first.png", "second.png", "third.png"] {
        ids.push(state.pipeline.process_upload(png(name)).await.unwrap().id);
    }

    let listed: Vec<String> = state
        .with_db(|db| db.get_all_invoices())
        .unwrap()
        .into_iter()
        .map(|invoice| invoice.id)
        .collect();
    ids.reverse();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn unsupported_content_type_is_rejected_before_processing() {
    let dir = tempfile::tempdir().unwrap();
    let recognizer = Arc::new(CountingRecognizer::default());
    let extractor = Arc::new(CannedExtractor::new("{}"));
    let state = build_state(dir.path(), recognizer.clone(), extractor.clone());

    let err = state
        .pipeline
        .process_upload(Upload {
            filename: "notes.txt".to_string(),
            content_type: "text/plain".to_string(),
            bytes: b"hello".to_vec(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Validation { ref content_type } if content_type == "text/plain"));
    assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    assert!(state.with_db(|db| db.get_all_invoices()).unwrap().is_empty());
    assert!(!dir.path().join("uploads").exists());
}

#[tokio::test]
async fn prose_reply_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(
        dir.path(),
        Arc::new(CountingRecognizer::default()),
        Arc::new(CannedExtractor::new("I could not read this invoice, sorry.")),
    );

    let outcome = state.pipeline.process_upload(png("blurry.png")).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Warning);
    assert_eq!(outcome.extracted_data.category, Some(Category::Others));
    assert_eq!(outcome.extracted_data.total_amount, Some(0.0));
}

#[tokio::test]
async fn ocr_failure_still_reaches_the_extractor() {
    let dir = tempfile::tempdir().unwrap();
    let recognizer = Arc::new(CountingRecognizer {
        fail: true,
        ..Default::default()
    });
    let extractor = Arc::new(CannedExtractor::new("{\"invoice_number\": \"X-9\"}"));
    let state = build_state(dir.path(), recognizer, extractor.clone());

    let upload = Upload {
        content_type: "application/pdf".to_string(),
        ..png("bill.pdf")
    };
    let outcome = state.pipeline.process_upload(upload).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.extracted_data.invoice_number.as_deref(), Some("X-9"));
    assert_eq!(extractor.seen_ocr.lock().unwrap().as_slice(), [String::new()]);
}

#[tokio::test]
async fn stored_record_keeps_extra_fields_and_exports_stably() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(
        dir.path(),
        Arc::new(CountingRecognizer::default()),
        Arc::new(CannedExtractor::new(
            "{\"invoice_number\": \"T-3\", \"vendor_name\": \"Metro Cabs\", \"date\": \"05/02/2024\", \"total_amount\": \"590.00\", \"tax_amount\": 90, \"category\": \"Travel\", \"driver_name\": \"Ravi\"}",
        )),
    );

    let outcome = state.pipeline.process_upload(png("cab.png")).await.unwrap();
    let stored = state
        .with_db(|db| db.get_invoice_by_id(&outcome.id))
        .unwrap()
        .unwrap();

    assert_eq!(stored.extracted_data, outcome.extracted_data);
    assert_eq!(stored.date, "2024-02-05");
    assert_eq!(stored.total_amount, 590.0);
    assert_eq!(stored.category, "Travel");
    assert_eq!(
        stored.extracted_data.extra.get("driver_name"),
        Some(&serde_json::json!("Ravi"))
    );

    let today = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let options = VoucherOptions::default();
    let first = render_voucher(&stored.extracted_data, &options, today);
    let second = render_voucher(&stored.extracted_data, &options, today);
    assert_eq!(first, second);
    assert!(first.contains("<DATE>20240205</DATE>"));
    assert!(first.contains("<LEDGERNAME>Travel</LEDGERNAME>"));
    assert!(first.contains("<AMOUNT>-500.00</AMOUNT>"));
}
