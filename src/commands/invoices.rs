use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::models::{InvoiceRecord, ProcessingLog, StoredInvoice, Upload, UploadOutcome};
use crate::services::normalizer::normalize_record;
use crate::services::state::AppState;
use crate::services::voucher::render_voucher_today;
use crate::services::watcher::run_inbox;
use crate::utils::guess_content_type;

#[derive(Debug, Serialize)]
pub struct InvoiceDetail {
    pub invoice: StoredInvoice,
    pub logs: Vec<ProcessingLog>,
}

/// Where `export` takes its record from.
#[derive(Debug, Clone)]
pub enum ExportSource {
    Stored(String),
    File(PathBuf),
}

pub async fn upload_file(
    state: &AppState,
    path: &Path,
    content_type: Option<String>,
) -> Result<UploadOutcome> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("Not a file: {}", path.display()))?;
    let content_type = content_type.unwrap_or_else(|| guess_content_type(path));

    let outcome = state
        .pipeline
        .process_upload(Upload {
            filename,
            content_type,
            bytes,
        })
        .await?;
    Ok(outcome)
}

pub fn list_invoices(state: &AppState) -> Result<Vec<StoredInvoice>> {
    state.with_db(|db| db.get_all_invoices())
}

pub fn get_invoice_detail(state: &AppState, id: &str) -> Result<InvoiceDetail> {
    let invoice = state
        .with_db(|db| db.get_invoice_by_id(id))?
        .ok_or_else(|| anyhow!("Invoice not found: {}", id))?;
    let logs = state.with_db(|db| db.get_processing_logs(id))?;
    Ok(InvoiceDetail { invoice, logs })
}

pub fn export_voucher(state: &AppState, source: &ExportSource) -> Result<String> {
    let record = match source {
        ExportSource::Stored(id) => get_invoice_detail(state, id)?.invoice.extracted_data,
        ExportSource::File(path) => read_record_file(path)?,
    };
    Ok(render_voucher_today(&record, &state.voucher_options()))
}

/// Reads a hand-written or previously exported record. It goes through the
/// same coercion as model output so amounts like `"1,500.00"` are accepted.
fn read_record_file(path: &Path) -> Result<InvoiceRecord> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("Parse {}", path.display()))?;
    let Value::Object(object) = value else {
        return Err(anyhow!("{} does not hold a JSON object", path.display()));
    };
    Ok(normalize_record(object)?)
}

pub async fn watch_folder(state: &AppState, folder: &Path) -> Result<()> {
    if !folder.is_dir() {
        return Err(anyhow!("Not a directory: {}", folder.display()));
    }
    run_inbox(state, folder).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::models::OutcomeStatus;
    use crate::test_support::state_in;

    const REPLY: &str = r#"```json
{"invoice_number": "INV-1", "vendor_name": "Acme", "total_amount": 100, "tax_amount": 18}
```"#;

    #[tokio::test]
    async fn upload_then_show_and_export() {
        let data = tempfile::tempdir().unwrap();
        let state = state_in(data.path(), REPLY);
        let file = data.path().join("receipt.jpg");
        std::fs::write(&file, b"jpeg bytes").unwrap();

        let outcome = upload_file(&state, &file, None).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Success);

        let detail = get_invoice_detail(&state, &outcome.id).unwrap();
        assert_eq!(detail.invoice.vendor_name, "Acme");
        assert_eq!(detail.invoice.content_type, "image/jpeg");
        assert_eq!(detail.logs.len(), 1);

        let xml = export_voucher(&state, &ExportSource::Stored(outcome.id.clone())).unwrap();
        assert!(xml.contains("<VOUCHERNUMBER>INV-1</VOUCHERNUMBER>"));
        assert!(xml.contains("<AMOUNT>100.00</AMOUNT>"));
        assert!(xml.contains("<AMOUNT>-82.00</AMOUNT>"));
    }

    #[tokio::test]
    async fn explicit_content_type_wins_over_extension() {
        let data = tempfile::tempdir().unwrap();
        let state = state_in(data.path(), REPLY);
        let file = data.path().join("scan.png");
        std::fs::write(&file, b"bytes").unwrap();

        let err = upload_file(&state, &file, Some("text/plain".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::Validation { .. })
        ));
        assert!(list_invoices(&state).unwrap().is_empty());
    }

    #[test]
    fn export_from_json_file() {
        let data = tempfile::tempdir().unwrap();
        let state = state_in(data.path(), REPLY);
        let file = data.path().join("record.json");
        std::fs::write(
            &file,
            r#"{"invoice_number": "B-7", "vendor_name": "Kiosk & Co", "total_amount": "1,180.00", "tax_amount": 180}"#,
        )
        .unwrap();

        let xml = export_voucher(&state, &ExportSource::File(file)).unwrap();
        assert!(xml.contains("<PARTYLEDGERNAME>Kiosk &amp; Co</PARTYLEDGERNAME>"));
        assert!(xml.contains("<AMOUNT>1180.00</AMOUNT>"));
        assert!(xml.contains("<AMOUNT>-1000.00</AMOUNT>"));
    }

    #[test]
    fn unknown_id_and_non_object_file_fail() {
        let data = tempfile::tempdir().unwrap();
        let state = state_in(data.path(), REPLY);
        assert!(export_voucher(&state, &ExportSource::Stored("missing".to_string())).is_err());

        let file = data.path().join("list.json");
        std::fs::write(&file, "[1, 2]").unwrap();
        assert!(export_voucher(&state, &ExportSource::File(file)).is_err());
    }
}
