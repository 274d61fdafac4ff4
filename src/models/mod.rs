use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Expense category the model is asked to pick for the whole invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Travel,
    Food,
    #[serde(rename = "Office Supplies")]
    OfficeSupplies,
    Utilities,
    Software,
    Others,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Travel,
        Category::Food,
        Category::OfficeSupplies,
        Category::Utilities,
        Category::Software,
        Category::Others,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Travel => "Travel",
            Category::Food => "Food",
            Category::OfficeSupplies => "Office Supplies",
            Category::Utilities => "Utilities",
            Category::Software => "Software",
            Category::Others => "Others",
        }
    }

    /// Case- and separator-insensitive match ("office_supplies" works).
    pub fn parse_label(label: &str) -> Option<Category> {
        let wanted = squash(label);
        Category::ALL
            .into_iter()
            .find(|category| squash(category.as_str()) == wanted)
    }
}

fn squash(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical invoice record.
///
/// Typed fields stay `None` when the model omitted them; every field the
/// model emitted outside the canonical set lands in `extra` and is written
/// back out as a top-level key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gstin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Map<String, Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InvoiceRecord {
    /// Record substituted when extraction fails: every canonical field set.
    pub fn fallback(today: NaiveDate) -> Self {
        InvoiceRecord {
            invoice_number: Some("PENDING".to_string()),
            date: Some(today.format("%Y-%m-%d").to_string()),
            vendor_name: Some("Unknown Vendor".to_string()),
            gstin: Some(String::new()),
            subtotal: Some(0.0),
            tax_amount: Some(0.0),
            total_amount: Some(0.0),
            items: Some(Vec::new()),
            category: Some(Category::Others),
            extra: Map::new(),
        }
    }

    pub fn total_or_zero(&self) -> f64 {
        self.total_amount.unwrap_or(0.0)
    }

    pub fn tax_or_zero(&self) -> f64 {
        self.tax_amount.unwrap_or(0.0)
    }

    pub fn items(&self) -> &[Map<String, Value>] {
        self.items.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Warning,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Warning => "warning",
        }
    }
}

impl FromStr for OutcomeStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(OutcomeStatus::Success),
            "warning" => Ok(OutcomeStatus::Warning),
            other => Err(format!("Unknown outcome status: {}", other)),
        }
    }
}

/// A document handed to the pipeline.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// The saved copy of an upload, as seen by OCR and the extractor.
#[derive(Debug, Clone)]
pub struct DocumentRef {
    pub path: PathBuf,
    pub content_type: String,
}

impl DocumentRef {
    pub fn is_pdf(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("application/pdf")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub id: String,
    pub filename: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub extracted_data: InvoiceRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredInvoice {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub file_hash: String,
    pub status: OutcomeStatus,
    pub message: Option<String>,
    pub invoice_number: String,
    pub date: String,
    pub vendor_name: String,
    pub total_amount: f64,
    pub category: String,
    pub extracted_data: InvoiceRecord,
    pub created_at: String,
}

impl StoredInvoice {
    /// Builds the row for a freshly processed upload. Denormalized columns
    /// get their own defaults so listings never show blanks.
    pub fn from_outcome(
        outcome: &UploadOutcome,
        content_type: &str,
        file_hash: &str,
        created_at: String,
    ) -> Self {
        let record = &outcome.extracted_data;
        StoredInvoice {
            id: outcome.id.clone(),
            filename: outcome.filename.clone(),
            content_type: content_type.to_string(),
            file_hash: file_hash.to_string(),
            status: outcome.status,
            message: outcome.message.clone(),
            invoice_number: record
                .invoice_number
                .clone()
                .unwrap_or_else(|| "N/A".to_string()),
            date: record.date.clone().unwrap_or_default(),
            vendor_name: record
                .vendor_name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            total_amount: record.total_or_zero(),
            category: record
                .category
                .unwrap_or(Category::Others)
                .as_str()
                .to_string(),
            extracted_data: record.clone(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub id: String,
    pub invoice_id: Option<String>,
    pub stage: String,
    pub status: String,
    pub message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Plaintext extraction-service credential, resolved at startup.
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub model: String,
    pub api_base: String,
    pub temperature: f32,
    pub ocr_language: String,
    pub data_dir: PathBuf,
    pub company_name: String,
    pub state_name: String,
}

impl Settings {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Settings {
            openai_api_key: None,
            model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            temperature: 0.1,
            ocr_language: "eng".to_string(),
            data_dir,
            company_name: "Company Name".to_string(),
            state_name: "State".to_string(),
        }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}
