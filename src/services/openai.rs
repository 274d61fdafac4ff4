use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExtractionError;
use crate::models::{DocumentRef, Settings};

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Upper bound on OCR text forwarded with the prompt, in characters.
const OCR_EXCERPT_CHARS: usize = 12_000;

const EXTRACTION_PROMPT: &str = r#"You are a financial document analyst. Extract every significant field from the invoice you are given.

You receive two inputs:
1. RAW OCR TEXT: machine-read text of the document, possibly noisy or out of order.
2. The document itself as an image or PDF. Prefer it when the OCR text is unclear.

Output format:
- A single flat JSON object. Keys are lower_case_with_underscores (e.g. "gstin", "billing_address", "due_date").
- Always include "invoice_number", "date" (YYYY-MM-DD), "vendor_name", "gstin", "subtotal", "tax_amount" and "total_amount" when they appear on the document.
- "items": the line-item table as a list of objects with every available column (description, quantity, unit_price, discount, tax, amount). Use [] when there is no table.
- "category": exactly one of Travel, Food, Office Supplies, Utilities, Software, Others.

Rules:
- Return only the JSON object. No markdown fences, no commentary.
- Amounts are plain numbers without currency symbols or thousands separators.
- Leave out any field that is not on the document instead of guessing.

Example:
{"invoice_number": "INV-123", "date": "2023-10-27", "vendor_name": "Acme Corp", "gstin": "27AAAAA0000A1Z5", "subtotal": 1271.19, "tax_amount": 228.81, "total_amount": 1500.0, "items": [{"description": "Laptop Stand", "quantity": 1, "unit_price": 1271.19, "amount": 1271.19}], "category": "Office Supplies"}"#;

/// Turns OCR text plus the source document into the model's raw reply.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(
        &self,
        document: &DocumentRef,
        ocr_text: &str,
    ) -> Result<String, ExtractionError>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
}

#[derive(Debug, Serialize, PartialEq)]
struct ImageUrl {
    url: String,
    detail: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct FileData {
    filename: String,
    file_data: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct OpenAIExtractor {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_base: String,
    temperature: f32,
}

impl OpenAIExtractor {
    pub fn new(settings: &Settings) -> Self {
        OpenAIExtractor {
            client: reqwest::Client::new(),
            api_key: settings
                .openai_api_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            model: settings.model.clone(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            temperature: settings.temperature,
        }
    }

    async fn call_openai(&self, api_key: &str, content: Vec<ContentPart>) -> Result<String, ExtractionError> {
        let request = ChatRequest {
            model: self.model.clone(),
            temperature: self.temperature,
            messages: vec![Message {
                role: "user".to_string(),
                content,
            }],
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExtractionError::Service(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Service(format!("HTTP {}: {}", status, body)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Service(e.to_string()))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(ExtractionError::EmptyResponse);
        }
        Ok(content)
    }
}

#[async_trait]
impl FieldExtractor for OpenAIExtractor {
    async fn extract(
        &self,
        document: &DocumentRef,
        ocr_text: &str,
    ) -> Result<String, ExtractionError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ExtractionError::Configuration {
                credential: API_KEY_VAR.to_string(),
            })?;

        let bytes = tokio::fs::read(&document.path).await.map_err(|e| {
            ExtractionError::Service(format!("Read {}: {}", document.path.display(), e))
        })?;
        let filename = document
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "invoice".to_string());

        info!(model = %self.model, bytes = bytes.len(), "Calling extraction model");
        let content = build_user_content(ocr_text, &bytes, &document.content_type, &filename);
        let reply = self.call_openai(api_key, content).await?;
        debug!(reply = %reply, "Extraction model replied");
        Ok(reply)
    }
}

fn build_user_content(
    ocr_text: &str,
    bytes: &[u8],
    content_type: &str,
    filename: &str,
) -> Vec<ContentPart> {
    let data_url = format!(
        "data:{};base64,{}",
        content_type,
        general_purpose::STANDARD.encode(bytes)
    );
    let attachment = if content_type.eq_ignore_ascii_case("application/pdf") {
        ContentPart::File {
            file: FileData {
                filename: filename.to_string(),
                file_data: data_url,
            },
        }
    } else {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: data_url,
                detail: "high".to_string(),
            },
        }
    };

    vec![
        ContentPart::Text {
            text: format!(
                "{}\n\nRAW OCR TEXT:\n{}",
                EXTRACTION_PROMPT,
                ocr_excerpt(ocr_text)
            ),
        },
        attachment,
    ]
}

fn ocr_excerpt(text: &str) -> &str {
    match text.char_indices().nth(OCR_EXCERPT_CHARS) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

/// Checks a credential against the models endpoint.
pub async fn test_api_key(api_base: &str, api_key: &str) -> Result<bool> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/models", api_base.trim_end_matches('/')))
        .bearer_auth(api_key)
        .send()
        .await
        .map_err(|e| anyhow!("Connection failed: {}", e))?;

    Ok(response.status().is_success())
}
