//! Recovers a JSON object from free-form model output and coerces it onto
//! the canonical invoice schema.
//!
//! Recovery runs a fixed list of strategies and keeps the first object any
//! of them produces:
//!
//! 1. a fenced code block (optionally tagged `json`) holding an object
//! 2. the outermost `{...}` span of the reply
//! 3. the whole reply
//!
//! Coercion only reshapes values the model did send (numeric strings become
//! numbers, dates become `YYYY-MM-DD`, category labels are matched loosely).
//! The one derived value is `subtotal`, computed as `total_amount - tax_amount`
//! when the model gave both amounts but no subtotal.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::models::{Category, InvoiceRecord};
use crate::utils::{normalize_date, parse_decimal};

type Strategy = fn(&str) -> Option<Map<String, Value>>;

const STRATEGIES: [(&str, Strategy); 3] = [
    ("fenced block", from_fenced_block),
    ("brace span", from_brace_span),
    ("whole text", from_whole_text),
];

const STRING_FIELDS: [&str; 3] = ["invoice_number", "vendor_name", "gstin"];
const AMOUNT_FIELDS: [&str; 3] = ["subtotal", "tax_amount", "total_amount"];

static RE_FENCED_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Shape every coerced record must have. The coercers already drop what
/// they cannot convert, so a violation here means one of them let a wrong
/// type through; it is reported as a parse failure rather than stored.
static RECORD_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let categories: Vec<&str> = Category::ALL.iter().map(Category::as_str).collect();
    let schema = json!({
        "type": "object",
        "properties": {
            "invoice_number": {"type": "string"},
            "date": {"type": "string"},
            "vendor_name": {"type": "string"},
            "gstin": {"type": "string"},
            "subtotal": {"type": "number"},
            "tax_amount": {"type": "number"},
            "total_amount": {"type": "number"},
            "items": {"type": "array", "items": {"type": "object"}},
            "category": {"enum": categories}
        }
    });
    JSONSchema::compile(&schema).expect("Invalid invoice record schema")
});

/// Parses and coerces a model reply in one step.
pub fn normalize_response(raw: &str) -> Result<InvoiceRecord, ExtractionError> {
    let object = parse_model_response(raw)?;
    normalize_record(object)
}

/// Returns the first JSON object recovered by the strategy chain.
pub fn parse_model_response(raw: &str) -> Result<Map<String, Value>, ExtractionError> {
    STRATEGIES
        .iter()
        .find_map(|(name, strategy)| {
            let found = strategy(raw);
            if found.is_some() {
                debug!(strategy = *name, "Recovered JSON object from model reply");
            }
            found
        })
        .ok_or_else(|| ExtractionError::Parse(excerpt(raw)))
}

fn from_fenced_block(raw: &str) -> Option<Map<String, Value>> {
    RE_FENCED_OBJECT
        .captures_iter(raw)
        .find_map(|caps| parse_object(&caps[1]))
}

fn from_brace_span(raw: &str) -> Option<Map<String, Value>> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    parse_object(&raw[start..=end])
}

fn from_whole_text(raw: &str) -> Option<Map<String, Value>> {
    parse_object(raw.trim())
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "<empty reply>".to_string();
    }
    let mut cut: String = trimmed.chars().take(120).collect();
    if cut.len() < trimmed.len() {
        cut.push('…');
    }
    cut
}

/// Coerces canonical keys onto their schema types. Keys outside the
/// canonical set are left untouched.
pub fn normalize_record(mut object: Map<String, Value>) -> Result<InvoiceRecord, ExtractionError> {
    for key in STRING_FIELDS {
        coerce_field(&mut object, key, coerce_string);
    }
    for key in AMOUNT_FIELDS {
        coerce_field(&mut object, key, coerce_amount);
    }
    coerce_field(&mut object, "date", coerce_date);
    coerce_field(&mut object, "category", coerce_category);
    coerce_field(&mut object, "items", coerce_items);
    derive_subtotal(&mut object);

    let value = Value::Object(object);
    if let Err(errors) = RECORD_SCHEMA.validate(&value) {
        let detail = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ExtractionError::Parse(format!("schema violation: {}", detail)));
    }

    serde_json::from_value(value).map_err(|e| ExtractionError::Parse(e.to_string()))
}

fn coerce_field(object: &mut Map<String, Value>, key: &str, coerce: fn(Value) -> Option<Value>) {
    let Some(value) = object.remove(key) else {
        return;
    };
    if value.is_null() {
        return;
    }
    let shown = value.to_string();
    match coerce(value) {
        Some(coerced) => {
            object.insert(key.to_string(), coerced);
        }
        None => warn!(field = key, value = %shown, "Dropping field with unusable value"),
    }
}

fn coerce_string(value: Value) -> Option<Value> {
    match value {
        Value::String(text) => Some(Value::String(text.trim().to_string())),
        Value::Number(number) => Some(Value::String(number.to_string())),
        _ => None,
    }
}

fn coerce_amount(value: Value) -> Option<Value> {
    let amount = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_decimal(&text).ok(),
        _ => None,
    };
    // a 400-digit string parses to infinity, which JSON cannot hold
    amount.filter(|amount| amount.is_finite()).map(Value::from)
}

fn coerce_date(value: Value) -> Option<Value> {
    match value {
        Value::String(text) => normalize_date(Some(text)).map(Value::String),
        _ => None,
    }
}

fn coerce_category(value: Value) -> Option<Value> {
    let Value::String(label) = value else {
        return None;
    };
    let category = Category::parse_label(&label).unwrap_or_else(|| {
        warn!(label = %label, "Unknown category, filing under Others");
        Category::Others
    });
    Some(Value::String(category.as_str().to_string()))
}

fn coerce_items(value: Value) -> Option<Value> {
    let Value::Array(items) = value else {
        return None;
    };
    let kept: Vec<Value> = items.into_iter().filter(Value::is_object).collect();
    Some(Value::Array(kept))
}

fn derive_subtotal(object: &mut Map<String, Value>) {
    if object.contains_key("subtotal") {
        return;
    }
    let amount = |key: &str| object.get(key).and_then(Value::as_f64);
    if let (Some(total), Some(tax)) = (amount("total_amount"), amount("tax_amount")) {
        object.insert("subtotal".to_string(), Value::from(total - tax));
    }
}
