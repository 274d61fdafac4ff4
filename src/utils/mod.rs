use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Millisecond precision keeps back-to-back uploads ordered.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Content type from the file extension, `application/octet-stream` when unknown.
pub fn guess_content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Parses amounts such as `"₹ 1,500.00"`, `"1.234,56"` or `"-18"`.
///
/// A lone comma followed by exactly three digits is read as a thousands
/// separator, any other lone comma as the decimal mark.
pub fn parse_decimal(value: &str) -> Result<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return Err(anyhow!("Parse decimal: no digits in {:?}", value));
    }

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) => {
            let tail = &cleaned[comma + 1..];
            if tail.len() == 3 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        _ => cleaned,
    };

    normalized
        .parse::<f64>()
        .map_err(|e| anyhow!("Parse decimal: {}", e))
}

pub fn normalize_date(value: Option<String>) -> Option<String> {
    let raw = value?.trim().to_string();
    if raw.is_empty() {
        return None;
    }

    let formats = [
        "%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d", "%Y.%m.%d", "%d-%m-%Y", "%d %b %Y",
        "%d %B %Y", "%b %d, %Y", "%B %d, %Y",
    ];
    for fmt in formats.iter() {
        if let Ok(date) = NaiveDate::parse_from_str(&raw, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    Some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimals_with_symbols_and_separators() {
        assert_eq!(parse_decimal("₹ 1,500.00").unwrap(), 1500.0);
        assert_eq!(parse_decimal("1.234,56").unwrap(), 1234.56);
        assert_eq!(parse_decimal("12,5").unwrap(), 12.5);
        assert_eq!(parse_decimal("1,500").unwrap(), 1500.0);
        assert_eq!(parse_decimal("$-18").unwrap(), -18.0);
        assert!(parse_decimal("n/a").is_err());
    }

    #[test]
    fn dates_are_normalized() {
        assert_eq!(normalize_date(Some("27.10.2023".into())).as_deref(), Some("2023-10-27"));
        assert_eq!(normalize_date(Some("27/10/2023".into())).as_deref(), Some("2023-10-27"));
        assert_eq!(normalize_date(Some("27-10-2023".into())).as_deref(), Some("2023-10-27"));
        assert_eq!(normalize_date(Some("Oct 27, 2023".into())).as_deref(), Some("2023-10-27"));
        assert_eq!(normalize_date(Some("sometime".into())).as_deref(), Some("sometime"));
        assert_eq!(normalize_date(Some("  ".into())), None);
        assert_eq!(normalize_date(None), None);
    }

    #[test]
    fn content_types_from_extension() {
        assert_eq!(guess_content_type(Path::new("scan.PNG")), "image/png");
        assert_eq!(guess_content_type(Path::new("bill.pdf")), "application/pdf");
        assert_eq!(guess_content_type(Path::new("notes.txt")), "text/plain");
        assert_eq!(guess_content_type(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
