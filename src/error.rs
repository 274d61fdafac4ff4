//! Error types for the invoice pipeline.
//!
//! [`ExtractionError`] covers everything that can go wrong between the OCR
//! text and a parsed record. The pipeline never returns it to callers: it is
//! turned into a `warning` outcome carrying the fallback record.
//!
//! [`IngestError`] is the hard-failure side. A rejected content type is the
//! only one a client should normally see.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Credential missing; no request was sent.
    #[error("{credential} NOT SET")]
    Configuration { credential: String },

    #[error("Extraction service error: {0}")]
    Service(String),

    #[error("Empty response from extraction service")]
    EmptyResponse,

    #[error("No JSON object found in model response: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid file type '{content_type}'. Only images and PDFs are allowed.")]
    Validation { content_type: String },

    #[error("Failed to store upload '{filename}': {source}")]
    Io {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}
