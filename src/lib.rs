pub mod commands;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use error::{ExtractionError, IngestError};
pub use models::{Category, InvoiceRecord, OutcomeStatus, StoredInvoice, Upload, UploadOutcome};
pub use services::state::AppState;
