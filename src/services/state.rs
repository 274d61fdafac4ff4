use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::db::Database;
use crate::models::Settings;
use crate::services::crypto::CredentialVault;
use crate::services::openai::{FieldExtractor, OpenAIExtractor, API_KEY_VAR};
use crate::services::processor::InvoicePipeline;
use crate::services::text_extraction::{TesseractRecognizer, TextRecognizer};
use crate::services::voucher::VoucherOptions;

pub const VAULT_SERVICE: &str = "invoice-tally";
pub const API_KEY_SETTING: &str = "openai_api_key";
pub const DB_FILE: &str = "invoices.sqlite";

/// Settings keys that can be stored in the database, with the environment
/// variable that overrides each one.
pub const SETTING_KEYS: [(&str, &str); 6] = [
    ("model", "INVOICE_TALLY_MODEL"),
    ("api_base", "INVOICE_TALLY_API_BASE"),
    ("temperature", "INVOICE_TALLY_TEMPERATURE"),
    ("ocr_language", "INVOICE_TALLY_OCR_LANG"),
    ("company_name", "INVOICE_TALLY_COMPANY"),
    ("state_name", "INVOICE_TALLY_STATE"),
];

/// Everything built once at startup: settings, the database handle and the
/// pipeline with its recognizer and extractor.
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub settings: Settings,
    pub pipeline: InvoicePipeline,
}

impl AppState {
    pub fn initialize(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Create data dir {}", data_dir.display()))?;
        let db = Database::new(&data_dir.join(DB_FILE)).context("Open database")?;
        let settings = load_settings(&db, data_dir)?;

        let recognizer: Arc<dyn TextRecognizer> =
            Arc::new(TesseractRecognizer::new(settings.ocr_language.clone()));
        let extractor: Arc<dyn FieldExtractor> = Arc::new(OpenAIExtractor::new(&settings));
        if settings.openai_api_key.is_none() {
            warn!("{} not configured; uploads will fall back to placeholder records", API_KEY_VAR);
        }
        info!(data_dir = %settings.data_dir.display(), model = %settings.model, "Application state ready");

        Ok(Self::with_components(settings, db, recognizer, extractor))
    }

    pub fn with_components(
        settings: Settings,
        db: Database,
        recognizer: Arc<dyn TextRecognizer>,
        extractor: Arc<dyn FieldExtractor>,
    ) -> Self {
        let db = Arc::new(Mutex::new(db));
        let pipeline = InvoicePipeline::new(db.clone(), recognizer, extractor, settings.upload_dir());
        AppState {
            db,
            settings,
            pipeline,
        }
    }

    pub fn voucher_options(&self) -> VoucherOptions {
        VoucherOptions::from(&self.settings)
    }

    pub fn with_db<T>(&self, f: impl FnOnce(&Database) -> rusqlite::Result<T>) -> Result<T> {
        let db = self.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        f(&db).map_err(|e| anyhow!("Database: {}", e))
    }
}

pub fn load_settings(db: &Database, data_dir: PathBuf) -> Result<Settings> {
    load_settings_with(db, data_dir, |name| std::env::var(name).ok())
}

/// Environment beats the settings table, which beats built-in defaults.
pub fn load_settings_with(
    db: &Database,
    data_dir: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    let mut settings = Settings::with_data_dir(data_dir);
    let lookup = |key: &str, var: &str| -> Result<Option<String>> {
        if let Some(value) = env(var).filter(|v| !v.trim().is_empty()) {
            return Ok(Some(value));
        }
        Ok(db.get_setting(key)?)
    };

    for (key, var) in SETTING_KEYS {
        let Some(value) = lookup(key, var)? else {
            continue;
        };
        match key {
            "model" => settings.model = value,
            "api_base" => settings.api_base = value,
            "temperature" => {
                settings.temperature = value
                    .parse()
                    .with_context(|| format!("Invalid temperature '{}'", value))?
            }
            "ocr_language" => settings.ocr_language = value,
            "company_name" => settings.company_name = value,
            "state_name" => settings.state_name = value,
            _ => {}
        }
    }

    settings.openai_api_key = match env(API_KEY_VAR).filter(|v| !v.trim().is_empty()) {
        Some(key) => Some(key),
        None => match db.get_setting(API_KEY_SETTING)? {
            Some(stored) => match CredentialVault::new(VAULT_SERVICE).reveal(&stored) {
                Ok(key) => Some(key),
                Err(err) => {
                    warn!(error = %err, "Stored API key could not be decrypted");
                    None
                }
            },
            None => None,
        },
    };

    Ok(settings)
}
