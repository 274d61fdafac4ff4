use anyhow::{anyhow, Context, Result};

use crate::models::Settings;
use crate::services::crypto::CredentialVault;
use crate::services::openai::{self, API_KEY_VAR};
use crate::services::state::{AppState, API_KEY_SETTING, SETTING_KEYS, VAULT_SERVICE};

/// Effective value of `key` after environment and stored overrides.
pub fn get_setting(state: &AppState, key: &str) -> Result<String> {
    effective_value(&state.settings, key)
}

fn effective_value(settings: &Settings, key: &str) -> Result<String> {
    let value = match key {
        "model" => settings.model.clone(),
        "api_base" => settings.api_base.clone(),
        "temperature" => settings.temperature.to_string(),
        "ocr_language" => settings.ocr_language.clone(),
        "company_name" => settings.company_name.clone(),
        "state_name" => settings.state_name.clone(),
        API_KEY_SETTING => match settings.openai_api_key {
            Some(_) => "(set)".to_string(),
            None => "(not set)".to_string(),
        },
        other => return Err(unknown_key(other)),
    };
    Ok(value)
}

/// Stores `value` in the settings table. Takes effect on the next start,
/// and never over an environment variable for the same key.
pub fn save_setting(state: &AppState, key: &str, value: &str) -> Result<()> {
    if key == API_KEY_SETTING {
        return Err(anyhow!("Use `config set-api-key` to store {}", API_KEY_VAR));
    }
    let Some(&(_, env_var)) = SETTING_KEYS.iter().find(|(name, _)| *name == key) else {
        return Err(unknown_key(key));
    };
    if key == "temperature" {
        value
            .parse::<f32>()
            .with_context(|| format!("Invalid temperature '{}'", value))?;
    }
    if std::env::var(env_var).is_ok() {
        tracing::warn!(key, env_var, "Stored value is shadowed by the environment");
    }
    state.with_db(|db| db.set_setting(key, value))
}

pub fn save_api_key(state: &AppState, api_key: &str) -> Result<()> {
    save_api_key_with(state, &CredentialVault::new(VAULT_SERVICE), api_key)
}

pub fn save_api_key_with(state: &AppState, vault: &CredentialVault, api_key: &str) -> Result<()> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(anyhow!("API key is empty"));
    }
    let stored = vault.store(API_KEY_SETTING, api_key)?;
    state.with_db(|db| db.set_setting(API_KEY_SETTING, &stored))
}

/// Asks the extraction service whether the configured key is accepted.
pub async fn test_api_key(state: &AppState) -> Result<bool> {
    let api_key = state
        .settings
        .openai_api_key
        .as_deref()
        .ok_or_else(|| anyhow!("{} NOT SET", API_KEY_VAR))?;
    openai::test_api_key(&state.settings.api_base, api_key).await
}

fn unknown_key(key: &str) -> anyhow::Error {
    let known: Vec<&str> = SETTING_KEYS.iter().map(|(name, _)| *name).collect();
    anyhow!("Unknown setting '{}' (known: {}, {})", key, known.join(", "), API_KEY_SETTING)
}
