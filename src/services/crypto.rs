use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::{aead, pbkdf2, rand::{SecureRandom, SystemRandom}};
use std::num::NonZeroU32;

const VAULT_SECRET: &[u8] = b"invoice-tally-vault-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const KEYCHAIN_PREFIX: &str = "keychain:";
const SEALED_PREFIX: &str = "enc:";

/// Keeps credentials out of the settings table in plaintext. The OS keychain
/// is tried first; the stored value is then only a reference to it.
pub struct CredentialVault {
    service: String,
    use_keychain: bool,
}

impl CredentialVault {
    pub fn new(service: impl Into<String>) -> Self {
        CredentialVault {
            service: service.into(),
            use_keychain: true,
        }
    }

    /// Vault that never touches the OS keychain.
    pub fn sealed_only(service: impl Into<String>) -> Self {
        CredentialVault {
            service: service.into(),
            use_keychain: false,
        }
    }

    /// Returns the value to persist for `secret`.
    pub fn store(&self, account: &str, secret: &str) -> Result<String> {
        if self.use_keychain {
            match self.store_in_keychain(account, secret) {
                Ok(reference) => return Ok(reference),
                Err(err) => tracing::debug!(error = %err, "Keychain unavailable, sealing locally"),
            }
        }
        seal(secret)
    }

    /// Inverse of [`CredentialVault::store`].
    pub fn reveal(&self, stored: &str) -> Result<String> {
        if let Some(reference) = stored.strip_prefix(KEYCHAIN_PREFIX) {
            return self.retrieve_from_keychain(reference);
        }
        if stored.starts_with(SEALED_PREFIX) {
            return unseal(stored);
        }
        Err(anyhow!("Unknown credential format"))
    }

    fn store_in_keychain(&self, account: &str, secret: &str) -> Result<String> {
        keyring::Entry::new(&self.service, account)
            .map_err(|e| anyhow!("Keychain error: {}", e))?
            .set_password(secret)
            .map_err(|e| anyhow!("Keychain store error: {}", e))?;
        Ok(format!("{}{}:{}", KEYCHAIN_PREFIX, self.service, account))
    }

    fn retrieve_from_keychain(&self, reference: &str) -> Result<String> {
        let (service, account) = reference
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid keychain reference"))?;
        if service != self.service {
            return Err(anyhow!("Keychain reference belongs to '{}'", service));
        }
        keyring::Entry::new(service, account)
            .map_err(|e| anyhow!("Keychain error: {}", e))?
            .get_password()
            .map_err(|e| anyhow!("Keychain fetch error: {}", e))
    }
}

fn seal(plaintext: &str) -> Result<String> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| anyhow!("Failed to generate salt"))?;

    let key = derive_key(&salt)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("Failed to generate nonce"))?;

    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
    let mut in_out = plaintext.as_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| anyhow!("Encryption failed"))?;

    Ok(format!(
        "{}{}:{}:{}",
        SEALED_PREFIX,
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(nonce_bytes),
        general_purpose::STANDARD.encode(in_out)
    ))
}

fn unseal(sealed: &str) -> Result<String> {
    let body = sealed
        .strip_prefix(SEALED_PREFIX)
        .ok_or_else(|| anyhow!("Invalid sealed payload"))?;
    let parts: Vec<&str> = body.split(':').collect();
    let [salt, nonce_bytes, data] = parts.as_slice() else {
        return Err(anyhow!("Invalid sealed payload"));
    };
    let decode = |part: &str, what: &str| {
        general_purpose::STANDARD
            .decode(part)
            .map_err(|e| anyhow!("Decode {}: {}", what, e))
    };
    let salt = decode(*salt, "salt")?;
    let nonce_bytes = decode(*nonce_bytes, "nonce")?;
    let mut data = decode(*data, "ciphertext")?;

    let key = derive_key(&salt)?;
    let nonce = aead::Nonce::assume_unique_for_key(
        nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("Invalid nonce length"))?,
    );

    let decrypted = key
        .open_in_place(nonce, aead::Aad::empty(), &mut data)
        .map_err(|_| anyhow!("Decryption failed"))?;
    Ok(String::from_utf8(decrypted.to_vec())?)
}

fn derive_key(salt: &[u8]) -> Result<aead::LessSafeKey> {
    let mut key_bytes = [0u8; 32];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| anyhow!("Invalid iterations"))?;
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        VAULT_SECRET,
        &mut key_bytes,
    );
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("Invalid key material"))?;
    Ok(aead::LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_credentials_round_trip() {
        let vault = CredentialVault::sealed_only("invoice-tally-test");
        let stored = vault.store("openai_api_key", "sk-test-123").unwrap();
        assert!(stored.starts_with(SEALED_PREFIX));
        assert!(!stored.contains("sk-test-123"));
        assert_eq!(vault.reveal(&stored).unwrap(), "sk-test-123");
    }

    #[test]
    fn sealing_is_salted() {
        assert_ne!(seal("same").unwrap(), seal("same").unwrap());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let stored = seal("secret").unwrap();
        let mut tampered = stored.clone();
        tampered.pop();
        tampered.push(if stored.ends_with('A') { 'B' } else { 'A' });
        assert!(unseal(&tampered).is_err());
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let vault = CredentialVault::sealed_only("invoice-tally-test");
        assert!(vault.reveal("sk-plaintext").is_err());
        assert!(vault.reveal("enc:only-one-part").is_err());
        assert!(vault.reveal("keychain:other-app:openai_api_key").is_err());
    }
}
