//! Encrypted datasource credentials.
//!
//! Any string in a datasource settings document may be stored sealed as
//! `ENC:` + base64(nonce || ciphertext || tag) with AES-256-GCM, keyed from the
//! server's `--crypto-key`. The engine only opens such values.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use serde_json::Value;
use std::num::NonZeroU32;

pub const KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

const PBKDF2_ITERATIONS: u32 = 100_000;

const PBKDF2_SALT: &[u8] = b"n9e-datasource-credentials-v1";

/// Marks a settings value as sealed
pub const ENCRYPTED_PREFIX: &str = "ENC:";

pub type CryptoKey = [u8; KEY_LENGTH];

/// PBKDF2-HMAC-SHA256 over the operator secret
pub fn derive_key(secret: &str) -> CryptoKey {
    let mut key = [0u8; KEY_LENGTH];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        PBKDF2_SALT,
        secret.as_bytes(),
        &mut key,
    );
    key
}

/// Open the base64 payload that followed the `ENC:` prefix
fn open(payload: &str, key: Option<&CryptoKey>) -> Result<String> {
    let key = key.context("value is sealed but no crypto key was supplied")?;
    let bytes = BASE64.decode(payload).context("sealed value is not base64")?;
    if bytes.len() <= NONCE_LENGTH {
        bail!("sealed value too short");
    }
    let (nonce, sealed) = bytes.split_at(NONCE_LENGTH);
    let plain = Aes256Gcm::new_from_slice(key)
        .context("invalid key length")?
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| anyhow!("wrong crypto key or corrupted value"))?;
    String::from_utf8(plain).context("opened value is not UTF-8")
}

/// Replace every sealed string in a settings document with its plaintext
pub fn decrypt_settings(settings: &mut Value, key: Option<&CryptoKey>) -> Result<()> {
    match settings {
        Value::String(s) => {
            if let Some(payload) = s.strip_prefix(ENCRYPTED_PREFIX) {
                let plain = open(payload, key)?;
                *s = plain;
            }
        }
        Value::Array(items) => {
            for item in items {
                decrypt_settings(item, key)?;
            }
        }
        Value::Object(map) => {
            for (field, value) in map.iter_mut() {
                decrypt_settings(value, key).with_context(|| format!("settings field '{}'", field))?;
            }
        }
        _ => {}
    }
    Ok(())
}
