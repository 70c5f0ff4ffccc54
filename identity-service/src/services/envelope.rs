//! Envelope encryption for freshly issued API key secrets.
//!
//! The secret is sealed before the key row is written, so a sealing failure
//! aborts issuance with nothing persisted. Sealed output is handed to the
//! background queue for delivery to a secret store; the plaintext is only
//! ever returned to the caller once.

use base64::{engine::general_purpose, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::CredentialConfig;
use crate::services::error::ServiceError;
use crate::services::metrics::INSECURE_ENVELOPE_USES;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope key: {0}")]
    InvalidKey(String),

    #[error("sealing failed: {0}")]
    Seal(String),

    #[error("opening failed: {0}")]
    Open(String),
}

impl From<EnvelopeError> for ServiceError {
    fn from(err: EnvelopeError) -> Self {
        ServiceError::EncryptionFailure(err.to_string())
    }
}

/// Sealed form of a secret, bound to the key id it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub api_key_id: Uuid,
    pub algorithm: &'static str,
    /// `base64(nonce || ciphertext || tag)` for AES-GCM.
    pub ciphertext: String,
}

pub trait SecretEnvelope: Send + Sync {
    fn algorithm(&self) -> &'static str;

    /// False for envelopes that must never run in production.
    fn is_secure(&self) -> bool;

    fn seal(&self, api_key_id: Uuid, secret: &SecretString) -> Result<SealedSecret, EnvelopeError>;
}

/// AES-256-GCM with a random 96-bit nonce per secret. The API key id is
/// authenticated as additional data, so a sealed secret cannot be moved to
/// another key.
pub struct AesGcmEnvelope {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmEnvelope {
    pub const ALGORITHM: &'static str = "AES-256-GCM";

    pub fn new(key_bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes).map_err(|_| {
            EnvelopeError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                key_bytes.len()
            ))
        })?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from the base64 form used in `SECRET_ENVELOPE_KEY`.
    pub fn from_base64(encoded: &SecretString) -> Result<Self, EnvelopeError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|e| EnvelopeError::InvalidKey(format!("not valid base64: {}", e)))?;
        Self::new(&bytes)
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<SecretString, EnvelopeError> {
        let combined = general_purpose::STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|e| EnvelopeError::Open(format!("not valid base64: {}", e)))?;
        if combined.len() < NONCE_LEN {
            return Err(EnvelopeError::Open("sealed secret too short".to_string()));
        }

        let (nonce_bytes, encrypted) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| EnvelopeError::Open("invalid nonce".to_string()))?;

        let aad_context = sealed.api_key_id.to_string();
        let mut buffer = encrypted.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad_context.as_bytes()), &mut buffer)
            .map_err(|_| {
                EnvelopeError::Open("authentication failed (wrong key id or tampered)".to_string())
            })?;

        String::from_utf8(plaintext.to_vec())
            .map(SecretString::new)
            .map_err(|e| EnvelopeError::Open(format!("plaintext is not UTF-8: {}", e)))
    }
}

impl SecretEnvelope for AesGcmEnvelope {
    fn algorithm(&self) -> &'static str {
        Self::ALGORITHM
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn seal(&self, api_key_id: Uuid, secret: &SecretString) -> Result<SealedSecret, EnvelopeError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| EnvelopeError::Seal("failed to generate nonce".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let aad_context = api_key_id.to_string();
        let mut buffer = secret.expose_secret().as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(aad_context.as_bytes()), &mut buffer)
            .map_err(|_| EnvelopeError::Seal("AES-GCM seal failed".to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(buffer);

        Ok(SealedSecret {
            api_key_id,
            algorithm: Self::ALGORITHM,
            ciphertext: general_purpose::STANDARD.encode(combined),
        })
    }
}

/// Development stand-in that only encodes the secret. Every use is logged
/// and counted.
#[derive(Debug, Default, Clone)]
pub struct PassthroughEnvelope;

impl PassthroughEnvelope {
    pub const ALGORITHM: &'static str = "none";
}

impl SecretEnvelope for PassthroughEnvelope {
    fn algorithm(&self) -> &'static str {
        Self::ALGORITHM
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn seal(&self, api_key_id: Uuid, secret: &SecretString) -> Result<SealedSecret, EnvelopeError> {
        INSECURE_ENVELOPE_USES.inc();
        tracing::warn!(
            api_key_id = %api_key_id,
            "Secret sealed with the passthrough envelope; it is NOT encrypted"
        );
        Ok(SealedSecret {
            api_key_id,
            algorithm: Self::ALGORITHM,
            ciphertext: general_purpose::STANDARD.encode(secret.expose_secret().as_bytes()),
        })
    }
}

/// AES-GCM when a key is configured, passthrough otherwise.
pub fn build_envelope(config: &CredentialConfig) -> Result<Arc<dyn SecretEnvelope>, EnvelopeError> {
    match &config.envelope_key {
        Some(key) => {
            let envelope = AesGcmEnvelope::from_base64(key)?;
            tracing::info!(algorithm = AesGcmEnvelope::ALGORITHM, "Secret envelope ready");
            Ok(Arc::new(envelope))
        }
        None => {
            tracing::error!(
                "No SECRET_ENVELOPE_KEY configured; issued secrets will be forwarded unencrypted"
            );
            Ok(Arc::new(PassthroughEnvelope))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> AesGcmEnvelope {
        AesGcmEnvelope::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn sealed_secret_is_bound_to_its_key_id() {
        let env = envelope();
        let secret = SecretString::new("s3cr3t-value".to_string());
        let sealed = env.seal(Uuid::new_v4(), &secret).unwrap();

        assert_eq!(
            env.open(&sealed).unwrap().expose_secret(),
            secret.expose_secret()
        );

        let moved = SealedSecret {
            api_key_id: Uuid::new_v4(),
            ..sealed
        };
        assert!(matches!(env.open(&moved), Err(EnvelopeError::Open(_))));
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let env = envelope();
        let secret = SecretString::new("plain-secret-material".to_string());
        let id = Uuid::new_v4();
        let a = env.seal(id, &secret).unwrap();
        let b = env.seal(id, &secret).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert!(!a.ciphertext.contains("plain-secret-material"));
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            AesGcmEnvelope::new(&[0u8; 16]),
            Err(EnvelopeError::InvalidKey(_))
        ));
        let bad = SecretString::new("not base64!".to_string());
        assert!(AesGcmEnvelope::from_base64(&bad).is_err());
    }

    #[test]
    fn unconfigured_key_selects_passthrough() {
        let env = build_envelope(&CredentialConfig::default()).unwrap();
        assert!(!env.is_secure());
        assert_eq!(env.algorithm(), "none");
    }
}
