//! URL-safe encrypted envelopes for session cookies, ticket tokens and other
//! small values handed to clients.
//!
//! A sealed value is the JSON document `{"v": value, "a": pad}` encrypted with
//! ChaCha20-Poly1305 under a key derived from a passphrase. The two-character
//! pad only perturbs the ciphertext of identical values. The nonce is prefixed
//! to the ciphertext and the result is base64 encoded with `+` → `-`,
//! `/` → `:` and the `=` padding removed.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::distr::Alphanumeric;
use rand::{Rng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const PAD_LEN: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to seal envelope: {message}")]
    Cipher { message: String },
}

#[derive(Clone)]
pub struct EnvelopeCodec {
    key: [u8; 32],
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec").finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SealedRef<'a, T> {
    v: &'a T,
    a: String,
}

#[derive(Deserialize)]
struct Sealed<T> {
    v: T,
}

impl EnvelopeCodec {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        Self { key }
    }

    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<String, EnvelopeError> {
        let plaintext = serde_json::to_vec(&SealedRef {
            v: value,
            a: random_string(PAD_LEN),
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let aead = self.cipher()?;
        let ciphertext = aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|error| EnvelopeError::Cipher {
                message: error.to_string(),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(STANDARD
            .encode(sealed)
            .replace('+', "-")
            .replace('/', ":")
            .trim_end_matches('=')
            .to_string())
    }

    /// Opens a token produced by [`EnvelopeCodec::encrypt`].
    ///
    /// Every failure (bad alphabet, wrong key, tampered bytes, unexpected
    /// shape) yields `None`; callers treat that as an absent value.
    pub fn decrypt<T: DeserializeOwned>(&self, token: &str) -> Option<T> {
        let normalized = token.replace('-', "+").replace(':', "/");
        let sealed = match STANDARD_NO_PAD.decode(normalized.as_bytes()) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::debug!(target: "waypost.envelope", error = %error, "envelope is not valid base64");
                return None;
            }
        };

        if sealed.len() <= NONCE_LEN {
            tracing::debug!(target: "waypost.envelope", len = sealed.len(), "envelope is too short");
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let aead = self.cipher().ok()?;
        let plaintext = match aead.decrypt(Nonce::from_slice(nonce), ciphertext) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!(target: "waypost.envelope", "envelope failed authentication");
                return None;
            }
        };

        match serde_json::from_slice::<Sealed<T>>(&plaintext) {
            Ok(envelope) => Some(envelope.v),
            Err(error) => {
                tracing::warn!(target: "waypost.envelope", error = %error, "invalid encrypted envelope");
                None
            }
        }
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, EnvelopeError> {
        ChaCha20Poly1305::new_from_slice(&self.key).map_err(|error| EnvelopeError::Cipher {
            message: error.to_string(),
        })
    }
}

/// Random ASCII alphanumeric string.
pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        user: String,
        tos: u32,
        scopes: Vec<String>,
    }

    fn sample() -> Sample {
        Sample {
            user: "usr_42".to_string(),
            tos: 20_110_623,
            scopes: vec!["login".to_string()],
        }
    }

    #[test]
    fn round_trip_restores_value() {
        let codec = EnvelopeCodec::from_passphrase("correct horse");
        let token = codec.encrypt(&sample()).expect("encrypt");
        assert_eq!(codec.decrypt::<Sample>(&token), Some(sample()));
    }

    #[test]
    fn token_alphabet_is_url_safe() {
        let codec = EnvelopeCodec::from_passphrase("correct horse");
        for _ in 0..32 {
            let token = codec.encrypt(&sample()).expect("encrypt");
            assert!(!token.contains('+'));
            assert!(!token.contains('/'));
            assert!(!token.contains('='));
        }
    }

    #[test]
    fn identical_values_produce_distinct_tokens() {
        let codec = EnvelopeCodec::from_passphrase("correct horse");
        let first = codec.encrypt(&sample()).expect("encrypt");
        let second = codec.encrypt(&sample()).expect("encrypt");
        assert_ne!(first, second);
    }

    #[test]
    fn wrong_key_yields_none() {
        let token = EnvelopeCodec::from_passphrase("one")
            .encrypt(&sample())
            .expect("encrypt");
        assert_eq!(
            EnvelopeCodec::from_passphrase("two").decrypt::<Sample>(&token),
            None
        );
    }

    #[test]
    fn flipping_any_character_yields_none() {
        let codec = EnvelopeCodec::from_passphrase("correct horse");
        let token = codec.encrypt(&sample()).expect("encrypt");

        for index in 0..token.len() {
            let mut chars: Vec<char> = token.chars().collect();
            chars[index] = if chars[index] == 'A' { 'B' } else { 'A' };
            let tampered: String = chars.into_iter().collect();
            assert_eq!(
                codec.decrypt::<Sample>(&tampered),
                None,
                "tampered index {index} decoded"
            );
        }
    }

    #[test]
    fn garbage_and_wrong_shape_yield_none() {
        let codec = EnvelopeCodec::from_passphrase("correct horse");
        assert_eq!(codec.decrypt::<Sample>(""), None);
        assert_eq!(codec.decrypt::<Sample>("not a token!"), None);

        let token = codec.encrypt(&"just a string").expect("encrypt");
        assert_eq!(codec.decrypt::<Sample>(&token), None);
        assert_eq!(
            codec.decrypt::<String>(&token).as_deref(),
            Some("just a string")
        );
    }

    #[test]
    fn random_string_has_requested_length() {
        let value = random_string(24);
        assert_eq!(value.len(), 24);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
