//! HMAC request signing bound to an issued ticket.
//!
//! A caller holding a ticket signs `METHOD\nPATH\nBODY` with the ticket key
//! and presents `Authorization: Oz token="<ticket id>", mac="<base64 mac>"`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use sha2::Sha256;

use crate::api_envelope::ApiError;
use crate::config::Config;
use crate::envelope::EnvelopeCodec;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    HmacSha1,
    HmacSha256,
}

impl MacAlgorithm {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hmac-sha-1" => Some(Self::HmacSha1),
            "hmac-sha-256" => Some(Self::HmacSha256),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha1 => "hmac-sha-1",
            Self::HmacSha256 => "hmac-sha-256",
        }
    }

    /// Base64 HMAC of `message` under `key`.
    pub fn sign(self, key: &str, message: &str) -> Option<String> {
        let digest = match self {
            Self::HmacSha1 => keyed::<HmacSha1>(key, message)?
                .finalize()
                .into_bytes()
                .to_vec(),
            Self::HmacSha256 => keyed::<HmacSha256>(key, message)?
                .finalize()
                .into_bytes()
                .to_vec(),
        };
        Some(STANDARD.encode(digest))
    }

    pub fn verify(self, key: &str, message: &str, mac: &str) -> bool {
        let Ok(expected) = STANDARD.decode(mac) else {
            return false;
        };
        match self {
            Self::HmacSha1 => keyed::<HmacSha1>(key, message)
                .is_some_and(|signer| signer.verify_slice(&expected).is_ok()),
            Self::HmacSha256 => keyed::<HmacSha256>(key, message)
                .is_some_and(|signer| signer.verify_slice(&expected).is_ok()),
        }
    }
}

fn keyed<M: Mac + KeyInit>(key: &str, message: &str) -> Option<M> {
    let mut signer = <M as Mac>::new_from_slice(key.as_bytes()).ok()?;
    signer.update(message.as_bytes());
    Some(signer)
}

pub fn request_message(method: &str, path: &str, body: &str) -> String {
    format!("{method}\n{path}\n{body}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OzCredentials {
    pub token: String,
    pub mac: String,
}

pub fn authorization_header(token: &str, mac: &str) -> String {
    format!("Oz token=\"{token}\", mac=\"{mac}\"")
}

/// Parses `Oz token="…", mac="…"`. Attribute order is free; both are required.
pub fn parse_authorization(raw: &str) -> Option<OzCredentials> {
    let attributes = raw.trim().strip_prefix("Oz ")?;
    let mut token = None;
    let mut mac = None;

    for attribute in attributes.split(',') {
        let (name, value) = attribute.trim().split_once('=')?;
        let value = value.trim().strip_prefix('"')?.strip_suffix('"')?;
        match name.trim() {
            "token" => token = Some(value.to_string()),
            "mac" => mac = Some(value.to_string()),
            _ => {}
        }
    }

    Some(OzCredentials {
        token: token.filter(|value| !value.is_empty())?,
        mac: mac.filter(|value| !value.is_empty())?,
    })
}

#[derive(Deserialize)]
struct SigningClaims {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    algorithm: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MessageValidator {
    codec: EnvelopeCodec,
}

impl MessageValidator {
    pub fn new(codec: EnvelopeCodec) -> Self {
        Self { codec }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(EnvelopeCodec::from_passphrase(&config.ticket_secret))
    }

    /// Returns the user the ticket was issued to when `mac` signs `message`.
    pub fn validate(&self, message: &str, token: &str, mac: &str) -> Result<String, ApiError> {
        self.validate_at(message, token, mac, Utc::now())
    }

    pub fn validate_at(
        &self,
        message: &str,
        token: &str,
        mac: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ApiError> {
        let claims = self
            .codec
            .decrypt::<SigningClaims>(token)
            .ok_or_else(|| ApiError::not_found("Invalid token"))?;

        let (Some(user), Some(algorithm), Some(key)) = (
            claims.user.filter(|value| !value.is_empty()),
            claims.algorithm.filter(|value| !value.is_empty()),
            claims.key.filter(|value| !value.is_empty()),
        ) else {
            return Err(ApiError::not_found("Invalid token"));
        };

        if claims.expiration.is_some_and(|expiration| expiration <= now) {
            tracing::debug!(target: "waypost.session", user = %user, "signed request with expired ticket");
            return Err(ApiError::not_found("Invalid token"));
        }

        let Some(algorithm) = MacAlgorithm::parse(&algorithm) else {
            tracing::warn!(target: "waypost.session", algorithm = %algorithm, "ticket carries unknown algorithm");
            return Err(ApiError::internal("Unknown algorithm"));
        };

        if !algorithm.verify(&key, message, mac) {
            return Err(ApiError::unauthorized("Invalid mac"));
        }

        Ok(user)
    }
}
