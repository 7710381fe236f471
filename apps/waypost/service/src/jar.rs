//! Signed, browser-bound holder for OAuth state carried between the consent
//! page and its form submission.
//!
//! Value format: `<base64url(json)>.<base64url(hmac)>`, signed with
//! HMAC-SHA256 under `HMAC-SHA256(jar secret, browser id)`, so a jar lifted
//! from one browser does not open in another.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::Config;
use crate::envelope::random_string;

type HmacSha256 = Hmac<Sha256>;

pub const JAR_COOKIE_NAME: &str = "jar";
pub const BROWSER_COOKIE_NAME: &str = "browser";
const BROWSER_ID_LEN: usize = 32;
const BROWSER_COOKIE_MAX_AGE_SECONDS: u64 = 31_536_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthJar {
    pub client: String,
    pub redirection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct JarPayload {
    #[serde(flatten)]
    jar: OAuthJar,
    expires: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum JarError {
    #[error("failed to encode jar payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to key jar signature")]
    Key,
}

#[derive(Clone)]
pub struct JarSealer {
    secret: String,
    ttl_seconds: u64,
}

impl std::fmt::Debug for JarSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JarSealer")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl JarSealer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            secret: config.jar_secret.clone(),
            ttl_seconds: config.jar_ttl_seconds,
        }
    }

    pub fn seal(&self, browser_id: &str, jar: &OAuthJar) -> Result<String, JarError> {
        self.seal_at(browser_id, jar, Utc::now())
    }

    fn seal_at(
        &self,
        browser_id: &str,
        jar: &OAuthJar,
        now: DateTime<Utc>,
    ) -> Result<String, JarError> {
        let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        let payload = JarPayload {
            jar: jar.clone(),
            expires: now.timestamp().saturating_add(ttl),
        };
        let segment = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);

        let mut mac = self.signer(browser_id)?;
        mac.update(segment.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{segment}.{signature}"))
    }

    /// Opens a jar sealed for `browser_id`; tampered, foreign or stale jars
    /// read as absent.
    pub fn open(&self, browser_id: &str, value: &str) -> Option<OAuthJar> {
        self.open_at(browser_id, value, Utc::now())
    }

    fn open_at(&self, browser_id: &str, value: &str, now: DateTime<Utc>) -> Option<OAuthJar> {
        let (segment, signature) = value.split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let mut mac = self.signer(browser_id).ok()?;
        mac.update(segment.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            tracing::debug!(target: "waypost.oauth", "jar signature mismatch");
            return None;
        }

        let payload: JarPayload =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment).ok()?).ok()?;
        if payload.expires <= now.timestamp() {
            tracing::debug!(target: "waypost.oauth", "jar expired");
            return None;
        }
        Some(payload.jar)
    }

    pub fn cookie(&self, value: &str) -> String {
        format!(
            "{JAR_COOKIE_NAME}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.ttl_seconds
        )
    }

    pub fn clear_cookie(&self) -> String {
        format!("{JAR_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
    }

    fn signer(&self, browser_id: &str) -> Result<HmacSha256, JarError> {
        let mut derive =
            HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| JarError::Key)?;
        derive.update(browser_id.as_bytes());
        let key = derive.finalize().into_bytes();
        HmacSha256::new_from_slice(&key).map_err(|_| JarError::Key)
    }
}

pub fn new_browser_id() -> String {
    random_string(BROWSER_ID_LEN)
}

pub fn browser_cookie(browser_id: &str) -> String {
    format!(
        "{BROWSER_COOKIE_NAME}={browser_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={BROWSER_COOKIE_MAX_AGE_SECONDS}"
    )
}
