use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default)]
    pub tos: u32,
    /// Linked social network accounts, keyed by network name.
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialNetwork {
    Twitter,
    Facebook,
    Yahoo,
}

impl SocialNetwork {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
            Self::Yahoo => "yahoo",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Twitter => "Twitter",
            Self::Facebook => "Facebook",
            Self::Yahoo => "Yahoo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "twitter" => Some(Self::Twitter),
            "facebook" => Some(Self::Facebook),
            "yahoo" => Some(Self::Yahoo),
            _ => None,
        }
    }
}

impl fmt::Display for SocialNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-use ticket mailed to a user (login links, address confirmation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailTicketRecord {
    pub token: String,
    pub user: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consumed: bool,
}

#[derive(Debug, Clone)]
pub struct EmailRedemption {
    pub ticket: EmailTicketRecord,
    pub user: UserRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The identity proof was looked at and refused; the message is client-facing.
    #[error("{message}")]
    Rejected { message: String },
    #[error("{message}")]
    Unavailable { message: String },
}

#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn user_by_id(&self, id: &str) -> Result<Option<UserRecord>, IdentityError>;

    async fn user_by_network(
        &self,
        network: SocialNetwork,
        account: &str,
    ) -> Result<Option<UserRecord>, IdentityError>;

    /// Consumes an emailed ticket and returns it together with its user.
    async fn redeem_email_ticket(&self, token: &str) -> Result<EmailRedemption, IdentityError>;
}
