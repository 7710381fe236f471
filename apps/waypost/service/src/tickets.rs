use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api_envelope::{ApiError, OAuthError};
use crate::config::Config;
use crate::envelope::{EnvelopeCodec, random_string};
use crate::extension_grant::{ExtensionGrantRequest, ExtensionGrantResolver, LOGIN_SCOPE};
use crate::grants::GrantAuthority;
use crate::identity::{IdentitySource, UserRecord};
use crate::message_signature::MacAlgorithm;
use crate::store::{ClientRecord, RecordStore};

const TICKET_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketExt {
    pub tos: u32,
}

/// Credentials handed to a client. `id` is the sealed claims and doubles as
/// the token presented on signed requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub user: String,
    pub client: String,
    pub algorithm: String,
    pub key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiration: DateTime<Utc>,
    pub ext: TicketExt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TicketClaims {
    user: String,
    client: String,
    algorithm: String,
    key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expiration: DateTime<Utc>,
    ext: TicketExt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRequest {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(flatten)]
    pub grant: ExtensionGrantRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReissueRequest {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub ticket: String,
}

/// Public view of a client record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl From<ClientRecord> for ClientInfo {
    fn from(client: ClientRecord) -> Self {
        Self {
            name: client.name,
            title: client.title,
            description: client.description,
            callback: client.callback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    pub tos: u32,
}

/// Who is calling the ticket endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// No credentials, or a client without the `login` capability.
    Anonymous,
    /// A first-party caller holding `login`; it may act for other clients.
    Trusted,
}

#[derive(Clone)]
pub struct TicketIssuer {
    store: Arc<dyn RecordStore>,
    identities: Arc<dyn IdentitySource>,
    grants: GrantAuthority,
    resolver: ExtensionGrantResolver,
    codec: EnvelopeCodec,
    ticket_ttl: Option<Duration>,
    grant_ttl: Option<Duration>,
}

impl TicketIssuer {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn RecordStore>,
        identities: Arc<dyn IdentitySource>,
    ) -> Self {
        Self {
            grants: GrantAuthority::new(Arc::clone(&store)),
            resolver: ExtensionGrantResolver::from_config(config, Arc::clone(&identities)),
            codec: EnvelopeCodec::from_passphrase(&config.ticket_secret),
            ticket_ttl: seconds(config.ticket_ttl_seconds),
            grant_ttl: seconds(config.grant_ttl_seconds),
            store,
            identities,
        }
    }

    pub fn resolver(&self) -> &ExtensionGrantResolver {
        &self.resolver
    }

    /// Resolves Basic credentials presented by a caller.
    pub async fn authenticate_caller(
        &self,
        credentials: Option<(String, String)>,
    ) -> Result<Caller, OAuthError> {
        let Some((id, secret)) = credentials else {
            return Ok(Caller::Anonymous);
        };

        let client = self.load_client(&id).await?;
        if !secret_matches(&client, &secret) {
            tracing::info!(target: "waypost.session", client = %id, "caller presented bad credentials");
            return Err(OAuthError::invalid_client("Invalid client credentials"));
        }

        Ok(if client.has_scope(LOGIN_SCOPE) {
            Caller::Trusted
        } else {
            Caller::Anonymous
        })
    }

    pub async fn issue(
        &self,
        request: &TicketRequest,
        caller: Caller,
    ) -> Result<Ticket, OAuthError> {
        let client = self
            .authenticate_client(&request.client_id, &request.client_secret, caller)
            .await?;

        let trusted = caller == Caller::Trusted;
        let resolved = self.resolver.resolve(&request.grant, &client, trusted).await?;

        if trusted && !client.has_scope(LOGIN_SCOPE) {
            let ttl = self
                .grant_ttl
                .ok_or_else(|| OAuthError::server_error("Grant lifetime out of range"))?;
            self.grants
                .grant(&resolved.user.id, &client.name, ttl)
                .await?;
        }

        let ticket = self.mint(&resolved.user, &client.name, resolved.x_action)?;
        tracing::info!(
            target: "waypost.session",
            user = %ticket.user,
            client = %ticket.client,
            "ticket issued",
        );
        Ok(ticket)
    }

    /// Trades a previously issued ticket, expired or not, for a fresh one.
    pub async fn reissue(
        &self,
        request: &ReissueRequest,
        caller: Caller,
    ) -> Result<Ticket, OAuthError> {
        let client = self
            .authenticate_client(&request.client_id, &request.client_secret, caller)
            .await?;

        let claims = self
            .codec
            .decrypt::<TicketClaims>(&request.ticket)
            .ok_or_else(|| OAuthError::invalid_grant("Invalid ticket"))?;

        if claims.client != client.name {
            return Err(OAuthError::invalid_grant("Ticket issued to a different client"));
        }

        if !client.has_scope(LOGIN_SCOPE) {
            self.grants
                .check_authorization(&claims.user, &client.name)
                .await?;
        }

        let user = self
            .identities
            .user_by_id(&claims.user)
            .await
            .map_err(|error| {
                tracing::warn!(target: "waypost.session", error = %error, "failed loading ticket user");
                OAuthError::server_error("Failed loading account")
            })?
            .ok_or_else(|| OAuthError::invalid_grant("Unknown local account"))?;

        let ticket = self.mint(&user, &client.name, None)?;
        tracing::info!(
            target: "waypost.session",
            user = %ticket.user,
            client = %ticket.client,
            "ticket reissued",
        );
        Ok(ticket)
    }

    pub async fn client_info(&self, id: &str) -> Result<ClientInfo, ApiError> {
        match self.store.client_by_name(id).await {
            Ok(Some(client)) => Ok(client.into()),
            Ok(None) => Err(ApiError::not_found("Unknown application")),
            Err(error) => {
                tracing::warn!(target: "waypost.store", client = id, error = %error, "client lookup failed");
                Err(ApiError::internal("Failed loading client"))
            }
        }
    }

    pub async fn profile(&self, user_id: &str) -> Result<Profile, ApiError> {
        match self.identities.user_by_id(user_id).await {
            Ok(Some(user)) => Ok(Profile {
                id: user.id,
                display: user.display,
                tos: user.tos,
            }),
            Ok(None) => Err(ApiError::not_found("Unknown account")),
            Err(error) => {
                tracing::warn!(target: "waypost.store", user = user_id, error = %error, "profile lookup failed");
                Err(ApiError::internal("Failed loading profile"))
            }
        }
    }

    async fn load_client(&self, id: &str) -> Result<ClientRecord, OAuthError> {
        match self.store.client_by_name(id).await {
            Ok(Some(client)) => Ok(client),
            Ok(None) => Err(OAuthError::invalid_client("Unknown client")),
            Err(error) => {
                tracing::warn!(target: "waypost.store", client = id, error = %error, "client lookup failed");
                Err(OAuthError::server_error("Failed loading client"))
            }
        }
    }

    async fn authenticate_client(
        &self,
        id: &str,
        secret: &str,
        caller: Caller,
    ) -> Result<ClientRecord, OAuthError> {
        let client = self.load_client(id).await?;
        if caller != Caller::Trusted && !secret_matches(&client, secret) {
            return Err(OAuthError::invalid_client("Invalid client credentials"));
        }
        Ok(client)
    }

    fn mint(
        &self,
        user: &UserRecord,
        client: &str,
        x_action: Option<String>,
    ) -> Result<Ticket, OAuthError> {
        let expiration = self
            .ticket_ttl
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| {
                tracing::warn!(target: "waypost.session", "ticket lifetime overflows the clock");
                OAuthError::server_error("Ticket lifetime out of range")
            })?;
        let claims = TicketClaims {
            user: user.id.clone(),
            client: client.to_string(),
            algorithm: MacAlgorithm::HmacSha256.as_str().to_string(),
            key: random_string(TICKET_KEY_LEN),
            expiration,
            ext: TicketExt { tos: user.tos },
        };

        let id = self.codec.encrypt(&claims).map_err(|error| {
            tracing::warn!(target: "waypost.session", error = %error, "failed sealing ticket");
            OAuthError::server_error("Failed issuing ticket")
        })?;

        Ok(Ticket {
            id,
            user: claims.user,
            client: claims.client,
            algorithm: claims.algorithm,
            key: claims.key,
            expiration: claims.expiration,
            ext: claims.ext,
            x_action,
        })
    }
}

fn secret_matches(client: &ClientRecord, secret: &str) -> bool {
    !client.secret.is_empty() && client.secret == secret
}

fn seconds(value: u64) -> Option<Duration> {
    i64::try_from(value).ok().and_then(Duration::try_seconds)
}
