use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api_envelope::OAuthError;
use crate::config::Config;
use crate::identity::{IdentityError, IdentitySource, SocialNetwork, UserRecord};
use crate::store::ClientRecord;

pub const LOGIN_SCOPE: &str = "login";

/// Grant fields of a ticket request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionGrantRequest {
    pub grant_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_email_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantType {
    Id,
    Network(SocialNetwork),
    Email,
    Unknown(String),
}

impl GrantType {
    /// Splits a grant type URN. `None` when it lives outside `namespace`.
    pub fn parse(namespace: &str, grant_type: &str) -> Option<Self> {
        let suffix = grant_type.strip_prefix(namespace)?;
        Some(match suffix {
            "id" => Self::Id,
            "email" => Self::Email,
            other => match SocialNetwork::parse(other) {
                Some(network) => Self::Network(network),
                None => Self::Unknown(other.to_string()),
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedGrant {
    pub user: UserRecord,
    /// Action carried by an emailed ticket.
    pub x_action: Option<String>,
}

#[derive(Clone)]
pub struct ExtensionGrantResolver {
    namespace: String,
    identities: Arc<dyn IdentitySource>,
}

impl ExtensionGrantResolver {
    pub fn new(namespace: impl Into<String>, identities: Arc<dyn IdentitySource>) -> Self {
        Self {
            namespace: namespace.into(),
            identities,
        }
    }

    pub fn from_config(config: &Config, identities: Arc<dyn IdentitySource>) -> Self {
        Self::new(config.grant_type_namespace.clone(), identities)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn grant_type(&self, grant_type: GrantType) -> String {
        let suffix = match &grant_type {
            GrantType::Id => "id",
            GrantType::Email => "email",
            GrantType::Network(network) => network.as_str(),
            GrantType::Unknown(suffix) => suffix.as_str(),
        };
        format!("{}{suffix}", self.namespace)
    }

    /// Resolves `request` to an account on behalf of `client`.
    ///
    /// `caller_has_login` reports whether the calling session itself holds
    /// the `login` capability.
    pub async fn resolve(
        &self,
        request: &ExtensionGrantRequest,
        client: &ClientRecord,
        caller_has_login: bool,
    ) -> Result<ResolvedGrant, OAuthError> {
        let Some(grant_type) = GrantType::parse(&self.namespace, &request.grant_type) else {
            return Err(OAuthError::unsupported_grant_type(
                "Unknown or unsupported grant type namespace",
            ));
        };

        if !client.has_scope(LOGIN_SCOPE) && !caller_has_login {
            return Err(OAuthError::unauthorized_client(
                "Client missing 'login' scope",
            ));
        }

        let user_id = request.x_user_id.as_deref().unwrap_or_default();
        match grant_type {
            GrantType::Id => {
                let user = self.identities.user_by_id(user_id).await.map_err(lookup_failed)?;
                user.map(|user| ResolvedGrant {
                    user,
                    x_action: None,
                })
                .ok_or_else(|| OAuthError::invalid_grant("Unknown local account"))
            }
            GrantType::Network(network) => {
                let user = self
                    .identities
                    .user_by_network(network, user_id)
                    .await
                    .map_err(lookup_failed)?;
                user.map(|user| ResolvedGrant {
                    user,
                    x_action: None,
                })
                .ok_or_else(|| {
                    OAuthError::invalid_grant(format!(
                        "Unknown {} account: {user_id}",
                        network.label()
                    ))
                })
            }
            GrantType::Email => {
                let token = request.x_email_token.as_deref().unwrap_or_default();
                match self.identities.redeem_email_ticket(token).await {
                    Ok(redemption) => {
                        tracing::info!(
                            target: "waypost.grants",
                            user = %redemption.user.id,
                            action = %redemption.ticket.action,
                            "email ticket redeemed",
                        );
                        Ok(ResolvedGrant {
                            user: redemption.user,
                            x_action: Some(redemption.ticket.action),
                        })
                    }
                    Err(IdentityError::Rejected { message }) => {
                        Err(OAuthError::invalid_grant(message))
                    }
                    Err(error) => Err(lookup_failed(error)),
                }
            }
            GrantType::Unknown(suffix) => Err(OAuthError::unsupported_grant_type(format!(
                "Unknown or unsupported grant type: {suffix}"
            ))),
        }
    }
}

fn lookup_failed(error: IdentityError) -> OAuthError {
    tracing::warn!(target: "waypost.grants", error = %error, "identity lookup failed");
    OAuthError::server_error("Failed loading account")
}
