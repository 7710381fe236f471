use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api_envelope::ApiError;
use crate::endpoint::TicketEndpoint;
use crate::extension_grant::{ExtensionGrantRequest, ExtensionGrantResolver, GrantType};
use crate::jar::OAuthJar;
use crate::session::ActiveSession;
use crate::tickets::{Ticket, TicketRequest};

const MISSING_CLIENT_MESSAGE: &str = "sorry, the application that sent you here messed something up...";
const UNKNOWN_CLIENT_MESSAGE: &str = "sorry, we can't find the application that sent you here...";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub state: Option<String>,
}

/// A page the web tier renders; markup lives outside this service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct View {
    pub template: &'static str,
    pub locals: serde_json::Value,
}

impl View {
    fn error(code: serde_json::Value, message: &str) -> Self {
        Self {
            template: "error",
            locals: json!({ "code": code, "message": message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizeOutcome {
    View(View),
    /// Consent page; the jar has to travel with the browser to the form post.
    Consent { view: View, jar: OAuthJar },
    Redirect(String),
    Failure(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRedirect {
    pub location: String,
    /// Whether a jar was used up and should be cleared.
    pub consumed_jar: bool,
}

#[derive(Clone)]
pub struct OAuthFlow {
    endpoint: Arc<dyn TicketEndpoint>,
    id_grant_type: String,
}

impl OAuthFlow {
    pub fn new(endpoint: Arc<dyn TicketEndpoint>, resolver: &ExtensionGrantResolver) -> Self {
        Self {
            endpoint,
            id_grant_type: resolver.grant_type(GrantType::Id),
        }
    }

    pub async fn authorize(&self, query: &AuthorizeQuery) -> AuthorizeOutcome {
        let Some(client_id) = query.client_id.as_deref().filter(|id| !id.is_empty()) else {
            return AuthorizeOutcome::View(View::error(json!(500), MISSING_CLIENT_MESSAGE));
        };

        let client = match self.endpoint.client(client_id).await {
            Ok(client) if !client.name.is_empty() => client,
            Err(error) if error.is_not_found() => {
                tracing::info!(target: "waypost.oauth", client = client_id, "authorization for unknown client");
                return AuthorizeOutcome::View(View::error(
                    json!("unknown"),
                    UNKNOWN_CLIENT_MESSAGE,
                ));
            }
            Ok(_) => {
                return AuthorizeOutcome::Failure(ApiError::internal("Unexpected API response"));
            }
            Err(error) => {
                tracing::warn!(target: "waypost.oauth", client = client_id, error = %error, "client lookup failed");
                return AuthorizeOutcome::Failure(ApiError::internal("Unexpected API response"));
            }
        };

        let redirect_uri = query.redirect_uri.as_deref().filter(|uri| !uri.is_empty());
        let (redirection, untrusted) = match (client.callback.as_deref(), redirect_uri) {
            (Some(_), Some(_)) => {
                tracing::warn!(target: "waypost.oauth", client = %client.name, "redirect_uri sent for pre-configured client");
                return AuthorizeOutcome::Failure(ApiError::internal(
                    "Client request includes a redirection URI for a pre-configured callback client",
                ));
            }
            (Some(callback), None) => (callback.to_string(), false),
            (None, Some(redirect_uri)) => (redirect_uri.to_string(), true),
            (None, None) => {
                return AuthorizeOutcome::Failure(ApiError::internal("Client missing callback"));
            }
        };

        let state = query.state.as_deref().filter(|state| !state.is_empty());
        match query.response_type.as_deref() {
            Some("token") => {
                tracing::info!(target: "waypost.oauth", client = %client.name, untrusted, "presenting consent");
                AuthorizeOutcome::Consent {
                    view: View {
                        template: "oauth",
                        locals: json!({
                            "title": client.title,
                            "description": client.description,
                            "warning": untrusted,
                        }),
                    },
                    jar: OAuthJar {
                        client: client.name,
                        redirection,
                        state: state.map(str::to_string),
                    },
                }
            }
            Some("authorization_code") => AuthorizeOutcome::Redirect(error_redirect(
                &redirection,
                "unsupported_response_type",
                None,
                state,
            )),
            Some(_) => AuthorizeOutcome::Redirect(error_redirect(
                &redirection,
                "invalid_request",
                Some("Unknown response_type parameter"),
                state,
            )),
            None => AuthorizeOutcome::Redirect(error_redirect(
                &redirection,
                "invalid_request",
                Some("Missing response_type parameter"),
                state,
            )),
        }
    }

    /// Handles the consent form submission.
    pub async fn consent(
        &self,
        jar: Option<OAuthJar>,
        session: Option<&ActiveSession>,
    ) -> Result<ConsentRedirect, ApiError> {
        let Some(jar) = jar.filter(|jar| !jar.client.is_empty()) else {
            return Ok(ConsentRedirect {
                location: "/".to_string(),
                consumed_jar: false,
            });
        };
        let Some(session) = session else {
            return Ok(ConsentRedirect {
                location: "/login".to_string(),
                consumed_jar: false,
            });
        };

        let request = TicketRequest {
            client_id: jar.client.clone(),
            client_secret: String::new(),
            grant: ExtensionGrantRequest {
                grant_type: self.id_grant_type.clone(),
                x_user_id: Some(session.profile.id.clone()),
                x_email_token: None,
            },
        };

        let ticket = self.endpoint.issue(&request).await.map_err(|error| {
            tracing::warn!(target: "waypost.oauth", client = %jar.client, error = %error, "ticket issuance failed");
            ApiError::internal("Unexpected API response")
        })?;

        tracing::info!(
            target: "waypost.oauth",
            client = %jar.client,
            user = %session.profile.id,
            "client authorized",
        );
        Ok(ConsentRedirect {
            location: format!(
                "{}#{}",
                jar.redirection,
                ticket_fragment(&ticket, jar.state.as_deref())
            ),
            consumed_jar: true,
        })
    }
}

fn query_separator(uri: &str) -> char {
    if uri.contains('?') { '&' } else { '?' }
}

pub fn error_redirect(
    redirection: &str,
    error: &str,
    description: Option<&str>,
    state: Option<&str>,
) -> String {
    let mut location = format!("{redirection}{}error={error}", query_separator(redirection));
    if let Some(description) = description {
        location.push_str("&error_description=");
        location.push_str(&urlencoding::encode(description));
    }
    if let Some(state) = state.filter(|state| !state.is_empty()) {
        location.push_str("&state=");
        location.push_str(&urlencoding::encode(state));
    }
    location
}

/// Ticket fields as an `application/x-www-form-urlencoded` fragment.
pub fn ticket_fragment(ticket: &Ticket, state: Option<&str>) -> String {
    let expiration = ticket.expiration.timestamp_millis().to_string();
    let tos = ticket.ext.tos.to_string();
    let mut pairs: Vec<(&str, &str)> = vec![
        ("id", ticket.id.as_str()),
        ("user", ticket.user.as_str()),
        ("client", ticket.client.as_str()),
        ("algorithm", ticket.algorithm.as_str()),
        ("key", ticket.key.as_str()),
        ("expiration", expiration.as_str()),
        ("tos", tos.as_str()),
    ];
    if let Some(action) = ticket.x_action.as_deref() {
        pairs.push(("x_action", action));
    }
    if let Some(state) = state.filter(|state| !state.is_empty()) {
        pairs.push(("state", state));
    }

    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}
