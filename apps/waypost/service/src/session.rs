use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::endpoint::{EndpointError, TicketEndpoint};
use crate::envelope::{EnvelopeCodec, EnvelopeError};
use crate::tickets::{Profile, ReissueRequest, Ticket};

pub const SESSION_COOKIE_NAME: &str = "session";
const CLEARED_SESSION_COOKIE: &str = "session=; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path=/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Restriction {
    /// The account has not accepted the current terms of service.
    Tos,
}

/// Contents of the session cookie: the ticket held for the browser plus the
/// restriction computed when it was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(flatten)]
    pub ticket: Ticket,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restriction: Option<Restriction>,
}

#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub state: SessionState,
    pub profile: Profile,
}

/// Outcome of reading the session cookie. `set_cookie` carries a replacement
/// or clearing cookie the response must emit.
#[derive(Debug, Clone, Default)]
pub struct SessionLoad {
    pub session: Option<ActiveSession>,
    pub set_cookie: Option<String>,
}

#[derive(Clone)]
pub struct SessionManager {
    codec: EnvelopeCodec,
    endpoint: Arc<dyn TicketEndpoint>,
    minimum_tos: u32,
    secure: bool,
}

impl SessionManager {
    pub fn from_config(config: &Config, endpoint: Arc<dyn TicketEndpoint>) -> Self {
        Self {
            codec: EnvelopeCodec::from_passphrase(&config.session_secret),
            endpoint,
            minimum_tos: config.minimum_tos,
            secure: config.secure_cookies(),
        }
    }

    pub async fn load(&self, cookie: Option<&str>) -> SessionLoad {
        let Some(cookie) = cookie.filter(|value| !value.is_empty()) else {
            return SessionLoad::default();
        };
        let Some(state) = self.codec.decrypt::<SessionState>(cookie) else {
            return SessionLoad::default();
        };

        if state.ticket.expiration > Utc::now() {
            return self.load_profile(state, None).await;
        }

        match self.refresh(&state).await {
            Ok((state, cookie)) => self.load_profile(state, Some(cookie)).await,
            Err(load) => load,
        }
    }

    /// Single reissue attempt for an expired session.
    async fn refresh(&self, state: &SessionState) -> Result<(SessionState, String), SessionLoad> {
        let request = ReissueRequest {
            client_id: state.ticket.client.clone(),
            client_secret: String::new(),
            ticket: state.ticket.id.clone(),
        };

        let ticket = match self.endpoint.reissue(&request).await {
            Ok(ticket) => ticket,
            Err(EndpointError::Rejected { status, message, .. }) => {
                tracing::info!(
                    target: "waypost.session",
                    user = %state.ticket.user,
                    status,
                    reason = %message,
                    "session refresh rejected; clearing session",
                );
                return Err(SessionLoad {
                    session: None,
                    set_cookie: Some(self.clear()),
                });
            }
            Err(error) => {
                tracing::warn!(target: "waypost.session", error = %error, "session refresh failed");
                return Err(SessionLoad::default());
            }
        };

        self.set(ticket).map_err(|error| {
            tracing::warn!(target: "waypost.session", error = %error, "failed storing refreshed session");
            SessionLoad::default()
        })
    }

    async fn load_profile(&self, state: SessionState, set_cookie: Option<String>) -> SessionLoad {
        match self.endpoint.profile(&state.ticket).await {
            Ok(profile) => SessionLoad {
                session: Some(ActiveSession { state, profile }),
                set_cookie,
            },
            Err(error) => {
                tracing::info!(
                    target: "waypost.session",
                    user = %state.ticket.user,
                    error = %error,
                    "profile fetch failed; clearing session",
                );
                SessionLoad {
                    session: None,
                    set_cookie: Some(self.clear()),
                }
            }
        }
    }

    /// Stores `ticket` as the browser session and returns the state with the
    /// cookie to emit.
    pub fn set(&self, ticket: Ticket) -> Result<(SessionState, String), EnvelopeError> {
        self.set_at(ticket, Utc::now())
    }

    fn set_at(
        &self,
        ticket: Ticket,
        now: DateTime<Utc>,
    ) -> Result<(SessionState, String), EnvelopeError> {
        let restriction = (ticket.ext.tos < self.minimum_tos).then_some(Restriction::Tos);
        let state = SessionState {
            ticket,
            restriction,
        };

        let next_year = now
            .checked_add_months(Months::new(12))
            .unwrap_or_else(|| now + Duration::days(365));
        let mut cookie = format!(
            "{SESSION_COOKIE_NAME}={}; Expires={}; Path=/",
            self.codec.encrypt(&state)?,
            http_date(next_year)
        );
        if self.secure {
            cookie.push_str("; Secure");
        }

        Ok((state, cookie))
    }

    pub fn clear(&self) -> String {
        CLEARED_SESSION_COOKIE.to_string()
    }
}

fn http_date(value: DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
