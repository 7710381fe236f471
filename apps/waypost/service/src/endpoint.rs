use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::api_envelope::{ApiError, OAuthError};
use crate::config::Config;
use crate::message_signature::{
    MacAlgorithm, MessageValidator, authorization_header, request_message,
};
use crate::tickets::{
    Caller, ClientInfo, Profile, ReissueRequest, Ticket, TicketIssuer, TicketRequest,
};

pub const PROFILE_PATH: &str = "/oz/profile";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// The endpoint answered with a non-success status.
    #[error("{message}")]
    Rejected {
        status: u16,
        error: String,
        message: String,
    },
    #[error("{message}")]
    Unavailable { message: String },
}

impl EndpointError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected { status: 404, .. })
    }
}

impl From<OAuthError> for EndpointError {
    fn from(error: OAuthError) -> Self {
        Self::Rejected {
            status: error.code.default_status().as_u16(),
            error: error.code.as_str().to_string(),
            message: error.message,
        }
    }
}

impl From<ApiError> for EndpointError {
    fn from(error: ApiError) -> Self {
        let code = error.code();
        Self::Rejected {
            status: code.default_status().as_u16(),
            error: code.as_str().to_string(),
            message: error.to_string(),
        }
    }
}

/// Ticket API as seen from the web tier.
#[async_trait]
pub trait TicketEndpoint: Send + Sync {
    async fn client(&self, id: &str) -> Result<ClientInfo, EndpointError>;

    async fn issue(&self, request: &TicketRequest) -> Result<Ticket, EndpointError>;

    async fn reissue(&self, request: &ReissueRequest) -> Result<Ticket, EndpointError>;

    /// Profile of the ticket holder, fetched with a request signed by `ticket`.
    async fn profile(&self, ticket: &Ticket) -> Result<Profile, EndpointError>;
}

pub fn endpoint_from_config(
    config: &Config,
    issuer: Arc<TicketIssuer>,
) -> Result<Arc<dyn TicketEndpoint>, EndpointError> {
    match HttpTicketEndpoint::from_config(config)? {
        Some(endpoint) => {
            tracing::info!(target: "waypost.session", base_url = %endpoint.base_url, "using remote ticket api");
            Ok(Arc::new(endpoint))
        }
        None => Ok(Arc::new(LocalTicketEndpoint::new(
            issuer,
            MessageValidator::from_config(config),
        ))),
    }
}

fn sign_profile_request(ticket: &Ticket) -> Result<(String, String), EndpointError> {
    let algorithm =
        MacAlgorithm::parse(&ticket.algorithm).ok_or_else(|| EndpointError::Unavailable {
            message: format!("ticket uses unknown algorithm {}", ticket.algorithm),
        })?;
    let message = request_message("GET", PROFILE_PATH, "");
    let mac = algorithm
        .sign(&ticket.key, &message)
        .ok_or_else(|| EndpointError::Unavailable {
            message: "failed to sign profile request".to_string(),
        })?;
    Ok((message, mac))
}

/// In-process endpoint used when no remote ticket API is configured. It acts
/// as the trusted first-party caller.
pub struct LocalTicketEndpoint {
    issuer: Arc<TicketIssuer>,
    messages: MessageValidator,
}

impl LocalTicketEndpoint {
    pub fn new(issuer: Arc<TicketIssuer>, messages: MessageValidator) -> Self {
        Self { issuer, messages }
    }
}

#[async_trait]
impl TicketEndpoint for LocalTicketEndpoint {
    async fn client(&self, id: &str) -> Result<ClientInfo, EndpointError> {
        Ok(self.issuer.client_info(id).await?)
    }

    async fn issue(&self, request: &TicketRequest) -> Result<Ticket, EndpointError> {
        Ok(self.issuer.issue(request, Caller::Trusted).await?)
    }

    async fn reissue(&self, request: &ReissueRequest) -> Result<Ticket, EndpointError> {
        Ok(self.issuer.reissue(request, Caller::Trusted).await?)
    }

    async fn profile(&self, ticket: &Ticket) -> Result<Profile, EndpointError> {
        let (message, mac) = sign_profile_request(ticket)?;
        let user = self.messages.validate(&message, &ticket.id, &mac)?;
        Ok(self.issuer.profile(&user).await?)
    }
}

pub struct HttpTicketEndpoint {
    base_url: String,
    client_id: String,
    client_secret: Option<String>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct RemoteErrorBody {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RemoteDataEnvelope<T> {
    data: T,
}

impl HttpTicketEndpoint {
    pub fn from_config(config: &Config) -> Result<Option<Self>, EndpointError> {
        let Some(base_url) = config.api_base_url.as_ref() else {
            return Ok(None);
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .map_err(|error| EndpointError::Unavailable {
                message: format!("failed to build ticket api client: {error}"),
            })?;

        Ok(Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: config.web_client_id.clone(),
            client_secret: config.web_client_secret.clone(),
            http,
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn with_caller(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.client_secret.as_ref() {
            Some(secret) => request.basic_auth(&self.client_id, Some(secret)),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, EndpointError> {
        let response = request
            .send()
            .await
            .map_err(|error| EndpointError::Unavailable {
                message: format!("Unable to contact ticket api: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(rejection(status.as_u16(), &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| EndpointError::Unavailable {
                message: format!("Invalid ticket api response payload: {error}"),
            })
    }
}

fn rejection(status: u16, body: &str) -> EndpointError {
    let parsed = serde_json::from_str::<RemoteErrorBody>(body).ok();
    let error = parsed
        .as_ref()
        .and_then(|body| body.error.as_ref())
        .and_then(|error| match error {
            serde_json::Value::String(code) => Some(code.clone()),
            serde_json::Value::Object(detail) => detail
                .get("code")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .unwrap_or_else(|| "unknown".to_string());
    let message = parsed
        .and_then(|body| body.error_description.or(body.message))
        .unwrap_or_else(|| format!("ticket api request failed ({status})"));

    EndpointError::Rejected {
        status,
        error,
        message,
    }
}

#[async_trait]
impl TicketEndpoint for HttpTicketEndpoint {
    async fn client(&self, id: &str) -> Result<ClientInfo, EndpointError> {
        let url = self.url(&format!("/oz/app/{}", urlencoding::encode(id)));
        let envelope: RemoteDataEnvelope<ClientInfo> =
            self.send(self.with_caller(self.http.get(url))).await?;
        Ok(envelope.data)
    }

    async fn issue(&self, request: &TicketRequest) -> Result<Ticket, EndpointError> {
        let builder = self.http.post(self.url("/oz/ticket")).json(request);
        self.send(self.with_caller(builder)).await
    }

    async fn reissue(&self, request: &ReissueRequest) -> Result<Ticket, EndpointError> {
        let builder = self.http.post(self.url("/oz/reissue")).json(request);
        self.send(self.with_caller(builder)).await
    }

    async fn profile(&self, ticket: &Ticket) -> Result<Profile, EndpointError> {
        let (_message, mac) = sign_profile_request(ticket)?;
        let builder = self
            .http
            .get(self.url(PROFILE_PATH))
            .header(
                reqwest::header::AUTHORIZATION,
                authorization_header(&ticket.id, &mac),
            );
        let envelope: RemoteDataEnvelope<Profile> = self.send(builder).await?;
        Ok(envelope.data)
    }
}
