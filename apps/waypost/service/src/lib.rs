use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod extension_grant;
pub mod grants;
pub mod identity;
pub mod invitation;
pub mod jar;
pub mod message_signature;
pub mod notify;
pub mod oauth;
pub mod session;
pub mod store;
pub mod tickets;

#[cfg(test)]
mod tests;

use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, OAuthErrorTuple, api_error_response, bad_request_error,
    error_response_with_status, internal_error, oauth_error_response, ok_data, unauthorized_error,
};
use crate::config::Config;
use crate::endpoint::{EndpointError, endpoint_from_config};
use crate::identity::IdentitySource;
use crate::invitation::InvitationValidator;
use crate::jar::{BROWSER_COOKIE_NAME, JAR_COOKIE_NAME, JarSealer, browser_cookie, new_browser_id};
use crate::message_signature::{MessageValidator, parse_authorization, request_message};
use crate::notify::{ChangeNotifier, TracingNotifier};
use crate::oauth::{AuthorizeOutcome, AuthorizeQuery, OAuthFlow};
use crate::session::{Restriction, SESSION_COOKIE_NAME, SessionManager};
use crate::store::{MemoryStore, RecordStore};
use crate::tickets::{Caller, ReissueRequest, Ticket, TicketIssuer, TicketRequest};

const SERVICE_NAME: &str = "waypost-session-service";

#[derive(Clone)]
struct AppState {
    issuer: Arc<TicketIssuer>,
    sessions: SessionManager,
    oauth: OAuthFlow,
    jar: JarSealer,
    messages: MessageValidator,
    invitations: InvitationValidator,
    started_at: SystemTime,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct SessionView {
    user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    display: Option<String>,
    tos: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    restriction: Option<Restriction>,
    expires_at: String,
}

pub fn build_router(config: Config) -> Result<Router, EndpointError> {
    let store = MemoryStore::from_config(&config);
    build_router_with_store(config, store, Arc::new(TracingNotifier))
}

pub fn build_router_with_store(
    config: Config,
    store: MemoryStore,
    notifier: Arc<dyn ChangeNotifier>,
) -> Result<Router, EndpointError> {
    let records: Arc<dyn RecordStore> = Arc::new(store.clone());
    let identities: Arc<dyn IdentitySource> = Arc::new(store);

    let issuer = Arc::new(TicketIssuer::from_config(
        &config,
        Arc::clone(&records),
        Arc::clone(&identities),
    ));
    let endpoint = endpoint_from_config(&config, Arc::clone(&issuer))?;
    let state = AppState {
        sessions: SessionManager::from_config(&config, Arc::clone(&endpoint)),
        oauth: OAuthFlow::new(endpoint, issuer.resolver()),
        jar: JarSealer::from_config(&config),
        messages: MessageValidator::from_config(&config),
        invitations: InvitationValidator::new(records, identities, notifier),
        issuer,
        started_at: SystemTime::now(),
    };
    let request_timeout = Duration::from_secs(config.request_timeout_seconds.max(1));

    let web_router = Router::new()
        .route(
            "/oauth/authorize",
            get(authorize_page).post(authorize_consent),
        )
        .route("/session", get(current_session))
        .route("/logout", post(logout));

    let api_router = Router::new()
        .route("/oz/ticket", post(issue_ticket))
        .route("/oz/reissue", post(reissue_ticket))
        .route("/oz/app/:id", get(client_info))
        .route("/oz/profile", get(profile))
        .route("/invite/:code", get(check_invitation))
        .route("/invite/:code/claim", post(claim_invitation))
        .route("/invite/:code/consume", post(consume_invitation));

    Ok(Router::new()
        .route("/healthz", get(health))
        .merge(web_router)
        .merge(api_router)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        ))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = match state.started_at.elapsed() {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    };

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
    })
}

async fn authorize_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, ApiErrorTuple> {
    match state.oauth.authorize(&query).await {
        AuthorizeOutcome::View(view) => Ok(Json(view).into_response()),
        AuthorizeOutcome::Redirect(location) => redirect_response(&location),
        AuthorizeOutcome::Failure(error) => Err(api_error_response(error)),
        AuthorizeOutcome::Consent { view, jar } => {
            let existing = extract_cookie_value(&headers, BROWSER_COOKIE_NAME);
            let browser_id = existing.clone().unwrap_or_else(new_browser_id);
            let sealed = state.jar.seal(&browser_id, &jar).map_err(|error| {
                tracing::warn!(target: "waypost.oauth", error = %error, "failed sealing oauth jar");
                internal_error("Failed to store authorization state.")
            })?;

            let mut response = Json(view).into_response();
            if existing.is_none() {
                append_set_cookie_header(&mut response, &browser_cookie(&browser_id))?;
            }
            append_set_cookie_header(&mut response, &state.jar.cookie(&sealed))?;
            Ok(response)
        }
    }
}

async fn authorize_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiErrorTuple> {
    let load = state
        .sessions
        .load(extract_cookie_value(&headers, SESSION_COOKIE_NAME).as_deref())
        .await;

    let jar = match (
        extract_cookie_value(&headers, BROWSER_COOKIE_NAME),
        extract_cookie_value(&headers, JAR_COOKIE_NAME),
    ) {
        (Some(browser_id), Some(value)) => state.jar.open(&browser_id, &value),
        _ => None,
    };

    let redirect = state
        .oauth
        .consent(jar, load.session.as_ref())
        .await
        .map_err(api_error_response)?;

    let mut response = redirect_response(&redirect.location)?;
    if let Some(cookie) = load.set_cookie.as_deref() {
        append_set_cookie_header(&mut response, cookie)?;
    }
    if redirect.consumed_jar {
        append_set_cookie_header(&mut response, &state.jar.clear_cookie())?;
    }
    Ok(response)
}

async fn current_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiErrorTuple> {
    let load = state
        .sessions
        .load(extract_cookie_value(&headers, SESSION_COOKIE_NAME).as_deref())
        .await;

    let mut response = match load.session {
        Some(session) => ok_data(SessionView {
            user: session.profile.id,
            display: session.profile.display,
            tos: session.profile.tos,
            restriction: session.state.restriction,
            expires_at: session.state.ticket.expiration.to_rfc3339(),
        })
        .into_response(),
        None => unauthorized_error("Session required.").into_response(),
    };

    if let Some(cookie) = load.set_cookie.as_deref() {
        append_set_cookie_header(&mut response, cookie)?;
    }
    Ok(response)
}

async fn logout(State(state): State<AppState>) -> Result<Response, ApiErrorTuple> {
    let mut response = redirect_response("/")?;
    append_set_cookie_header(&mut response, &state.sessions.clear())?;
    Ok(response)
}

async fn issue_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TicketRequest>,
) -> Result<Json<Ticket>, OAuthErrorTuple> {
    let caller = state
        .issuer
        .authenticate_caller(basic_credentials(&headers))
        .await
        .map_err(oauth_error_response)?;

    state
        .issuer
        .issue(&request, caller)
        .await
        .map(Json)
        .map_err(oauth_error_response)
}

async fn reissue_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReissueRequest>,
) -> Result<Json<Ticket>, OAuthErrorTuple> {
    let caller = state
        .issuer
        .authenticate_caller(basic_credentials(&headers))
        .await
        .map_err(oauth_error_response)?;

    state
        .issuer
        .reissue(&request, caller)
        .await
        .map(Json)
        .map_err(oauth_error_response)
}

async fn client_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    require_trusted_caller(&state, &headers).await?;
    let client = state
        .issuer
        .client_info(&id)
        .await
        .map_err(api_error_response)?;
    Ok(ok_data(client))
}

async fn profile(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let user = authenticate_signed_request(&state, &method, &uri, &headers, "")?;
    let profile = state
        .issuer
        .profile(&user)
        .await
        .map_err(api_error_response)?;
    Ok(ok_data(profile))
}

async fn check_invitation(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let check = state
        .invitations
        .check(&code)
        .await
        .map_err(|error| api_error_response(error.into()))?;
    Ok(ok_data(check))
}

async fn claim_invitation(
    State(state): State<AppState>,
    Path(code): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let body = std::str::from_utf8(&body)
        .map_err(|_| bad_request_error("Request body must be UTF-8."))?;
    let user = authenticate_signed_request(&state, &method, &uri, &headers, body)?;

    let receipt = state
        .invitations
        .claim(&code, &user)
        .await
        .map_err(|error| api_error_response(error.into()))?;
    Ok(ok_data(receipt))
}

async fn consume_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    require_trusted_caller(&state, &headers).await?;
    let invite = state
        .invitations
        .consume_registration(&code)
        .await
        .map_err(|error| api_error_response(error.into()))?;
    Ok(ok_data(invite))
}

async fn require_trusted_caller(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), ApiErrorTuple> {
    match state
        .issuer
        .authenticate_caller(basic_credentials(headers))
        .await
    {
        Ok(Caller::Trusted) => Ok(()),
        Ok(Caller::Anonymous) => Err(unauthorized_error("Client missing 'login' scope.")),
        Err(error) => Err(unauthorized_error(&error.message)),
    }
}

fn authenticate_signed_request(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &str,
) -> Result<String, ApiErrorTuple> {
    let credentials = header_string(headers, AUTHORIZATION.as_str())
        .as_deref()
        .and_then(parse_authorization)
        .ok_or_else(|| unauthorized_error("Missing request signature."))?;

    let message = request_message(method.as_str(), uri.path(), body);
    state
        .messages
        .validate(&message, &credentials.token, &credentials.mac)
        .map_err(api_error_response)
}

/// `Authorization: Basic` client credentials, if well formed.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = header_string(headers, AUTHORIZATION.as_str())?;
    let encoded = raw.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    non_empty(id.to_string()).map(|id| (id, secret.to_string()))
}

fn redirect_response(location: &str) -> Result<Response, ApiErrorTuple> {
    let mut response = StatusCode::FOUND.into_response();
    response
        .headers_mut()
        .insert(LOCATION, header_value(location)?);
    Ok(response)
}

fn append_set_cookie_header(response: &mut Response, cookie: &str) -> Result<(), ApiErrorTuple> {
    response
        .headers_mut()
        .append(SET_COOKIE, header_value(cookie)?);
    Ok(())
}

fn extract_cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    for raw in headers.get_all(COOKIE) {
        let Ok(raw) = raw.to_str() else {
            continue;
        };
        for part in raw.split(';') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            if key.trim() == cookie_name {
                return non_empty(value.trim().to_string());
            }
        }
    }

    None
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, ApiErrorTuple> {
    HeaderValue::from_str(raw).map_err(|_| {
        error_response_with_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError,
            "Failed to build response headers.".to_string(),
        )
    })
}
