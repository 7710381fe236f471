use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use crate::build_router_with_store;
use crate::config::Config;
use crate::endpoint::{LocalTicketEndpoint, TicketEndpoint};
use crate::extension_grant::{ExtensionGrantRequest, GrantType};
use crate::identity::{IdentitySource, UserRecord};
use crate::message_signature::{
    MacAlgorithm, MessageValidator, authorization_header, request_message,
};
use crate::notify::{BroadcastNotifier, ChangeEvent, ChangeNotifier, TracingNotifier};
use crate::session::SessionManager;
use crate::store::{
    ClientRecord, InviteRecord, MemoryStore, ParticipantRecord, ProjectRecord, RecordStore,
};
use crate::tickets::{Caller, Ticket, TicketIssuer, TicketRequest};

const WEB_SECRET: &str = "waypost.web-secret";

async fn seeded_store() -> Result<MemoryStore> {
    let store = MemoryStore::default();
    store
        .insert_client(ClientRecord {
            name: "waypost.web".to_string(),
            title: Some("Waypost".to_string()),
            description: None,
            scope: BTreeMap::from([("login".to_string(), true)]),
            secret: WEB_SECRET.to_string(),
            callback: None,
        })
        .await?;
    store
        .insert_client(ClientRecord {
            name: "c1".to_string(),
            title: Some("Sketchpad".to_string()),
            description: Some("Shared sketches".to_string()),
            scope: BTreeMap::new(),
            secret: "c1-secret".to_string(),
            callback: None,
        })
        .await?;
    store
        .insert_client(ClientRecord {
            name: "locked".to_string(),
            title: None,
            description: None,
            scope: BTreeMap::new(),
            secret: "locked-secret".to_string(),
            callback: Some("https://locked.example/cb".to_string()),
        })
        .await?;
    store
        .insert_user(UserRecord {
            id: "u1".to_string(),
            display: Some("Ursula".to_string()),
            tos: Config::for_tests().minimum_tos,
            networks: BTreeMap::new(),
        })
        .await?;
    store
        .insert_user(UserRecord {
            id: "u2".to_string(),
            display: Some("Inviter".to_string()),
            tos: 0,
            networks: BTreeMap::new(),
        })
        .await?;
    Ok(store)
}

fn test_router(store: &MemoryStore) -> Result<Router> {
    Ok(build_router_with_store(
        Config::for_tests(),
        store.clone(),
        Arc::new(TracingNotifier),
    )?)
}

fn test_issuer(config: &Config, store: &MemoryStore) -> Arc<TicketIssuer> {
    let records: Arc<dyn RecordStore> = Arc::new(store.clone());
    let identities: Arc<dyn IdentitySource> = Arc::new(store.clone());
    Arc::new(TicketIssuer::from_config(config, records, identities))
}

async fn web_ticket(config: &Config, store: &MemoryStore, user: &str) -> Result<Ticket> {
    let issuer = test_issuer(config, store);
    let request = TicketRequest {
        client_id: "waypost.web".to_string(),
        client_secret: WEB_SECRET.to_string(),
        grant: ExtensionGrantRequest {
            grant_type: issuer.resolver().grant_type(GrantType::Id),
            x_user_id: Some(user.to_string()),
            x_email_token: None,
        },
    };
    Ok(issuer.issue(&request, Caller::Anonymous).await?)
}

async fn session_cookie(config: &Config, store: &MemoryStore, user: &str) -> Result<String> {
    let ticket = web_ticket(config, store, user).await?;
    let issuer = test_issuer(config, store);
    let endpoint: Arc<dyn TicketEndpoint> = Arc::new(LocalTicketEndpoint::new(
        issuer,
        MessageValidator::from_config(config),
    ));
    let (_state, cookie) = SessionManager::from_config(config, endpoint).set(ticket)?;
    cookie_pair(&cookie)
}

fn cookie_pair(set_cookie: &str) -> Result<String> {
    set_cookie
        .split(';')
        .next()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("empty set-cookie header"))
}

fn set_cookies(response: &axum::response::Response) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn basic(id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{id}:{secret}")))
}

fn signed(ticket: &Ticket, method: &str, path: &str, body: &str) -> Result<String> {
    let mac = MacAlgorithm::HmacSha256
        .sign(&ticket.key, &request_message(method, path, body))
        .ok_or_else(|| anyhow!("failed to sign request"))?;
    Ok(authorization_header(&ticket.id, &mac))
}

async fn read_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    let value = serde_json::from_slice::<Value>(&bytes)?;
    Ok(value)
}

#[tokio::test]
async fn healthz_route_returns_ok() -> Result<()> {
    let app = test_router(&MemoryStore::default())?;
    let request = Request::builder().uri("/healthz").body(Body::empty())?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = read_json(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "waypost-session-service");
    Ok(())
}

#[tokio::test]
async fn trusted_caller_issues_ticket_and_records_grant() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .method("POST")
        .uri("/oz/ticket")
        .header("content-type", "application/json")
        .header("authorization", basic("waypost.web", WEB_SECRET))
        .body(Body::from(
            json!({
                "client_id": "c1",
                "grant_type": "urn:waypost:grant:id",
                "x_user_id": "u1",
            })
            .to_string(),
        ))?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["user"], "u1");
    assert_eq!(body["client"], "c1");
    assert_eq!(body["algorithm"], "hmac-sha-256");
    assert_eq!(body["key"].as_str().map(str::len), Some(32));
    assert!(body["expiration"].is_i64());
    assert_eq!(store.grant_ids().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn ticket_endpoint_rejects_bad_caller_credentials() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .method("POST")
        .uri("/oz/ticket")
        .header("content-type", "application/json")
        .header("authorization", basic("waypost.web", "wrong"))
        .body(Body::from(
            json!({"client_id": "c1", "grant_type": "urn:waypost:grant:id", "x_user_id": "u1"})
                .to_string(),
        ))?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = read_json(response).await?;
    assert_eq!(body["error"], "invalid_client");
    assert_eq!(body["error_description"], "Invalid client credentials");
    Ok(())
}

#[tokio::test]
async fn client_without_login_cannot_use_extension_grants() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .method("POST")
        .uri("/oz/ticket")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "client_id": "c1",
                "client_secret": "c1-secret",
                "grant_type": "urn:waypost:grant:id",
                "x_user_id": "u1",
            })
            .to_string(),
        ))?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert_eq!(body["error"], "unauthorized_client");
    assert_eq!(body["error_description"], "Client missing 'login' scope");
    assert!(store.grant_ids().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn reissue_route_returns_fresh_ticket() -> Result<()> {
    let config = Config::for_tests();
    let store = seeded_store().await?;
    let ticket = web_ticket(&config, &store, "u1").await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .method("POST")
        .uri("/oz/reissue")
        .header("content-type", "application/json")
        .header("authorization", basic("waypost.web", WEB_SECRET))
        .body(Body::from(
            json!({"client_id": "waypost.web", "ticket": ticket.id}).to_string(),
        ))?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["user"], "u1");
    assert_eq!(body["client"], "waypost.web");
    assert_ne!(body["id"], json!(ticket.id));
    Ok(())
}

#[tokio::test]
async fn client_info_requires_trusted_caller() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let anonymous = Request::builder().uri("/oz/app/c1").body(Body::empty())?;
    let response = app.clone().oneshot(anonymous).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let trusted = Request::builder()
        .uri("/oz/app/c1")
        .header("authorization", basic("waypost.web", WEB_SECRET))
        .body(Body::empty())?;
    let response = app.clone().oneshot(trusted).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["data"]["name"], "c1");
    assert_eq!(body["data"]["title"], "Sketchpad");
    assert!(body["data"].get("secret").is_none());

    let missing = Request::builder()
        .uri("/oz/app/ghost")
        .header("authorization", basic("waypost.web", WEB_SECRET))
        .body(Body::empty())?;
    let response = app.oneshot(missing).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_json(response).await?;
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["message"], "Unknown application");
    Ok(())
}

#[tokio::test]
async fn profile_route_validates_request_mac() -> Result<()> {
    let config = Config::for_tests();
    let store = seeded_store().await?;
    let ticket = web_ticket(&config, &store, "u1").await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/oz/profile")
        .header("authorization", signed(&ticket, "GET", "/oz/profile", "")?)
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["data"]["id"], "u1");
    assert_eq!(body["data"]["display"], "Ursula");

    let forged = Request::builder()
        .uri("/oz/profile")
        .header("authorization", signed(&ticket, "POST", "/oz/profile", "")?)
        .body(Body::empty())?;
    let response = app.clone().oneshot(forged).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = read_json(response).await?;
    assert_eq!(body["message"], "Invalid mac");

    let unsigned = Request::builder().uri("/oz/profile").body(Body::empty())?;
    let response = app.oneshot(unsigned).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn authorize_without_client_renders_error_view() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/oauth/authorize?response_type=token")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["template"], "error");
    assert_eq!(body["locals"]["code"], 500);

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=ghost&response_type=token")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    let body = read_json(response).await?;
    assert_eq!(body["template"], "error");
    assert_eq!(body["locals"]["code"], "unknown");
    Ok(())
}

#[tokio::test]
async fn authorize_rejects_redirect_uri_for_callback_client() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=locked&redirect_uri=https://evil.example/&response_type=token")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(set_cookies(&response).is_empty());
    Ok(())
}

#[tokio::test]
async fn authorize_redirects_unsupported_response_types() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=c1&redirect_uri=https://cb/x&response_type=authorization_code&state=s1")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        location(&response),
        "https://cb/x?error=unsupported_response_type&state=s1"
    );

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=locked")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        location(&response),
        "https://locked.example/cb?error=invalid_request&error_description=Missing%20response_type%20parameter"
    );
    Ok(())
}

#[tokio::test]
async fn implicit_flow_redirects_with_ticket_fragment() -> Result<()> {
    let config = Config::for_tests();
    let store = seeded_store().await?;
    let session = session_cookie(&config, &store, "u1").await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=c1&redirect_uri=https://cb/x&response_type=token&state=s1")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let cookies = set_cookies(&response)
        .iter()
        .map(|cookie| cookie_pair(cookie))
        .collect::<Result<Vec<_>>>()?;
    assert!(cookies.iter().any(|cookie| cookie.starts_with("browser=")));
    assert!(cookies.iter().any(|cookie| cookie.starts_with("jar=")));

    let body = read_json(response).await?;
    assert_eq!(body["template"], "oauth");
    assert_eq!(body["locals"]["title"], "Sketchpad");
    assert_eq!(body["locals"]["warning"], true);

    let request = Request::builder()
        .method("POST")
        .uri("/oauth/authorize")
        .header("cookie", format!("{}; {session}", cookies.join("; ")))
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::FOUND);
    let location = location(&response);
    assert!(location.starts_with("https://cb/x#id="));
    assert!(location.contains("&user=u1&client=c1&algorithm=hmac-sha-256&"));
    assert!(location.ends_with("&state=s1"));
    assert!(
        set_cookies(&response)
            .iter()
            .any(|cookie| cookie.starts_with("jar=;"))
    );
    assert_eq!(store.grant_ids().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn consent_without_jar_or_session_redirects_home() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .method("POST")
        .uri("/oauth/authorize")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=c1&redirect_uri=https://cb/x&response_type=token")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    let cookies = set_cookies(&response)
        .iter()
        .map(|cookie| cookie_pair(cookie))
        .collect::<Result<Vec<_>>>()?;

    let request = Request::builder()
        .method("POST")
        .uri("/oauth/authorize")
        .header("cookie", cookies.join("; "))
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/login");
    Ok(())
}

#[tokio::test]
async fn jar_is_bound_to_the_browser_that_received_it() -> Result<()> {
    let config = Config::for_tests();
    let store = seeded_store().await?;
    let session = session_cookie(&config, &store, "u1").await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=c1&redirect_uri=https://cb/x&response_type=token")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    let jar = set_cookies(&response)
        .iter()
        .map(|cookie| cookie_pair(cookie))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .find(|cookie| cookie.starts_with("jar="))
        .ok_or_else(|| anyhow!("missing jar cookie"))?;

    let request = Request::builder()
        .method("POST")
        .uri("/oauth/authorize")
        .header("cookie", format!("browser=someone-else; {jar}; {session}"))
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    assert!(store.grant_ids().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn session_route_reports_signed_in_user() -> Result<()> {
    let config = Config::for_tests();
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder().uri("/session").body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let cookie = session_cookie(&config, &store, "u1").await?;
    let request = Request::builder()
        .uri("/session")
        .header("cookie", cookie)
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["data"]["user"], "u1");
    assert_eq!(body["data"]["display"], "Ursula");
    assert!(body["data"].get("restriction").is_none());

    let cookie = session_cookie(&config, &store, "u2").await?;
    let request = Request::builder()
        .uri("/session")
        .header("cookie", cookie)
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    let body = read_json(response).await?;
    assert_eq!(body["data"]["user"], "u2");
    assert_eq!(body["data"]["restriction"], "tos");
    Ok(())
}

#[tokio::test]
async fn tampered_session_cookie_is_ignored() -> Result<()> {
    let store = seeded_store().await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/session")
        .header("cookie", "session=not-a-sealed-value")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response).is_empty());
    Ok(())
}

#[tokio::test]
async fn logout_clears_session_cookie() -> Result<()> {
    let app = test_router(&MemoryStore::default())?;
    let request = Request::builder()
        .method("POST")
        .uri("/logout")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    assert_eq!(
        set_cookies(&response),
        vec!["session=; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path=/".to_string()]
    );
    Ok(())
}

async fn seed_project(store: &MemoryStore) -> Result<()> {
    store
        .insert_project(ProjectRecord {
            id: "p1".to_string(),
            title: "Launch plan".to_string(),
            participants: vec![ParticipantRecord {
                pid: Some("pid1".to_string()),
                code: Some("abc".to_string()),
                inviter: Some("u2".to_string()),
                ..ParticipantRecord::default()
            }],
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn project_invitation_can_be_checked_and_claimed() -> Result<()> {
    let config = Config::for_tests();
    let store = seeded_store().await?;
    seed_project(&store).await?;
    let notifier = Arc::new(BroadcastNotifier::default());
    let mut events = notifier.subscribe();
    let app = build_router_with_store(
        config.clone(),
        store.clone(),
        Arc::clone(&notifier) as Arc<dyn ChangeNotifier>,
    )?;

    let request = Request::builder()
        .uri("/invite/project:p1:pid1:abc")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["data"]["title"], "Launch plan");
    assert_eq!(body["data"]["project"], "p1");
    assert_eq!(body["data"]["inviter"], "Inviter");

    let ticket = web_ticket(&config, &store, "u1").await?;
    let path = "/invite/project:p1:pid1:abc/claim";
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", signed(&ticket, "POST", path, "")?)
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["project"], "p1");

    let event = events.recv().await?;
    assert_eq!(
        event,
        ChangeEvent {
            object: "project",
            project: "p1".to_string(),
            actor: "u1".to_string(),
        }
    );
    Ok(())
}

#[tokio::test]
async fn invitation_errors_map_to_api_errors() -> Result<()> {
    let config = Config::for_tests();
    let store = seeded_store().await?;
    seed_project(&store).await?;
    let app = test_router(&store)?;

    let request = Request::builder()
        .uri("/invite/project:p1:pid1:wrong")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert_eq!(body["message"], "Invalid invitation code");

    let request = Request::builder()
        .uri("/invite/project:p9:pid1:abc")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let ticket = web_ticket(&config, &store, "u1").await?;
    let path = "/invite/plain-code/claim";
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", signed(&ticket, "POST", path, "")?)
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert_eq!(body["message"], "Invalid invitation format");
    Ok(())
}

#[tokio::test]
async fn registration_invite_is_consumed_until_limit() -> Result<()> {
    let store = seeded_store().await?;
    store
        .insert_invite(InviteRecord {
            code: "reg1".to_string(),
            notes: Some("beta wave".to_string()),
            count: Some(0),
            limit: Some(1),
            expires: None,
        })
        .await?;
    let app = test_router(&store)?;

    let request = Request::builder().uri("/invite/reg1").body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["data"]["code"], "reg1");

    let anonymous = Request::builder()
        .method("POST")
        .uri("/invite/reg1/consume")
        .body(Body::empty())?;
    let response = app.clone().oneshot(anonymous).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let consume = Request::builder()
        .method("POST")
        .uri("/invite/reg1/consume")
        .header("authorization", basic("waypost.web", WEB_SECRET))
        .body(Body::empty())?;
    let response = app.clone().oneshot(consume).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder().uri("/invite/reg1").body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert_eq!(body["message"], "Invitation code reached limit");
    Ok(())
}

async fn start_ticket_api_stub(
    captured: Arc<Mutex<Vec<String>>>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let app = Router::new()
        .route(
            "/oz/app/:id",
            get(
                |State(captured): State<Arc<Mutex<Vec<String>>>>,
                 Path(id): Path<String>,
                 headers: HeaderMap| async move {
                    let authorization = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    captured.lock().await.push(authorization);

                    if id == "remote" {
                        (
                            StatusCode::OK,
                            Json(json!({"data": {
                                "name": "remote",
                                "title": "Remote App",
                                "description": "Hosted elsewhere",
                            }})),
                        )
                    } else {
                        (
                            StatusCode::NOT_FOUND,
                            Json(json!({
                                "message": "Unknown application",
                                "error": {"code": "not_found", "message": "Unknown application"},
                            })),
                        )
                    }
                },
            ),
        )
        .with_state(captured);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("ticket api stub server failed");
    });

    Ok((addr, handle))
}

#[tokio::test]
async fn authorize_uses_remote_ticket_api_when_configured() -> Result<()> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let (addr, handle) = start_ticket_api_stub(Arc::clone(&captured)).await?;

    let mut config = Config::for_tests();
    config.api_base_url = Some(format!("http://{addr}"));
    config.web_client_secret = Some(WEB_SECRET.to_string());
    let app = build_router_with_store(config, MemoryStore::default(), Arc::new(TracingNotifier))?;

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=remote&redirect_uri=https://cb/x&response_type=token")
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["template"], "oauth");
    assert_eq!(body["locals"]["title"], "Remote App");
    assert_eq!(body["locals"]["description"], "Hosted elsewhere");

    let request = Request::builder()
        .uri("/oauth/authorize?client_id=ghost&response_type=token")
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    let body = read_json(response).await?;
    assert_eq!(body["locals"]["code"], "unknown");

    let seen = captured.lock().await.clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|value| value.starts_with("Basic ")));

    handle.abort();
    Ok(())
}
