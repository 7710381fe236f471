use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorResponse>);
pub type OAuthErrorTuple = (StatusCode, Json<OAuthErrorResponse>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    InternalError,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::InternalError => "internal",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// General-purpose failure surfaced by the invitation and signed-request
/// entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("{message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub const fn code(&self) -> ApiErrorCode {
        match self {
            Self::BadRequest { .. } => ApiErrorCode::BadRequest,
            Self::NotFound { .. } => ApiErrorCode::NotFound,
            Self::Unauthorized { .. } => ApiErrorCode::Unauthorized,
            Self::Internal { .. } => ApiErrorCode::InternalError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    InvalidGrant,
    UnsupportedGrantType,
    UnauthorizedClient,
    InvalidClient,
    ServerError,
}

impl OAuthErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidGrant => "invalid_grant",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::InvalidClient => "invalid_client",
            Self::ServerError => "server_error",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::InvalidGrant | Self::UnsupportedGrantType | Self::UnauthorizedClient => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidClient => StatusCode::UNAUTHORIZED,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Token-endpoint failure carrying a machine-readable OAuth code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct OAuthError {
    pub code: OAuthErrorCode,
    pub message: String,
}

impl OAuthError {
    pub fn new(code: OAuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidGrant, message)
    }

    pub fn unsupported_grant_type(message: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::UnsupportedGrantType, message)
    }

    pub fn unauthorized_client(message: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::UnauthorizedClient, message)
    }

    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidClient, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::ServerError, message)
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub message: String,
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct OAuthErrorResponse {
    pub error: &'static str,
    pub error_description: String,
}

#[derive(Debug, Serialize)]
pub struct ApiDataEnvelope<T> {
    pub data: T,
}

pub fn ok_data<T: Serialize>(data: T) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    (StatusCode::OK, Json(ApiDataEnvelope { data }))
}

pub fn error_response(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    error_response_with_status(code.default_status(), code, message)
}

pub fn error_response_with_status(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
) -> ApiErrorTuple {
    let message = message.into();
    (
        status,
        Json(ApiErrorResponse {
            message: message.clone(),
            error: ApiErrorDetail {
                code: code.as_str(),
                message,
            },
        }),
    )
}

pub fn api_error_response(error: ApiError) -> ApiErrorTuple {
    let code = error.code();
    error_response(code, error.to_string())
}

pub fn bad_request_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::BadRequest, message)
}

pub fn unauthorized_error(message: &str) -> ApiErrorTuple {
    error_response(ApiErrorCode::Unauthorized, message.to_string())
}

pub fn not_found_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::NotFound, message)
}

pub fn internal_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::InternalError, message)
}

pub fn oauth_error_response(error: OAuthError) -> OAuthErrorTuple {
    (
        error.code.default_status(),
        Json(OAuthErrorResponse {
            error: error.code.as_str(),
            error_description: error.message,
        }),
    )
}
