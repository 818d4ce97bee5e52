use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const CODE_MISSING_AUTH_HEADER: &str = "missing_or_invalid_header";
pub const CODE_INVALID_AUTH_KEY: &str = "invalid_auth_key";
pub const CODE_INVALID_JSON: &str = "invalid_json";
pub const CODE_INVALID_MESSAGES: &str = "invalid_messages";
pub const CODE_REQUEST_TOO_LARGE: &str = "request_too_large";
pub const CODE_API_ERROR: &str = "api_error";
pub const CODE_INTERNAL_ERROR: &str = "internal_error";

const BEARER_CHALLENGE: &str = "Bearer realm=\"API Access\"";

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
    pub challenge: bool,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
            challenge: false,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    /// 401 carrying the `WWW-Authenticate` bearer challenge.
    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::UNAUTHORIZED, code, message);
        err.challenge = true;
        err
    }

    pub fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            CODE_INVALID_JSON,
            "Not Found or Method Not Allowed",
        )
    }

    pub fn upstream(message: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            CODE_API_ERROR,
            format!("Failed to get response from API: {message}"),
        )
        .with_type("api_error")
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            CODE_INTERNAL_ERROR,
            "Internal Server Error",
        )
        .with_type("internal_error")
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        let mut resp = (self.status, axum::Json(body)).into_response();
        if self.challenge {
            resp.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(BEARER_CHALLENGE),
            );
        }
        resp
    }
}

pub type AppResult<T> = Result<T, AppError>;
