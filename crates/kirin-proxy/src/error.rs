use actix_web::{HttpResponse, ResponseError};
use lsat::LsatError;
use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// No service matches the request and no static root is configured
    NoService(String),
    /// Minting a challenge failed
    Mint(LsatError),
    /// Request cannot be forwarded as sent
    BadRequest(String),
    /// Upstream unreachable or misbehaving
    Upstream(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoService(path) => write!(f, "no service for {}", path),
            ProxyError::Mint(e) => write!(f, "challenge failed: {}", e),
            ProxyError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ProxyError::Upstream(msg) => write!(f, "upstream error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<LsatError> for ProxyError {
    fn from(e: LsatError) -> Self {
        ProxyError::Mint(e)
    }
}

impl ResponseError for ProxyError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ProxyError::NoService(path) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "not_found",
                "message": format!("No service configured for '{}'", path)
            })),
            ProxyError::Mint(LsatError::Timeout(what)) => {
                tracing::error!("Challenge timed out: {} timed out", what);
                HttpResponse::GatewayTimeout().json(serde_json::json!({
                    "error": "challenge_timeout",
                    "message": "Timed out creating a payment challenge"
                }))
            }
            ProxyError::Mint(e) => {
                tracing::error!("Challenge failed: {}", e);
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "challenge_failed",
                    "message": "Unable to create a payment challenge"
                }))
            }
            ProxyError::BadRequest(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "bad_request",
                "message": msg
            })),
            ProxyError::Upstream(msg) => {
                tracing::error!("Upstream error: {}", msg);
                HttpResponse::BadGateway().json(serde_json::json!({
                    "error": "upstream_error",
                    "message": "Failed to reach upstream service"
                }))
            }
        }
    }
}
