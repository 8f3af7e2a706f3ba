use std::path::{Path, PathBuf};

use actix_web::{web, HttpRequest, HttpResponse};

use crate::admission;
use crate::error::ProxyError;
use crate::metrics::REQUESTS_TOTAL;
use crate::proxy::forward;
use crate::services::AuthMode;
use crate::state::AppState;

/// Host the client addressed, as matched against `host_regexp`.
fn request_host(req: &HttpRequest) -> String {
    req.headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Map a request path onto a relative file path under the static root.
/// Validates against the decoded form so `%2e%2e` is caught too.
fn sanitize_static_path(path: &str) -> Result<PathBuf, ProxyError> {
    let decoded = urlencoding::decode(path)
        .map_err(|_| ProxyError::BadRequest("invalid URL encoding in path".to_string()))?;

    let mut relative = PathBuf::new();
    for segment in decoded.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return Err(ProxyError::BadRequest(
                "path traversal not allowed".to_string(),
            ));
        }
        // Dotfiles are never served
        if segment.starts_with('.') {
            return Err(ProxyError::NoService(path.to_string()));
        }
        relative.push(segment);
    }
    Ok(relative)
}

async fn static_file(req: &HttpRequest, root: &str) -> Result<HttpResponse, ProxyError> {
    let mut path = Path::new(root).join(sanitize_static_path(req.path())?);
    if tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        path.push("index.html");
    }

    let file = actix_files::NamedFile::open_async(&path)
        .await
        .map_err(|_| ProxyError::NoService(req.path().to_string()))?;
    Ok(file.into_response(req))
}

/// Catch-all handler: resolve the service, then forward, challenge or serve
/// static content.
pub async fn handle(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let host = request_host(&req);
    let Some(service) = state.services.resolve(&host, req.path()) else {
        return match state.config.static_root.as_deref() {
            Some(root) => static_file(&req, root).await,
            None => {
                REQUESTS_TOTAL.with_label_values(&["", "no_service"]).inc();
                Err(ProxyError::NoService(req.path().to_string()))
            }
        };
    };

    match service.auth() {
        AuthMode::Off => {
            REQUESTS_TOTAL
                .with_label_values(&[service.name(), "open"])
                .inc();
            forward(&state.http_client, &req, service, body, None).await
        }
        AuthMode::On => admission::admit(&req, &state, service, body).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_static_path() {
        assert_eq!(
            sanitize_static_path("/assets/app.js").unwrap(),
            PathBuf::from("assets/app.js")
        );
        assert_eq!(sanitize_static_path("/").unwrap(), PathBuf::new());
        assert!(sanitize_static_path("/../etc/passwd").is_err());
        assert!(sanitize_static_path("/a/%2e%2e/%2e%2e/etc").is_err());
        assert!(sanitize_static_path("/.env").is_err());
        assert!(sanitize_static_path("/a%5c..%5cb").is_err());
    }
}
