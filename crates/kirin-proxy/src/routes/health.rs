use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::metrics::REGISTRY;
use crate::state::AppState;

/// GET /health
///
/// Reports which backends are configured. Backends are not probed, so a
/// healthy response says nothing about etcd or LND reachability.
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "kirin",
        "version": env!("CARGO_PKG_VERSION"),
        "secret_store": config.secret_store.kind(),
        "challenger": config.challenger.kind(),
        "root_key_policy": config.root_key_policy,
        "verify_settlement": config.verify_settlement,
        "services": state.services.len(),
        "dev_mode": config.insecure_dev,
    }))
}

fn bearer(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Compare digests so neither content nor length leaks through timing.
fn token_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented.as_slice().ct_eq(expected.as_slice()).into()
}

/// GET /metrics
///
/// Prometheus text format; requires `Authorization: Bearer <METRICS_TOKEN>`
/// when a token is configured.
pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(expected) = state.config.metrics_token.as_deref() {
        if !bearer(&req).is_some_and(|token| token_matches(token, expected)) {
            return HttpResponse::Unauthorized()
                .insert_header((header::WWW_AUTHENTICATE, "Bearer"))
                .json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "metrics require a bearer token"
                }));
        }
    }

    match prometheus::TextEncoder::new().encode_to_string(&REGISTRY.gather()) {
        Ok(text) => HttpResponse::Ok()
            .content_type(prometheus::TEXT_FORMAT)
            .body(text),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics));
}
