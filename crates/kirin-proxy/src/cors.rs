//! CORS configuration for the proxy.

use actix_cors::Cors;
use actix_web::http::header;

/// Build the CORS middleware from allowed origins.
///
/// Browser clients must be able to send `Authorization` and read
/// `WWW-Authenticate` to complete the 402 flow. An empty list allows no
/// cross-origin requests; `*` is only accepted in dev mode.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin_str = origin.to_str().unwrap_or("");
            allowed.iter().any(|a| a == "*" || a == origin_str)
        })
        .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CONTENT_TYPE,
        ])
        .expose_headers(vec![header::WWW_AUTHENTICATE])
        .max_age(3600)
}
