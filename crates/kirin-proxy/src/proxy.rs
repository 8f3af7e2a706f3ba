use std::time::Instant;

use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use lsat::Grant;

use crate::error::ProxyError;
use crate::metrics::{FORWARDED_TOTAL, UPSTREAM_LATENCY};
use crate::services::Service;

/// Header carrying the granted capabilities to the backend.
pub const CAPABILITIES_HEADER: &str = "x-lsat-capabilities";

/// Hop-by-hop headers (RFC 9110 section 7.6.1), never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers to strip from client request before proxying
const REQUEST_HEADERS_TO_STRIP: &[&str] = &[
    "host",
    "content-length", // Will be recalculated
    // The credential and preimage stay at the proxy
    "authorization",
    // Only the proxy may assert capabilities
    CAPABILITIES_HEADER,
];

/// Maximum upstream response body size (10 MB).
const MAX_RESPONSE_BODY_SIZE: usize = 10 * 1024 * 1024;

fn forwardable_request_header(name: &str) -> bool {
    !HOP_BY_HOP.contains(&name) && !REQUEST_HEADERS_TO_STRIP.contains(&name)
}

fn forwardable_response_header(name: &str) -> bool {
    // actix computes its own content-length from the buffered body
    !HOP_BY_HOP.contains(&name) && name != "content-length"
}

/// Forward a request to `service` and relay its response.
///
/// `grant` is `None` for services with auth disabled.
pub async fn forward(
    client: &reqwest::Client,
    original_req: &HttpRequest,
    service: &Service,
    body: Bytes,
    grant: Option<&Grant>,
) -> Result<HttpResponse, ProxyError> {
    let target_url = service.upstream_url(original_req.path(), original_req.uri().query());

    let method = reqwest::Method::from_bytes(original_req.method().as_str().as_bytes())
        .map_err(|_| ProxyError::BadRequest("unsupported HTTP method".to_string()))?;

    let mut request_builder = client.request(method, &target_url);

    // Copy headers from original request (except stripped ones)
    for (name, value) in original_req.headers() {
        let name_lower = name.as_str().to_lowercase();
        if forwardable_request_header(&name_lower) {
            request_builder = request_builder.header(name.as_str(), value.as_bytes());
        }
    }

    if let Some(peer) = original_req.peer_addr() {
        request_builder = request_builder.header("X-Forwarded-For", peer.ip().to_string());
    }
    if let Some(host) = original_req.headers().get("host") {
        request_builder = request_builder.header("X-Forwarded-Host", host.as_bytes());
    }

    // Service-configured headers override anything the client sent
    for (name, value) in &service.config.headers {
        request_builder = request_builder.header(name.as_str(), value.as_str());
    }

    if let Some(caps) = grant.and_then(Grant::capabilities_header) {
        request_builder = request_builder.header(CAPABILITIES_HEADER, caps);
    }

    if !body.is_empty() {
        request_builder = request_builder.body(body);
    }

    let started = Instant::now();
    let mut response = request_builder.send().await.map_err(|e| {
        tracing::error!(service = service.name(), error = %e, "upstream request failed");
        ProxyError::Upstream(format!("{}: {e}", service.name()))
    })?;

    let status = response.status();
    let headers = response.headers().clone();

    // Check Content-Length before reading (fast path)
    if let Some(cl) = response.content_length() {
        if cl > MAX_RESPONSE_BODY_SIZE as u64 {
            return Err(ProxyError::Upstream(format!(
                "upstream response too large: {} bytes (max {})",
                cl, MAX_RESPONSE_BODY_SIZE
            )));
        }
    }

    // Chunked responses have no Content-Length; enforce the limit as we read.
    let mut body_buf = Vec::with_capacity(
        response
            .content_length()
            .map(|cl| cl as usize)
            .unwrap_or(8192)
            .min(MAX_RESPONSE_BODY_SIZE),
    );
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        tracing::error!(service = service.name(), error = %e, "failed to read upstream response body");
        ProxyError::Upstream("failed to read upstream response".to_string())
    })? {
        if body_buf.len() + chunk.len() > MAX_RESPONSE_BODY_SIZE {
            return Err(ProxyError::Upstream(format!(
                "upstream response too large (max {} bytes)",
                MAX_RESPONSE_BODY_SIZE
            )));
        }
        body_buf.extend_from_slice(&chunk);
    }

    UPSTREAM_LATENCY
        .with_label_values(&[service.name()])
        .observe(started.elapsed().as_secs_f64());
    FORWARDED_TOTAL.with_label_values(&[service.name()]).inc();

    let mut builder = HttpResponse::build(
        StatusCode::from_u16(status.as_u16()).map_err(|_| {
            ProxyError::Upstream(format!("invalid upstream status {}", status.as_u16()))
        })?,
    );
    for (name, value) in headers.iter() {
        if forwardable_response_header(name.as_str()) {
            builder.append_header((name.as_str(), value.as_bytes()));
        }
    }

    Ok(builder.body(body_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_to_strip() {
        assert!(!forwardable_request_header("host"));
        assert!(!forwardable_request_header("authorization"));
        assert!(!forwardable_request_header("x-lsat-capabilities"));
        assert!(!forwardable_request_header("connection"));
        assert!(forwardable_request_header("content-type"));
        assert!(forwardable_request_header("cookie"));
    }

    #[test]
    fn test_response_headers_relayed() {
        assert!(forwardable_response_header("content-type"));
        assert!(forwardable_response_header("set-cookie"));
        assert!(forwardable_response_header("server"));
        assert!(!forwardable_response_header("transfer-encoding"));
        assert!(!forwardable_response_header("content-length"));
    }
}
