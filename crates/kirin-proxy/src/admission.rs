//! The 402 admission loop: authenticate, then forward or challenge.

use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use lsat::{Challenge, Decision, DenyReason};
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::metrics::{CHALLENGES_ISSUED, DENIALS, MINT_FAILURES, REQUESTS_TOTAL};
use crate::proxy::forward;
use crate::services::Service;
use crate::state::AppState;

/// JSON body of a 402 response. Mirrors the `WWW-Authenticate` challenge.
#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentRequiredBody {
    pub error: String,
    /// Why the presented credential (if any) was refused.
    pub reason: String,
    pub message: String,
    pub macaroon: String,
    pub invoice: String,
    pub payment_hash: String,
    pub amount_msat: u64,
}

/// Extract the credential header, if present and valid UTF-8.
pub fn credential_header(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Build a 402 Payment Required HTTP response
pub fn payment_required_response(challenge: &Challenge, reason: &DenyReason) -> HttpResponse {
    let body = PaymentRequiredBody {
        error: "payment_required".to_string(),
        reason: reason.code().to_string(),
        message: reason.to_string(),
        macaroon: challenge.credential.to_base64(),
        invoice: challenge.invoice.clone(),
        payment_hash: challenge.payment_hash.to_hex(),
        amount_msat: challenge.amount_msat,
    };
    HttpResponse::PaymentRequired()
        .insert_header((header::WWW_AUTHENTICATE, challenge.header_value()))
        .json(body)
}

/// Mint a fresh credential for `service` and answer with a challenge.
pub async fn challenge(
    state: &AppState,
    service: &Service,
    reason: &DenyReason,
) -> Result<HttpResponse, ProxyError> {
    let route = service.name();
    let (credential, obligation) = state.minter.mint(route).await.map_err(|e| {
        MINT_FAILURES.with_label_values(&[route]).inc();
        REQUESTS_TOTAL.with_label_values(&[route, "error"]).inc();
        tracing::error!(service = route, error = %e, "failed to mint challenge");
        ProxyError::Mint(e)
    })?;

    CHALLENGES_ISSUED.with_label_values(&[route]).inc();
    REQUESTS_TOTAL.with_label_values(&[route, "challenged"]).inc();
    Ok(payment_required_response(
        &Challenge::new(credential, &obligation),
        reason,
    ))
}

/// Admit a request to a metered service.
pub async fn admit(
    req: &HttpRequest,
    state: &AppState,
    service: &Service,
    body: Bytes,
) -> Result<HttpResponse, ProxyError> {
    let route = service.name();
    let decision = state
        .authenticator
        .authenticate(credential_header(req), route, lsat::unix_now())
        .await;

    match decision {
        // Quota was already claimed by `authenticate`, so an upstream failure
        // still counts against it.
        Decision::Allow(grant) => {
            tracing::debug!(service = route, token_id = %grant.token_id, "request admitted");
            REQUESTS_TOTAL.with_label_values(&[route, "allowed"]).inc();
            forward(&state.http_client, req, service, body, Some(&grant)).await
        }
        Decision::Deny(reason) => {
            DENIALS.with_label_values(&[reason.code()]).inc();
            tracing::debug!(service = route, reason = %reason, "request denied");
            challenge(state, service, &reason).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;
    use lsat::{Credential, Obligation, PaymentHash, RootKey, RootKeyId};

    #[test]
    fn test_payment_required_response() {
        let hash = PaymentHash([1; 32]);
        let credential = Credential::mint(
            &RootKey::from_bytes([2; 32]),
            RootKeyId([3; 32]),
            lsat::Identifier::new(hash).encode(),
        );
        let obligation = Obligation {
            payment_hash: hash,
            amount_msat: 1000,
            invoice: "lnbc10n1test".to_string(),
            expires_at: 0,
        };
        let challenge = Challenge::new(credential, &obligation);
        let resp = payment_required_response(&challenge, &DenyReason::UnsettledObligation);

        assert_eq!(resp.status(), 402);
        let www = resp
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let parsed = Challenge::from_header_value(&www).unwrap();
        assert_eq!(parsed.payment_hash, hash);

        let bytes = resp.into_body().try_into_bytes().unwrap();
        let body: PaymentRequiredBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.reason, "unsettled_obligation");
        assert_eq!(body.payment_hash, hash.to_hex());
        assert_eq!(body.invoice, "lnbc10n1test");
    }
}
