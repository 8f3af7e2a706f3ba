//! [`Challenger`] backed by an LND node's REST API.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::challenger::{unix_now, Challenger, Obligation, Settlement, DEFAULT_INVOICE_EXPIRY_SECS};
use crate::error::ChallengeError;
use crate::identifier::PaymentHash;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for [`LndChallenger`].
#[derive(Clone)]
pub struct LndConfig {
    /// REST base URL, e.g. `https://localhost:8080`.
    pub rest_url: String,
    /// Hex-encoded macaroon with invoice permissions.
    pub macaroon_hex: String,
    /// PEM certificate to trust for the node's self-signed TLS.
    pub tls_cert_path: Option<String>,
    pub invoice_expiry_secs: u64,
    pub timeout: Duration,
}

impl LndConfig {
    pub fn new(rest_url: impl Into<String>, macaroon_hex: impl Into<String>) -> Self {
        Self {
            rest_url: rest_url.into(),
            macaroon_hex: macaroon_hex.into(),
            tls_cert_path: None,
            invoice_expiry_secs: DEFAULT_INVOICE_EXPIRY_SECS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for LndConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LndConfig")
            .field("rest_url", &self.rest_url)
            .field("macaroon_hex", &"[REDACTED]")
            .field("tls_cert_path", &self.tls_cert_path)
            .field("invoice_expiry_secs", &self.invoice_expiry_secs)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct LookupInvoiceResponse {
    #[serde(default)]
    state: String,
}

/// Map LND's invoice state onto [`Settlement`].
fn settlement_from_state(state: &str) -> Result<Settlement, ChallengeError> {
    match state {
        "SETTLED" => Ok(Settlement::Settled),
        // proto3 JSON omits the zero value, which is OPEN.
        "OPEN" | "ACCEPTED" | "" => Ok(Settlement::Pending),
        "CANCELED" => Ok(Settlement::Expired),
        other => Err(ChallengeError::InvalidResponse(format!(
            "unknown invoice state {other}"
        ))),
    }
}

/// Issues invoices through LND's `/v1/invoices` endpoint.
pub struct LndChallenger {
    client: reqwest::Client,
    config: LndConfig,
}

impl LndChallenger {
    pub fn new(config: LndConfig) -> Result<Self, ChallengeError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(ref path) = config.tls_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                ChallengeError::Unreachable(format!("failed to read LND TLS cert {path}: {e}"))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ChallengeError::Unreachable(format!("invalid LND TLS cert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| ChallengeError::Unreachable(format!("failed to build LND client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.rest_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Challenger for LndChallenger {
    async fn new_obligation(
        &self,
        purpose: &str,
        amount_msat: u64,
    ) -> Result<Obligation, ChallengeError> {
        let body = serde_json::json!({
            "memo": purpose,
            "value_msat": amount_msat.to_string(),
            "expiry": self.config.invoice_expiry_secs.to_string(),
        });

        let resp = self
            .client
            .post(self.endpoint("/v1/invoices"))
            .header("Grpc-Metadata-macaroon", &self.config.macaroon_hex)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChallengeError::Unreachable(format!("add invoice failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %text, "LND rejected invoice request");
            return Err(ChallengeError::Rejected(format!("add invoice returned {status}")));
        }

        let added: AddInvoiceResponse = resp
            .json()
            .await
            .map_err(|e| ChallengeError::InvalidResponse(e.to_string()))?;
        let hash_bytes = base64::engine::general_purpose::STANDARD
            .decode(&added.r_hash)
            .map_err(|e| ChallengeError::InvalidResponse(format!("r_hash: {e}")))?;
        let payment_hash = PaymentHash::from_slice(&hash_bytes)
            .map_err(|e| ChallengeError::InvalidResponse(e.to_string()))?;

        Ok(Obligation {
            payment_hash,
            amount_msat,
            invoice: added.payment_request,
            expires_at: unix_now().saturating_add(self.config.invoice_expiry_secs),
        })
    }

    async fn settlement(&self, payment_hash: &PaymentHash) -> Result<Settlement, ChallengeError> {
        let resp = self
            .client
            .get(self.endpoint(&format!("/v1/invoice/{}", payment_hash.to_hex())))
            .header("Grpc-Metadata-macaroon", &self.config.macaroon_hex)
            .send()
            .await
            .map_err(|e| ChallengeError::Unreachable(format!("lookup invoice failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChallengeError::Rejected(format!(
                "lookup invoice returned {status}"
            )));
        }
        let invoice: LookupInvoiceResponse = resp
            .json()
            .await
            .map_err(|e| ChallengeError::InvalidResponse(e.to_string()))?;
        settlement_from_state(&invoice.state)
    }
}
