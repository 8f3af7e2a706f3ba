//! Request authentication.
//!
//! [`Authenticator::authenticate`] never errors: every failure, including
//! infrastructure failures, collapses into [`Decision::Deny`] so the caller
//! can answer with a fresh challenge. Checks run in a fixed order and stop
//! at the first failure:
//!
//! 1. parse the header, credential and identifier;
//! 2. fetch the root key;
//! 3. verify the signature chain;
//! 4. check the preimage against the embedded payment hash (and optionally
//!    ask the payment backend);
//! 5. evaluate caveats;
//! 6. claim one request against the `max_requests` quota;
//! 7. allow.
//!
//! The quota claim is the last check, so a request that fails any other step
//! never consumes quota.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::caveat::{self, Capabilities, RequestContext};
use crate::challenger::{unix_now, Challenger, Settlement};
use crate::error::StoreError;
use crate::header::parse_authorization;
use crate::identifier::{PaymentHash, TokenId};
use crate::minter::{DEFAULT_CHALLENGE_TIMEOUT, DEFAULT_STORE_TIMEOUT};
use crate::secrets::SecretStore;
use crate::usage::UsageMeter;

const USAGE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Header absent, or credential/identifier/preimage undecodable.
    Malformed(String),
    /// Root key missing, corrupted or the store could not be reached.
    KeyUnavailable,
    BadSignature,
    /// Preimage does not settle the embedded payment hash.
    UnsettledObligation,
    /// Name of the first caveat condition that failed.
    CaveatViolation(&'static str),
}

impl DenyReason {
    /// Stable machine-readable code, used in response bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Malformed(_) => "malformed",
            DenyReason::KeyUnavailable => "key_unavailable",
            DenyReason::BadSignature => "bad_signature",
            DenyReason::UnsettledObligation => "unsettled_obligation",
            DenyReason::CaveatViolation(_) => "caveat_violation",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Malformed(detail) => write!(f, "malformed credential: {detail}"),
            DenyReason::KeyUnavailable => f.write_str("signing key unavailable"),
            DenyReason::BadSignature => f.write_str("invalid credential signature"),
            DenyReason::UnsettledObligation => f.write_str("payment not settled"),
            DenyReason::CaveatViolation(condition) => {
                write!(f, "caveat violated: {condition}")
            }
        }
    }
}

/// What an admitted request may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub token_id: TokenId,
    pub payment_hash: PaymentHash,
    /// `None` when the credential carries no capability caveat.
    pub capabilities: Capabilities,
}

impl Grant {
    /// Comma-separated capability list, or `None` when unrestricted.
    pub fn capabilities_header(&self) -> Option<String> {
        self.capabilities
            .as_ref()
            .map(|caps| caps.iter().cloned().collect::<Vec<_>>().join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Grant),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/// Tunables for [`Authenticator`].
#[derive(Debug, Clone)]
pub struct AuthenticatorConfig {
    /// Also require the payment backend to report the obligation settled.
    pub verify_settlement: bool,
    pub store_timeout: Duration,
    pub challenge_timeout: Duration,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            verify_settlement: false,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
        }
    }
}

pub struct Authenticator {
    secrets: Arc<dyn SecretStore>,
    challenger: Arc<dyn Challenger>,
    usage: Arc<UsageMeter>,
    config: AuthenticatorConfig,
}

impl Authenticator {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        challenger: Arc<dyn Challenger>,
        usage: Arc<UsageMeter>,
    ) -> Self {
        Self {
            secrets,
            challenger,
            usage,
            config: AuthenticatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AuthenticatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Start a background task that drops quota counters of expired
    /// credentials every 60 seconds.
    pub fn start_usage_cleanup(&self) {
        let usage = Arc::clone(&self.usage);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(USAGE_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let purged = usage.purge_expired(unix_now());
                if purged > 0 {
                    tracing::info!(purged, "purged expired usage counters");
                }
            }
        });
    }

    /// Decide whether a request for `route` at unix time `now` may proceed.
    pub async fn authenticate(&self, header: Option<&str>, route: &str, now: u64) -> Decision {
        // 1. decode
        let Some(value) = header else {
            return Decision::Deny(DenyReason::Malformed("no credential presented".to_string()));
        };
        let token = match parse_authorization(value) {
            Ok(token) => token,
            Err(e) => return Decision::Deny(DenyReason::Malformed(e.to_string())),
        };
        let identifier = match token.credential.decoded_identifier() {
            Ok(id) => id,
            Err(e) => return Decision::Deny(DenyReason::Malformed(e.to_string())),
        };

        // 2. root key
        let root_key_id = token.credential.root_key_id();
        let root_key = match tokio::time::timeout(
            self.config.store_timeout,
            self.secrets.get_secret(root_key_id),
        )
        .await
        {
            Ok(Ok(key)) => key,
            Ok(Err(StoreError::NotFound)) => {
                tracing::info!(root_key_id = %root_key_id, "credential references unknown root key");
                return Decision::Deny(DenyReason::KeyUnavailable);
            }
            Ok(Err(e)) => {
                tracing::warn!(root_key_id = %root_key_id, error = %e, "secret store lookup failed");
                return Decision::Deny(DenyReason::KeyUnavailable);
            }
            Err(_) => {
                tracing::warn!(root_key_id = %root_key_id, "secret store lookup timed out");
                return Decision::Deny(DenyReason::KeyUnavailable);
            }
        };

        // 3. signature
        if !token.credential.verify_signature(&root_key) {
            tracing::warn!(
                token_id = %identifier.token_id,
                route,
                "credential signature mismatch"
            );
            return Decision::Deny(DenyReason::BadSignature);
        }

        // 4. settlement
        if token.preimage.hash() != identifier.payment_hash {
            return Decision::Deny(DenyReason::UnsettledObligation);
        }
        if self.config.verify_settlement && !self.confirm_settled(&identifier.payment_hash).await {
            return Decision::Deny(DenyReason::UnsettledObligation);
        }

        // 5. caveats; `requests_used` is advisory here, step 6 is authoritative
        let caveats = token.credential.caveats();
        let ctx = RequestContext {
            route: route.to_string(),
            now,
            requests_used: self.usage.used(&identifier.token_id),
        };
        let capabilities = match caveat::evaluate(caveats, &ctx) {
            Ok(caps) => caps,
            Err(condition) => {
                tracing::debug!(token_id = %identifier.token_id, route, condition, "caveat violated");
                return Decision::Deny(DenyReason::CaveatViolation(condition));
            }
        };

        // 6. quota
        if let Some(max) = caveat::request_quota(caveats) {
            if !self
                .usage
                .try_consume(identifier.token_id, max, caveat::expiry(caveats))
            {
                tracing::debug!(token_id = %identifier.token_id, route, max, "request quota exhausted");
                return Decision::Deny(DenyReason::CaveatViolation(caveat::CONDITION_MAX_REQUESTS));
            }
        }

        // 7. allow
        Decision::Allow(Grant {
            token_id: identifier.token_id,
            payment_hash: identifier.payment_hash,
            capabilities,
        })
    }

    async fn confirm_settled(&self, payment_hash: &PaymentHash) -> bool {
        match tokio::time::timeout(
            self.config.challenge_timeout,
            self.challenger.settlement(payment_hash),
        )
        .await
        {
            Ok(Ok(Settlement::Settled)) => true,
            Ok(Ok(state)) => {
                tracing::debug!(payment_hash = %payment_hash, ?state, "obligation not settled");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(payment_hash = %payment_hash, error = %e, "settlement lookup failed");
                false
            }
            Err(_) => {
                tracing::warn!(payment_hash = %payment_hash, "settlement lookup timed out");
                false
            }
        }
    }
}
