//! Credential minting.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::challenger::{unix_now, Challenger, Obligation, DEFAULT_MEMO};
use crate::credential::Credential;
use crate::error::LsatError;
use crate::identifier::{Identifier, RootKeyId};
use crate::limiter::StaticServiceLimiter;
use crate::secrets::SecretStore;

/// Default bound on a single secret store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single payment backend call.
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Domain separator for per-route root key ids.
const ROUTE_KEY_DOMAIN: &[u8] = b"kirin-route-key/";

/// How root key ids are chosen at mint time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootKeyPolicy {
    /// Fresh key per credential: `sha256(identifier)`.
    #[default]
    PerToken,
    /// One key shared by every credential for a route.
    PerRoute,
}

impl FromStr for RootKeyPolicy {
    type Err = LsatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-token" | "token" => Ok(Self::PerToken),
            "per-route" | "route" => Ok(Self::PerRoute),
            other => Err(LsatError::Malformed(format!("unknown root key policy: {other}"))),
        }
    }
}

impl RootKeyPolicy {
    pub fn root_key_id(&self, route: &str, identifier: &[u8]) -> RootKeyId {
        match self {
            Self::PerToken => RootKeyId::derive(identifier),
            Self::PerRoute => RootKeyId::derive(&[ROUTE_KEY_DOMAIN, route.as_bytes()].concat()),
        }
    }
}

/// Tunables for [`Minter`].
#[derive(Debug, Clone)]
pub struct MinterConfig {
    /// Purpose tag passed to the payment backend (the invoice memo).
    pub memo: String,
    pub key_policy: RootKeyPolicy,
    pub challenge_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for MinterConfig {
    fn default() -> Self {
        Self {
            memo: DEFAULT_MEMO.to_string(),
            key_policy: RootKeyPolicy::default(),
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Issues new credentials bound to fresh payment obligations.
///
/// Holds no state of its own; concurrent mints share nothing but the
/// secret store and the challenger.
pub struct Minter {
    challenger: Arc<dyn Challenger>,
    secrets: Arc<dyn SecretStore>,
    limiter: Arc<StaticServiceLimiter>,
    config: MinterConfig,
}

impl Minter {
    pub fn new(
        challenger: Arc<dyn Challenger>,
        secrets: Arc<dyn SecretStore>,
        limiter: Arc<StaticServiceLimiter>,
    ) -> Self {
        Self {
            challenger,
            secrets,
            limiter,
            config: MinterConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MinterConfig) -> Self {
        self.config = config;
        self
    }

    /// Mint a credential for `route` together with the obligation that must
    /// be paid before it is usable.
    pub async fn mint(&self, route: &str) -> Result<(Credential, Obligation), LsatError> {
        self.mint_at(route, unix_now()).await
    }

    /// [`Self::mint`] with an explicit clock.
    pub async fn mint_at(
        &self,
        route: &str,
        now: u64,
    ) -> Result<(Credential, Obligation), LsatError> {
        // Resolve the route first so an unknown route never costs an invoice.
        let price_msat = self.limiter.price_msat(route)?;
        let caveats = self.limiter.caveats(route, now)?;

        let obligation = tokio::time::timeout(
            self.config.challenge_timeout,
            self.challenger.new_obligation(&self.config.memo, price_msat),
        )
        .await
        .map_err(|_| LsatError::Timeout("payment challenge"))??;

        let identifier = Identifier::new(obligation.payment_hash);
        let raw_id = identifier.encode();
        let root_key_id = self.config.key_policy.root_key_id(route, &raw_id);

        let root_key = tokio::time::timeout(
            self.config.store_timeout,
            self.secrets.new_secret(&root_key_id),
        )
        .await
        .map_err(|_| LsatError::Timeout("secret store"))??;

        let mut credential = Credential::mint(&root_key, root_key_id, raw_id);
        for caveat in caveats {
            credential.add_caveat(caveat);
        }

        tracing::info!(
            route,
            payment_hash = %obligation.payment_hash,
            token_id = %identifier.token_id,
            amount_msat = obligation.amount_msat,
            "minted credential"
        );
        Ok((credential, obligation))
    }
}
