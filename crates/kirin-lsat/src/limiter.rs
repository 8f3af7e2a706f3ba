//! Route to caveat mapping for freshly minted credentials.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::caveat::Caveat;
use crate::error::LsatError;

/// Default price: one satoshi.
pub const DEFAULT_PRICE_MSAT: u64 = 1000;

fn default_price_msat() -> u64 {
    DEFAULT_PRICE_MSAT
}

/// Price and restrictions for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLimits {
    pub name: String,
    #[serde(default = "default_price_msat")]
    pub price_msat: u64,
    /// Capabilities granted to credentials minted for this route.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Credential lifetime in seconds; `None` means no expiry caveat.
    #[serde(default)]
    pub valid_for_secs: Option<u64>,
    /// Per-token request quota; `None` means unlimited.
    #[serde(default)]
    pub max_requests: Option<u64>,
}

impl ServiceLimits {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            price_msat: DEFAULT_PRICE_MSAT,
            capabilities: Vec::new(),
            valid_for_secs: None,
            max_requests: None,
        }
    }
}

/// Caveats and prices from a table fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticServiceLimiter {
    services: HashMap<String, ServiceLimits>,
}

impl StaticServiceLimiter {
    pub fn new(services: impl IntoIterator<Item = ServiceLimits>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
        }
    }

    fn lookup(&self, route: &str) -> Result<&ServiceLimits, LsatError> {
        self.services
            .get(route)
            .ok_or_else(|| LsatError::UnknownRoute(route.to_string()))
    }

    /// Price of a credential for `route`.
    pub fn price_msat(&self, route: &str) -> Result<u64, LsatError> {
        Ok(self.lookup(route)?.price_msat)
    }

    /// Ordered caveats for a credential minted for `route` at time `now`.
    ///
    /// Deterministic for a given `(route, now)`; unconfigured routes are an
    /// error rather than an unrestricted credential.
    pub fn caveats(&self, route: &str, now: u64) -> Result<Vec<Caveat>, LsatError> {
        let service = self.lookup(route)?;

        let mut caveats = vec![Caveat::Routes(vec![service.name.clone()])];
        if !service.capabilities.is_empty() {
            caveats.push(Caveat::Capabilities(service.capabilities.clone()));
        }
        if let Some(secs) = service.valid_for_secs {
            caveats.push(Caveat::ExpiresAt(now.saturating_add(secs)));
        }
        if let Some(max) = service.max_requests {
            caveats.push(Caveat::MaxRequests(max));
        }
        Ok(caveats)
    }
}
