use std::sync::Arc;
use std::time::Duration;

use lsat::{
    Authenticator, AuthenticatorConfig, Challenger, InMemoryChallenger, Minter, MinterConfig,
    SecretStore, StaticServiceLimiter, UsageMeter,
};

use crate::config::{ConfigError, ProxyConfig};
use crate::services::ServiceTable;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub services: Arc<ServiceTable>,
    pub minter: Arc<Minter>,
    pub authenticator: Arc<Authenticator>,
    pub http_client: reqwest::Client,
    /// Local invoice backend, exposed through `/dev/pay` (dev mode only)
    pub dev_wallet: Option<Arc<InMemoryChallenger>>,
}

impl AppState {
    pub fn new(
        config: ProxyConfig,
        services: ServiceTable,
        secrets: Arc<dyn SecretStore>,
        challenger: Arc<dyn Challenger>,
    ) -> Result<Self, ConfigError> {
        let http_client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none()) // Relay redirects to the client as-is
            .build()
            .map_err(|e| ConfigError::Backend(format!("failed to create HTTP client: {e}")))?;

        let limiter = Arc::new(StaticServiceLimiter::new(services.limits()));
        let minter = Minter::new(challenger.clone(), secrets.clone(), limiter).with_config(
            MinterConfig {
                memo: config.invoice_memo.clone(),
                key_policy: config.root_key_policy,
                challenge_timeout: config.challenge_timeout,
                store_timeout: config.store_timeout,
            },
        );
        let authenticator = Authenticator::new(secrets, challenger, Arc::new(UsageMeter::new()))
            .with_config(AuthenticatorConfig {
                verify_settlement: config.verify_settlement,
                store_timeout: config.store_timeout,
                challenge_timeout: config.challenge_timeout,
            });

        Ok(Self {
            config: Arc::new(config),
            services: Arc::new(services),
            minter: Arc::new(minter),
            authenticator: Arc::new(authenticator),
            http_client,
            dev_wallet: None,
        })
    }

    pub fn with_dev_wallet(mut self, wallet: Arc<InMemoryChallenger>) -> Self {
        self.dev_wallet = Some(wallet);
        self
    }
}
