//! Build backends and shared state from a [`ProxyConfig`].

use std::sync::Arc;

use lsat::{
    CachedSecretStore, Challenger, EtcdConfig, EtcdSecretStore, InMemoryChallenger,
    InMemorySecretStore, LndChallenger, LndConfig, SecretStore, SqliteSecretStore,
};

use crate::config::{ChallengerBackend, ConfigError, ProxyConfig, SecretStoreBackend};
use crate::services::ServiceTable;
use crate::state::AppState;

/// Open the configured secret store, behind a read-through cache.
pub fn secret_store(config: &ProxyConfig) -> Result<Arc<dyn SecretStore>, ConfigError> {
    let store: Arc<dyn SecretStore> = match &config.secret_store {
        SecretStoreBackend::Etcd {
            url,
            user,
            password,
        } => {
            let mut etcd = EtcdConfig::new(url.clone());
            etcd.user = user.clone();
            etcd.password = password.clone();
            etcd.timeout = config.store_timeout;
            tracing::info!("Secret store: etcd at {}", url);
            Arc::new(CachedSecretStore::new(
                EtcdSecretStore::new(etcd).map_err(|e| ConfigError::Backend(e.to_string()))?,
            ))
        }
        SecretStoreBackend::Sqlite { path } => {
            // No in-memory fallback: keys lost on restart invalidate every
            // credential already sold.
            let sqlite = SqliteSecretStore::open(path).map_err(|e| {
                tracing::error!("Failed to open SQLite secret store at {}: {}", path, e);
                ConfigError::Backend(format!("sqlite secret store at {path}: {e}"))
            })?;
            tracing::info!("Secret store: SQLite at {}", path);
            Arc::new(CachedSecretStore::new(sqlite))
        }
        SecretStoreBackend::Memory => {
            tracing::info!("Secret store: in-memory (dev mode)");
            Arc::new(InMemorySecretStore::new())
        }
    };
    Ok(store)
}

/// Backend the proxy asks for invoices.
pub enum ChallengerHandle {
    Lnd(Arc<LndChallenger>),
    Memory(Arc<InMemoryChallenger>),
}

impl ChallengerHandle {
    pub fn as_dyn(&self) -> Arc<dyn Challenger> {
        match self {
            ChallengerHandle::Lnd(c) => c.clone() as Arc<dyn Challenger>,
            ChallengerHandle::Memory(c) => c.clone() as Arc<dyn Challenger>,
        }
    }
}

pub fn challenger(config: &ProxyConfig) -> Result<ChallengerHandle, ConfigError> {
    match &config.challenger {
        ChallengerBackend::Lnd {
            rest_url,
            macaroon_hex,
            tls_cert_path,
        } => {
            let mut lnd = LndConfig::new(rest_url.clone(), macaroon_hex.clone());
            lnd.tls_cert_path = tls_cert_path.clone();
            lnd.invoice_expiry_secs = config.invoice_expiry_secs;
            lnd.timeout = config.challenge_timeout;
            tracing::info!("Challenger: LND at {}", rest_url);
            let lnd = LndChallenger::new(lnd).map_err(|e| ConfigError::Backend(e.to_string()))?;
            Ok(ChallengerHandle::Lnd(Arc::new(lnd)))
        }
        ChallengerBackend::Memory => {
            tracing::info!("Challenger: in-memory invoices (dev mode)");
            Ok(ChallengerHandle::Memory(Arc::new(
                InMemoryChallenger::new().with_expiry(config.invoice_expiry_secs),
            )))
        }
    }
}

/// Load the service table and wire every backend into an [`AppState`].
pub fn build_state(config: ProxyConfig) -> Result<AppState, ConfigError> {
    let services = ServiceTable::load(&config.services_file)?;
    if services.is_empty() {
        tracing::warn!("Service table {} is empty", config.services_file);
    }
    tracing::info!(
        "Loaded {} services from {}",
        services.len(),
        config.services_file
    );

    let secrets = secret_store(&config)?;
    let handle = challenger(&config)?;
    let state = AppState::new(config, services, secrets, handle.as_dyn())?;

    Ok(match handle {
        ChallengerHandle::Memory(wallet) => state.with_dev_wallet(wallet),
        ChallengerHandle::Lnd(_) => state,
    })
}
