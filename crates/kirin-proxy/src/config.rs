use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use lsat::challenger::{DEFAULT_INVOICE_EXPIRY_SECS, DEFAULT_MEMO};
use lsat::RootKeyPolicy;
use url::Url;

const DEFAULT_ETCD_URL: &str = "http://127.0.0.1:2379";
const DEFAULT_LND_REST_URL: &str = "https://127.0.0.1:8080";
const DEFAULT_SECRETS_DB_PATH: &str = "./kirin-secrets.db";
const DEFAULT_RATE_LIMIT_RPM: u32 = 600;
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_CHALLENGE_TIMEOUT_SECS: u64 = 10;

/// Where root keys are kept.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretStoreBackend {
    Etcd {
        url: String,
        user: Option<String>,
        password: Option<String>,
    },
    Sqlite {
        path: String,
    },
    /// Process-local; credentials do not survive a restart.
    Memory,
}

impl SecretStoreBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            SecretStoreBackend::Etcd { .. } => "etcd",
            SecretStoreBackend::Sqlite { .. } => "sqlite",
            SecretStoreBackend::Memory => "memory",
        }
    }
}

impl std::fmt::Debug for SecretStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretStoreBackend::Etcd {
                url,
                user,
                password,
            } => f
                .debug_struct("Etcd")
                .field("url", url)
                .field("user", user)
                .field("password", &password.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            SecretStoreBackend::Sqlite { path } => {
                f.debug_struct("Sqlite").field("path", path).finish()
            }
            SecretStoreBackend::Memory => f.write_str("Memory"),
        }
    }
}

/// Where invoices come from.
#[derive(Clone, PartialEq, Eq)]
pub enum ChallengerBackend {
    Lnd {
        rest_url: String,
        macaroon_hex: String,
        tls_cert_path: Option<String>,
    },
    /// Local invoices settled through `/dev/pay`; nothing is ever paid.
    Memory,
}

impl ChallengerBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            ChallengerBackend::Lnd { .. } => "lnd",
            ChallengerBackend::Memory => "memory",
        }
    }
}

impl std::fmt::Debug for ChallengerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengerBackend::Lnd {
                rest_url,
                tls_cert_path,
                ..
            } => f
                .debug_struct("Lnd")
                .field("rest_url", rest_url)
                .field("macaroon_hex", &"[REDACTED]")
                .field("tls_cert_path", tls_cert_path)
                .finish(),
            ChallengerBackend::Memory => f.write_str("Memory"),
        }
    }
}

#[derive(Clone)]
pub struct ProxyConfig {
    /// Address the proxy listens on
    pub listen_addr: SocketAddr,
    /// JSON file with the service table
    pub services_file: String,
    /// Directory served for requests no service matches (None = 404)
    pub static_root: Option<String>,
    pub secret_store: SecretStoreBackend,
    pub challenger: ChallengerBackend,
    /// Invoice memo
    pub invoice_memo: String,
    pub invoice_expiry_secs: u64,
    pub root_key_policy: RootKeyPolicy,
    /// Also ask the payment backend whether the invoice was settled
    pub verify_settlement: bool,
    pub store_timeout: Duration,
    pub challenge_timeout: Duration,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// Rate limit requests per minute
    pub rate_limit_rpm: u32,
    /// Bearer token required for /metrics endpoint (None = public)
    pub metrics_token: Option<String>,
    /// Allows in-memory backends and wildcard CORS
    pub insecure_dev: bool,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen_addr", &self.listen_addr)
            .field("services_file", &self.services_file)
            .field("static_root", &self.static_root)
            .field("secret_store", &self.secret_store)
            .field("challenger", &self.challenger)
            .field("invoice_memo", &self.invoice_memo)
            .field("invoice_expiry_secs", &self.invoice_expiry_secs)
            .field("root_key_policy", &self.root_key_policy)
            .field("verify_settlement", &self.verify_settlement)
            .field("store_timeout", &self.store_timeout)
            .field("challenge_timeout", &self.challenge_timeout)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("insecure_dev", &self.insecure_dev)
            .finish()
    }
}

fn flag(value: Option<String>) -> bool {
    value.map(|v| v == "true" || v == "1").unwrap_or(false)
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                var,
                reason: format!("expected a positive number of seconds, got {raw:?}"),
            }),
    }
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(ConfigError::InvalidUrl(raw.to_string())),
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok().filter(|s| !s.is_empty()))
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Required: listen address and service table
        let listen_raw = lookup("LISTEN_ADDR").ok_or(ConfigError::MissingRequired("LISTEN_ADDR"))?;
        let listen_addr: SocketAddr = listen_raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                var: "LISTEN_ADDR",
                reason: format!("not a socket address: {listen_raw}"),
            })?;
        let services_file =
            lookup("SERVICES_FILE").ok_or(ConfigError::MissingRequired("SERVICES_FILE"))?;

        let static_root = lookup("STATIC_ROOT");
        let insecure_dev = flag(lookup("KIRIN_INSECURE_DEV"));

        let secret_store = match lookup("SECRET_STORE").as_deref().unwrap_or("etcd") {
            "etcd" => {
                let url = lookup("ETCD_URL").unwrap_or_else(|| DEFAULT_ETCD_URL.to_string());
                validate_url(&url)?;
                let user = lookup("ETCD_USER");
                let password = lookup("ETCD_PASSWORD");
                if user.is_some() != password.is_some() {
                    return Err(ConfigError::InvalidValue {
                        var: "ETCD_USER",
                        reason: "ETCD_USER and ETCD_PASSWORD must be set together".to_string(),
                    });
                }
                SecretStoreBackend::Etcd {
                    url,
                    user,
                    password,
                }
            }
            "sqlite" => SecretStoreBackend::Sqlite {
                path: lookup("SECRETS_DB_PATH")
                    .unwrap_or_else(|| DEFAULT_SECRETS_DB_PATH.to_string()),
            },
            "memory" if insecure_dev => {
                tracing::warn!(
                    "SECRET_STORE=memory: root keys are lost on restart and not shared \
                     between instances. DO NOT use this in production!"
                );
                SecretStoreBackend::Memory
            }
            "memory" => return Err(ConfigError::InsecureBackend("SECRET_STORE")),
            other => {
                return Err(ConfigError::InvalidValue {
                    var: "SECRET_STORE",
                    reason: format!("expected etcd, sqlite or memory, got {other}"),
                })
            }
        };

        let challenger = match lookup("CHALLENGER").as_deref().unwrap_or("lnd") {
            "lnd" => {
                let rest_url =
                    lookup("LND_REST_URL").unwrap_or_else(|| DEFAULT_LND_REST_URL.to_string());
                validate_url(&rest_url)?;
                let macaroon_hex = lookup("LND_MACAROON_HEX")
                    .ok_or(ConfigError::MissingRequired("LND_MACAROON_HEX"))?;
                if hex::decode(macaroon_hex.trim()).is_err() {
                    return Err(ConfigError::InvalidValue {
                        var: "LND_MACAROON_HEX",
                        reason: "not valid hex".to_string(),
                    });
                }
                ChallengerBackend::Lnd {
                    rest_url,
                    macaroon_hex: macaroon_hex.trim().to_string(),
                    tls_cert_path: lookup("LND_TLS_CERT_PATH"),
                }
            }
            "memory" if insecure_dev => {
                tracing::warn!(
                    "CHALLENGER=memory: invoices are settled through /dev/pay without payment. \
                     DO NOT use this in production!"
                );
                ChallengerBackend::Memory
            }
            "memory" => return Err(ConfigError::InsecureBackend("CHALLENGER")),
            other => {
                return Err(ConfigError::InvalidValue {
                    var: "CHALLENGER",
                    reason: format!("expected lnd or memory, got {other}"),
                })
            }
        };

        let invoice_memo = lookup("INVOICE_MEMO").unwrap_or_else(|| DEFAULT_MEMO.to_string());
        let invoice_expiry_secs =
            parse_secs(&lookup, "INVOICE_EXPIRY_SECS", DEFAULT_INVOICE_EXPIRY_SECS)?;

        let root_key_policy = match lookup("ROOT_KEY_POLICY") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "ROOT_KEY_POLICY",
                reason: format!("expected per-token or per-route, got {raw}"),
            })?,
            None => RootKeyPolicy::default(),
        };
        let verify_settlement = flag(lookup("VERIFY_SETTLEMENT"));

        let store_timeout = Duration::from_secs(parse_secs(
            &lookup,
            "STORE_TIMEOUT_SECS",
            DEFAULT_STORE_TIMEOUT_SECS,
        )?);
        let challenge_timeout = Duration::from_secs(parse_secs(
            &lookup,
            "CHALLENGE_TIMEOUT_SECS",
            DEFAULT_CHALLENGE_TIMEOUT_SECS,
        )?);

        let allowed_origins: Vec<String> = lookup("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let rate_limit_rpm = match lookup("RATE_LIMIT_RPM") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|rpm| *rpm > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: "RATE_LIMIT_RPM",
                    reason: format!("expected a positive integer, got {raw}"),
                })?,
            None => DEFAULT_RATE_LIMIT_RPM,
        };

        let metrics_token = lookup("METRICS_TOKEN");

        // Reject wildcard CORS in production mode
        if allowed_origins.iter().any(|o| o == "*") && !insecure_dev {
            tracing::error!(
                "Wildcard CORS origin '*' is not allowed in production. \
                 Specify explicit origins in ALLOWED_ORIGINS, or set KIRIN_INSECURE_DEV=true for dev."
            );
            return Err(ConfigError::InvalidValue {
                var: "ALLOWED_ORIGINS",
                reason: "wildcard origin '*' requires KIRIN_INSECURE_DEV".to_string(),
            });
        }

        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set, /metrics endpoint is publicly accessible");
        }

        Ok(Self {
            listen_addr,
            services_file,
            static_root,
            secret_store,
            challenger,
            invoice_memo,
            invoice_expiry_secs,
            root_key_policy,
            verify_settlement,
            store_timeout,
            challenge_timeout,
            allowed_origins,
            rate_limit_rpm,
            metrics_token,
            insecure_dev,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("{0}=memory requires KIRIN_INSECURE_DEV=true")]
    InsecureBackend(&'static str),

    #[error("invalid service table: {0}")]
    Services(String),

    #[error("failed to initialize backend: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ProxyConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProxyConfig::from_lookup(|k| map.get(k).cloned())
    }

    const BASE: &[(&str, &str)] = &[
        ("LISTEN_ADDR", "127.0.0.1:8081"),
        ("SERVICES_FILE", "services.json"),
        ("LND_MACAROON_HEX", "0201036c6e64"),
    ];

    fn with(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        BASE.iter().chain(extra.iter()).copied().collect()
    }

    #[test]
    fn test_defaults() {
        let c = config(BASE).unwrap();
        assert_eq!(c.listen_addr.port(), 8081);
        assert_eq!(c.secret_store.kind(), "etcd");
        assert_eq!(c.challenger.kind(), "lnd");
        assert_eq!(c.root_key_policy, RootKeyPolicy::PerToken);
        assert_eq!(c.store_timeout, Duration::from_secs(5));
        assert_eq!(c.challenge_timeout, Duration::from_secs(10));
        assert_eq!(c.invoice_memo, "LSAT");
        assert!(!c.verify_settlement);
    }

    #[test]
    fn test_missing_required() {
        assert!(matches!(
            config(&[("SERVICES_FILE", "s.json")]),
            Err(ConfigError::MissingRequired("LISTEN_ADDR"))
        ));
        assert!(matches!(
            config(&[("LISTEN_ADDR", "127.0.0.1:1"), ("SERVICES_FILE", "s.json")]),
            Err(ConfigError::MissingRequired("LND_MACAROON_HEX"))
        ));
    }

    #[test]
    fn test_memory_backends_need_insecure_flag() {
        assert!(matches!(
            config(&with(&[("SECRET_STORE", "memory")])),
            Err(ConfigError::InsecureBackend("SECRET_STORE"))
        ));
        let c = config(&[
            ("LISTEN_ADDR", "127.0.0.1:8081"),
            ("SERVICES_FILE", "s.json"),
            ("SECRET_STORE", "memory"),
            ("CHALLENGER", "memory"),
            ("KIRIN_INSECURE_DEV", "true"),
        ])
        .unwrap();
        assert_eq!(c.secret_store, SecretStoreBackend::Memory);
        assert_eq!(c.challenger, ChallengerBackend::Memory);
    }

    #[test]
    fn test_invalid_values() {
        assert!(config(&with(&[("ROOT_KEY_POLICY", "shared")])).is_err());
        assert!(config(&with(&[("STORE_TIMEOUT_SECS", "0")])).is_err());
        assert!(config(&with(&[("ETCD_URL", "etcd://x")])).is_err());
        assert!(config(&with(&[("ETCD_USER", "kirin")])).is_err());
        assert!(config(&with(&[("ALLOWED_ORIGINS", "*")])).is_err());
        assert!(config(&[
            ("LISTEN_ADDR", "nope"),
            ("SERVICES_FILE", "s.json"),
            ("LND_MACAROON_HEX", "00"),
        ])
        .is_err());
    }

    #[test]
    fn test_per_route_policy_and_sqlite() {
        let c = config(&with(&[
            ("ROOT_KEY_POLICY", "per-route"),
            ("SECRET_STORE", "sqlite"),
            ("SECRETS_DB_PATH", "/tmp/k.db"),
        ]))
        .unwrap();
        assert_eq!(c.root_key_policy, RootKeyPolicy::PerRoute);
        assert_eq!(
            c.secret_store,
            SecretStoreBackend::Sqlite {
                path: "/tmp/k.db".to_string()
            }
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let c = config(&with(&[
            ("ETCD_USER", "kirin"),
            ("ETCD_PASSWORD", "hunter2"),
            ("METRICS_TOKEN", "tok"),
        ]))
        .unwrap();
        let debug = format!("{c:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("0201036c6e64"));
        assert!(!debug.contains("\"tok\""));
    }
}
