//! Backend service table.
//!
//! Loaded once at startup from a JSON array. Requests are routed to the first
//! service (in file order) whose host pattern matches the request host and
//! whose path pattern, if any, matches the request path.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use lsat::ServiceLimits;
use regex::Regex;
use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    On,
    /// Forwarded without any credential check.
    Off,
}

fn default_host_regexp() -> String {
    ".*".to_string()
}

/// One entry of the services file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Name, price and caveat settings; `name` doubles as the route.
    #[serde(flatten)]
    pub limits: ServiceLimits,
    /// Backend `host:port`.
    pub address: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_host_regexp")]
    pub host_regexp: String,
    #[serde(default)]
    pub path_regexp: Option<String>,
    #[serde(default)]
    pub auth: AuthMode,
    /// Extra headers added to every forwarded request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// A service with its patterns compiled.
#[derive(Debug, Clone)]
pub struct Service {
    pub config: ServiceConfig,
    host: Regex,
    path: Option<Regex>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.config.limits.name
    }

    pub fn auth(&self) -> AuthMode {
        self.config.auth
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        self.host.is_match(host) && self.path.as_ref().map_or(true, |p| p.is_match(path))
    }

    /// Upstream URL for a request path and optional query string.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "{}://{}{}",
            self.config.protocol.scheme(),
            self.config.address.trim_end_matches('/'),
            path
        );
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}

/// Service names and capabilities are written into comma-separated caveat
/// values, which are trimmed and split on ',' when read back.
fn caveat_safe(value: &str) -> bool {
    !value.is_empty() && value == value.trim() && !value.contains([',', '='])
}

#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    services: Vec<Service>,
}

impl ServiceTable {
    pub fn from_configs(configs: Vec<ServiceConfig>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(configs.len());

        for config in configs {
            let name = config.limits.name.as_str();
            if !caveat_safe(name) {
                return Err(ConfigError::Services(format!(
                    "service name must be non-empty, unpadded and free of ',' and '=': {name:?}"
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::Services(format!("duplicate service name: {name}")));
            }
            if let Some(cap) = config.limits.capabilities.iter().find(|c| !caveat_safe(c)) {
                return Err(ConfigError::Services(format!(
                    "service {name}: capability must be non-empty, unpadded and free of ',' and '=': {cap:?}"
                )));
            }
            if config.address.trim().is_empty() || config.address.contains("://") {
                return Err(ConfigError::Services(format!(
                    "service {name}: address must be host:port, got {:?}",
                    config.address
                )));
            }

            let host = Regex::new(&config.host_regexp).map_err(|e| {
                ConfigError::Services(format!("service {name}: bad host_regexp: {e}"))
            })?;
            let path = config
                .path_regexp
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| ConfigError::Services(format!("service {name}: bad path_regexp: {e}")))?;

            services.push(Service { config, host, path });
        }

        Ok(Self { services })
    }

    /// Read and validate a JSON services file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Services(format!("{}: {e}", path.display())))?;
        let configs: Vec<ServiceConfig> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Services(format!("{}: {e}", path.display())))?;
        Self::from_configs(configs)
    }

    /// First service matching the request, in file order.
    pub fn resolve(&self, host: &str, path: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.matches(host, path))
    }

    /// Price and caveat settings of every metered service.
    pub fn limits(&self) -> impl Iterator<Item = ServiceLimits> + '_ {
        self.services
            .iter()
            .filter(|s| s.auth() == AuthMode::On)
            .map(|s| s.config.limits.clone())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(json: &str) -> Result<ServiceTable, ConfigError> {
        ServiceTable::from_configs(serde_json::from_str(json).unwrap())
    }

    const SERVICES: &str = r#"[
        {"name": "premium", "address": "127.0.0.1:9000", "host_regexp": "^api\\.example\\.com", "path_regexp": "^/premium", "price_msat": 5000, "capabilities": ["read"], "valid_for_secs": 3600},
        {"name": "open", "address": "127.0.0.1:9001", "path_regexp": "^/public", "auth": "off"},
        {"name": "fallback", "address": "backend:443", "protocol": "https", "headers": {"X-Api-Key": "k"}}
    ]"#;

    #[test]
    fn test_first_match_wins() {
        let t = table(SERVICES).unwrap();
        assert_eq!(t.resolve("api.example.com", "/premium/x").unwrap().name(), "premium");
        assert_eq!(t.resolve("other.host", "/premium/x").unwrap().name(), "fallback");
        assert_eq!(t.resolve("api.example.com", "/public/a").unwrap().name(), "open");
        assert_eq!(t.resolve("api.example.com", "/anything").unwrap().name(), "fallback");
    }

    #[test]
    fn test_no_match() {
        let t = table(r#"[{"name": "a", "address": "h:1", "path_regexp": "^/a$"}]"#).unwrap();
        assert!(t.resolve("h", "/b").is_none());
    }

    #[test]
    fn test_defaults_and_limits() {
        let t = table(SERVICES).unwrap();
        let fallback = t.resolve("x", "/").unwrap();
        assert_eq!(fallback.config.limits.price_msat, lsat::limiter::DEFAULT_PRICE_MSAT);
        assert_eq!(fallback.auth(), AuthMode::On);
        assert_eq!(fallback.upstream_url("/v1/x", Some("a=1")), "https://backend:443/v1/x?a=1");

        let names: Vec<String> = t.limits().map(|l| l.name).collect();
        assert_eq!(names, vec!["premium", "fallback"]);
    }

    #[test]
    fn test_validation() {
        assert!(table(r#"[{"name": "a", "address": "h:1"}, {"name": "a", "address": "h:2"}]"#).is_err());
        assert!(table(r#"[{"name": "a", "address": "h:1", "host_regexp": "("}]"#).is_err());
        assert!(table(r#"[{"name": "a", "address": "http://h:1"}]"#).is_err());
        assert!(table(r#"[{"name": "a,b", "address": "h:1"}]"#).is_err());
        assert!(table(r#"[{"name": "", "address": "h:1"}]"#).is_err());
    }

    #[test]
    fn test_names_and_capabilities_must_survive_caveat_text() {
        for bad in [
            r#"[{"name": " premium", "address": "h:1"}]"#,
            r#"[{"name": "premium ", "address": "h:1"}]"#,
            r#"[{"name": "a=b", "address": "h:1"}]"#,
            r#"[{"name": "a", "address": "h:1", "capabilities": ["read", " write"]}]"#,
            r#"[{"name": "a", "address": "h:1", "capabilities": [""]}]"#,
            r#"[{"name": "a", "address": "h:1", "capabilities": ["read,write"]}]"#,
            r#"[{"name": "a", "address": "h:1", "capabilities": ["x=y"]}]"#,
        ] {
            assert!(table(bad).is_err(), "accepted {bad}");
        }
        assert!(table(r#"[{"name": "a", "address": "h:1", "capabilities": ["read", "write"]}]"#).is_ok());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SERVICES.as_bytes()).unwrap();
        let t = ServiceTable::load(file.path()).unwrap();
        assert_eq!(t.len(), 3);

        assert!(ServiceTable::load("/nonexistent/services.json").is_err());
    }
}
