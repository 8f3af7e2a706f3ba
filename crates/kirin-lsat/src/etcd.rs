//! Root keys in an etcd cluster, via the etcd v3 JSON gateway.
//!
//! Every proxy instance pointed at the same cluster sees the same keys, and
//! etcd's linearizable reads give read-your-writes across instances.
//! Create-if-absent is a single transaction guarded on `create_revision == 0`;
//! the failure branch reads the existing value in the same transaction, so a
//! losing writer gets the winner's key without a second round trip.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::identifier::RootKeyId;
use crate::secrets::{RootKey, SecretStore};

/// Top level key under which all proxy data lives in a shared cluster.
pub const TOP_LEVEL_KEY: &str = "lsat/proxy";

/// Delimiter for path-like etcd keys.
pub const KEY_DELIMITER: &str = "/";

/// Sub-namespace for root keys.
pub const SECRETS_PREFIX: &str = "secrets";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Full etcd key for a root key id.
pub fn secret_key(id: &RootKeyId) -> String {
    [TOP_LEVEL_KEY, SECRETS_PREFIX, &id.to_hex()].join(KEY_DELIMITER)
}

/// Connection settings for [`EtcdSecretStore`].
#[derive(Clone)]
pub struct EtcdConfig {
    /// Gateway base URL, e.g. `http://127.0.0.1:2379`.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl EtcdConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for EtcdConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize)]
struct RangeRequest<'a> {
    key: &'a str,
}

#[derive(Serialize)]
struct PutRequest<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct Compare<'a> {
    key: &'a str,
    result: &'static str,
    target: &'static str,
    create_revision: i64,
}

#[derive(Serialize)]
enum RequestOp<'a> {
    #[serde(rename = "request_put")]
    Put(PutRequest<'a>),
    #[serde(rename = "request_range")]
    Range(RangeRequest<'a>),
}

#[derive(Serialize)]
struct TxnRequest<'a> {
    compare: Vec<Compare<'a>>,
    success: Vec<RequestOp<'a>>,
    failure: Vec<RequestOp<'a>>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

// proto3 JSON omits default values, so every field may be absent.
#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct ResponseOp {
    #[serde(default)]
    response_range: Option<RangeResponse>,
}

#[derive(Debug, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
    #[serde(default)]
    responses: Vec<ResponseOp>,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

/// [`SecretStore`] backed by an etcd cluster.
pub struct EtcdSecretStore {
    client: reqwest::Client,
    config: EtcdConfig,
    token: RwLock<Option<String>>,
}

impl EtcdSecretStore {
    pub fn new(config: EtcdConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StoreError::Unreachable(format!("failed to build etcd client: {e}")))?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Auth token for the configured user, fetched once and reused.
    async fn auth_token(&self) -> Result<Option<String>, StoreError> {
        let (Some(user), Some(password)) = (&self.config.user, &self.config.password) else {
            return Ok(None);
        };
        if let Some(token) = self.token.read().await.clone() {
            return Ok(Some(token));
        }

        let resp = self
            .client
            .post(self.endpoint("/v3/auth/authenticate"))
            .json(&serde_json::json!({ "name": user, "password": password }))
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(format!("etcd auth request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(StoreError::Unreachable(format!(
                "etcd auth rejected: {}",
                resp.status()
            )));
        }
        let auth: AuthResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Unreachable(format!("invalid etcd auth response: {e}")))?;

        *self.token.write().await = Some(auth.token.clone());
        Ok(Some(auth.token))
    }

    async fn call<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, StoreError> {
        let mut req = self.client.post(self.endpoint(path)).json(body);
        if let Some(token) = self.auth_token().await? {
            req = req.header("Authorization", token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(format!("etcd request failed: {e}")))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Token expired; the next call authenticates again.
            *self.token.write().await = None;
        }
        if !status.is_success() {
            return Err(StoreError::Unreachable(format!("etcd returned {status}")));
        }
        resp.json()
            .await
            .map_err(|e| StoreError::Unreachable(format!("invalid etcd response: {e}")))
    }
}

fn decode_value(kv: &KeyValue) -> Result<RootKey, StoreError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&kv.value)
        .map_err(|e| StoreError::Corrupted(format!("root key is not base64: {e}")))?;
    RootKey::from_slice(&bytes)
}

#[async_trait]
impl SecretStore for EtcdSecretStore {
    async fn new_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        let key = b64(secret_key(id).as_bytes());
        let candidate = RootKey::random();
        let value = b64(candidate.as_bytes());

        let txn = TxnRequest {
            compare: vec![Compare {
                key: &key,
                result: "EQUAL",
                target: "CREATE",
                create_revision: 0,
            }],
            success: vec![RequestOp::Put(PutRequest {
                key: &key,
                value: &value,
            })],
            failure: vec![RequestOp::Range(RangeRequest { key: &key })],
        };

        let resp: TxnResponse = self.call("/v3/kv/txn", &txn).await?;
        if resp.succeeded {
            tracing::debug!(root_key_id = %id, "created root key in etcd");
            return Ok(candidate);
        }

        let existing = resp
            .responses
            .iter()
            .filter_map(|op| op.response_range.as_ref())
            .flat_map(|range| range.kvs.iter())
            .next()
            .ok_or_else(|| {
                StoreError::Corrupted("txn failed but no existing key returned".to_string())
            })?;
        decode_value(existing)
    }

    async fn get_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        let key = b64(secret_key(id).as_bytes());
        let resp: RangeResponse = self
            .call("/v3/kv/range", &RangeRequest { key: &key })
            .await?;
        match resp.kvs.first() {
            Some(kv) => decode_value(kv),
            None => Err(StoreError::NotFound),
        }
    }
}
