//! LSAT credentials for metered HTTP access.
//!
//! An LSAT is a macaroon-style bearer credential whose identifier embeds the
//! payment hash of a Lightning invoice. Holding the credential is not enough:
//! a request is admitted only together with the invoice preimage, which the
//! caller learns by paying.
//!
//! # Two-step model
//!
//! - **Minter** ([`Minter`]) asks the payment backend for an obligation and
//!   signs a credential bound to it
//! - **Authenticator** ([`Authenticator`]) checks a presented credential and
//!   preimage and returns a [`Decision`]
//!
//! Signing keys live in a shared [`SecretStore`] so any proxy instance can
//! verify credentials minted by another.
//!
//! # Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lsat::{
//!     authorization_value, Authenticator, InMemoryChallenger, InMemorySecretStore, Minter,
//!     ServiceLimits, StaticServiceLimiter, UsageMeter,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let challenger = Arc::new(InMemoryChallenger::new());
//! let secrets = Arc::new(InMemorySecretStore::new());
//! let limiter = Arc::new(StaticServiceLimiter::new([ServiceLimits::new("premium")]));
//!
//! let minter = Minter::new(challenger.clone(), secrets.clone(), limiter);
//! let (credential, obligation) = minter.mint("premium").await.unwrap();
//!
//! let preimage = challenger.pay(&obligation.payment_hash).unwrap();
//! let header = authorization_value(&credential, &preimage);
//!
//! let auth = Authenticator::new(secrets, challenger, Arc::new(UsageMeter::new()));
//! let decision = auth.authenticate(Some(&header), "premium", 0).await;
//! assert!(decision.is_allow());
//! # }
//! ```

// Credential format
pub mod caveat;
pub mod credential;
pub mod error;
pub mod header;
pub mod identifier;

// Collaborators
pub mod challenger;
pub mod limiter;
pub mod secrets;
pub mod usage;

// Mint and verify
pub mod authenticator;
pub mod minter;

// Network backends
#[cfg(feature = "full")]
pub mod etcd;
#[cfg(feature = "full")]
pub mod lnd;

// Re-exports
pub use authenticator::{Authenticator, AuthenticatorConfig, Decision, DenyReason, Grant};
pub use caveat::{Capabilities, Caveat, RequestContext};
pub use challenger::{Challenger, InMemoryChallenger, Obligation, Settlement};
pub use credential::Credential;
pub use error::{ChallengeError, LsatError, StoreError};
pub use header::{authorization_value, parse_authorization, Challenge, PresentedToken};
pub use identifier::{Identifier, PaymentHash, Preimage, RootKeyId, TokenId};
pub use limiter::{ServiceLimits, StaticServiceLimiter};
pub use minter::{Minter, MinterConfig, RootKeyPolicy};
pub use secrets::{CachedSecretStore, InMemorySecretStore, RootKey, SecretStore};
pub use usage::UsageMeter;

#[cfg(feature = "full")]
pub use etcd::{EtcdConfig, EtcdSecretStore};
#[cfg(feature = "full")]
pub use lnd::{LndChallenger, LndConfig};
#[cfg(feature = "full")]
pub use secrets::SqliteSecretStore;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    challenger::unix_now()
}
