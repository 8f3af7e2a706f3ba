//! Payment obligations.
//!
//! A [`Challenger`] asks the payment backend for an invoice and can later
//! report whether it was paid. The proxy treats it as an opaque, possibly
//! slow, possibly failing network call; callers bound it with a timeout.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ChallengeError;
use crate::identifier::{PaymentHash, Preimage};

/// Memo attached to invoices when none is configured.
pub const DEFAULT_MEMO: &str = "LSAT";

/// Default invoice lifetime in seconds.
pub const DEFAULT_INVOICE_EXPIRY_SECS: u64 = 3600;

/// A payment the caller must settle before their credential becomes usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    /// Payment request string (BOLT 11 for Lightning backends).
    pub invoice: String,
    /// Unix time after which the invoice can no longer be paid.
    pub expires_at: u64,
}

/// Settlement state of an obligation as reported by the payment backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Settlement {
    Settled,
    Pending,
    Expired,
}

/// Creates payment obligations and reports their settlement.
#[async_trait]
pub trait Challenger: Send + Sync {
    /// Request a fresh obligation. Every call must yield a distinct payment hash.
    async fn new_obligation(
        &self,
        purpose: &str,
        amount_msat: u64,
    ) -> Result<Obligation, ChallengeError>;

    /// Authoritative settlement state for a payment hash.
    async fn settlement(&self, payment_hash: &PaymentHash) -> Result<Settlement, ChallengeError>;
}

#[async_trait]
impl<C: Challenger + ?Sized> Challenger for Arc<C> {
    async fn new_obligation(
        &self,
        purpose: &str,
        amount_msat: u64,
    ) -> Result<Obligation, ChallengeError> {
        (**self).new_obligation(purpose, amount_msat).await
    }

    async fn settlement(&self, payment_hash: &PaymentHash) -> Result<Settlement, ChallengeError> {
        (**self).settlement(payment_hash).await
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct PendingInvoice {
    preimage: Preimage,
    expires_at: u64,
    settled: bool,
}

/// Challenger that issues invoices locally without any payment network.
///
/// Only for development and tests: [`InMemoryChallenger::pay`] settles an
/// invoice and hands back its preimage, standing in for a wallet.
pub struct InMemoryChallenger {
    invoices: DashMap<PaymentHash, PendingInvoice>,
    expiry_secs: u64,
}

impl InMemoryChallenger {
    pub fn new() -> Self {
        Self {
            invoices: DashMap::new(),
            expiry_secs: DEFAULT_INVOICE_EXPIRY_SECS,
        }
    }

    pub fn with_expiry(mut self, expiry_secs: u64) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }

    /// Mark the invoice as paid and return its preimage.
    pub fn pay(&self, payment_hash: &PaymentHash) -> Option<Preimage> {
        let mut invoice = self.invoices.get_mut(payment_hash)?;
        invoice.settled = true;
        Some(invoice.preimage)
    }

    /// Number of obligations issued so far.
    pub fn issued(&self) -> usize {
        self.invoices.len()
    }
}

impl Default for InMemoryChallenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Challenger for InMemoryChallenger {
    async fn new_obligation(
        &self,
        purpose: &str,
        amount_msat: u64,
    ) -> Result<Obligation, ChallengeError> {
        let preimage = Preimage::random();
        let payment_hash = preimage.hash();
        let expires_at = unix_now().saturating_add(self.expiry_secs);

        self.invoices.insert(
            payment_hash,
            PendingInvoice {
                preimage,
                expires_at,
                settled: false,
            },
        );
        tracing::debug!(%payment_hash, purpose, amount_msat, "issued local invoice");

        Ok(Obligation {
            payment_hash,
            amount_msat,
            invoice: format!("lnmock{amount_msat}m1{}", payment_hash.to_hex()),
            expires_at,
        })
    }

    async fn settlement(&self, payment_hash: &PaymentHash) -> Result<Settlement, ChallengeError> {
        let invoice = self
            .invoices
            .get(payment_hash)
            .ok_or_else(|| ChallengeError::Rejected("unknown payment hash".to_string()))?;
        Ok(if invoice.settled {
            Settlement::Settled
        } else if unix_now() >= invoice.expires_at {
            Settlement::Expired
        } else {
            Settlement::Pending
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_obligations_have_distinct_hashes() {
        let challenger = InMemoryChallenger::new();
        let a = challenger.new_obligation("LSAT", 1000).await.unwrap();
        let b = challenger.new_obligation("LSAT", 1000).await.unwrap();
        assert_ne!(a.payment_hash, b.payment_hash);
        assert_eq!(a.amount_msat, 1000);
        assert!(a.invoice.starts_with("lnmock1000m1"));
        assert_eq!(challenger.issued(), 2);
    }

    #[tokio::test]
    async fn test_pay_settles_and_returns_matching_preimage() {
        let challenger = InMemoryChallenger::new();
        let ob = challenger.new_obligation("LSAT", 1).await.unwrap();
        assert_eq!(
            challenger.settlement(&ob.payment_hash).await.unwrap(),
            Settlement::Pending
        );

        let preimage = challenger.pay(&ob.payment_hash).unwrap();
        assert_eq!(preimage.hash(), ob.payment_hash);
        assert_eq!(
            challenger.settlement(&ob.payment_hash).await.unwrap(),
            Settlement::Settled
        );
    }

    #[tokio::test]
    async fn test_unpaid_invoice_expires() {
        let challenger = InMemoryChallenger::new().with_expiry(0);
        let ob = challenger.new_obligation("LSAT", 1).await.unwrap();
        assert_eq!(
            challenger.settlement(&ob.payment_hash).await.unwrap(),
            Settlement::Expired
        );
    }

    #[tokio::test]
    async fn test_unknown_hash_is_rejected() {
        let challenger = InMemoryChallenger::new();
        assert!(challenger.settlement(&PaymentHash([0; 32])).await.is_err());
        assert!(challenger.pay(&PaymentHash([0; 32])).is_none());
    }
}
