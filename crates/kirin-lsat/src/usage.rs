//! Per-token request counters for `max_requests` caveats.
//!
//! Counters live in process memory, so a quota is enforced per proxy
//! instance. A counter is dropped by [`UsageMeter::purge_expired`] once its
//! credential's `expires_at` has passed; counters for credentials without an
//! expiry are kept for the life of the process.

use dashmap::DashMap;

use crate::identifier::TokenId;

#[derive(Debug, Clone, Copy)]
struct Usage {
    count: u64,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
pub struct UsageMeter {
    counts: DashMap<TokenId, Usage>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests already admitted for `token`.
    pub fn used(&self, token: &TokenId) -> u64 {
        self.counts.get(token).map(|u| u.count).unwrap_or(0)
    }

    /// Claim one request against a quota of `max`.
    ///
    /// The check and the increment happen under the same map entry lock, so
    /// concurrent callers can never admit more than `max` requests in total.
    pub fn try_consume(&self, token: TokenId, max: u64, expires_at: Option<u64>) -> bool {
        let mut usage = self.counts.entry(token).or_insert(Usage {
            count: 0,
            expires_at,
        });
        if usage.count >= max {
            return false;
        }
        usage.count += 1;
        true
    }

    /// Drop counters whose credential expired at or before `now`. Returns the
    /// number removed.
    pub fn purge_expired(&self, now: u64) -> usize {
        let before = self.counts.len();
        self.counts
            .retain(|_, usage| !matches!(usage.expires_at, Some(at) if at <= now));
        before - self.counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_per_token() {
        let meter = UsageMeter::new();
        let a = TokenId([1; 32]);
        let b = TokenId([2; 32]);

        assert_eq!(meter.used(&a), 0);
        assert!(meter.try_consume(a, 2, None));
        assert!(meter.try_consume(a, 2, None));
        assert!(!meter.try_consume(a, 2, None));
        assert_eq!(meter.used(&a), 2);
        assert_eq!(meter.used(&b), 0);
        assert!(meter.try_consume(b, 2, None));
    }

    #[test]
    fn test_zero_quota_admits_nothing() {
        let meter = UsageMeter::new();
        assert!(!meter.try_consume(TokenId([3; 32]), 0, None));
    }

    #[test]
    fn test_concurrent_consumers_never_exceed_quota() {
        let meter = Arc::new(UsageMeter::new());
        let token = TokenId([4; 32]);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let meter = Arc::clone(&meter);
                std::thread::spawn(move || (0..50).filter(|_| meter.try_consume(token, 10, None)).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 10);
        assert_eq!(meter.used(&token), 10);
    }

    #[test]
    fn test_purge_expired() {
        let meter = UsageMeter::new();
        let expired = TokenId([5; 32]);
        let live = TokenId([6; 32]);
        let forever = TokenId([7; 32]);

        assert!(meter.try_consume(expired, 5, Some(100)));
        assert!(meter.try_consume(live, 5, Some(200)));
        assert!(meter.try_consume(forever, 5, None));

        assert_eq!(meter.purge_expired(100), 1);
        assert_eq!(meter.used(&expired), 0);
        assert_eq!(meter.used(&live), 1);
        assert_eq!(meter.used(&forever), 1);

        assert_eq!(meter.purge_expired(u64::MAX), 1);
        assert_eq!(meter.used(&forever), 1);
    }

    #[test]
    fn test_purge_many() {
        let meter = UsageMeter::new();
        for i in 0..1000u32 {
            let mut id = [0u8; 32];
            id[..4].copy_from_slice(&i.to_be_bytes());
            assert!(meter.try_consume(TokenId(id), 1, Some(u64::from(i))));
        }
        assert_eq!(meter.purge_expired(1000), 1000);
        assert_eq!(meter.purge_expired(1000), 0);
    }
}
