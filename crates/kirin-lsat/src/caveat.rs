//! First-party caveats and their evaluation.
//!
//! A caveat is a restriction appended to a credential. Caveats are
//! conjunctive: every caveat must pass on its own, so appending one can only
//! narrow what a credential allows. Repeated conditions are all evaluated;
//! capability caveats intersect.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::LsatError;

pub const CONDITION_ROUTES: &str = "routes";
pub const CONDITION_CAPABILITIES: &str = "capabilities";
pub const CONDITION_EXPIRES_AT: &str = "expires_at";
pub const CONDITION_MAX_REQUESTS: &str = "max_requests";

/// Restriction embedded in a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caveat {
    /// Request route must be one of these service names.
    Routes(Vec<String>),
    /// Capabilities granted to the bearer.
    Capabilities(Vec<String>),
    /// Unix time (seconds) at which the credential stops being valid.
    ExpiresAt(u64),
    /// Maximum number of admitted requests for this token.
    MaxRequests(u64),
}

/// Per-request facts caveats are evaluated against.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Service name the request was routed to.
    pub route: String,
    /// Current unix time in seconds.
    pub now: u64,
    /// Requests already admitted with this token.
    pub requests_used: u64,
}

/// Capabilities left after every capability caveat is applied.
///
/// `None` means no capability caveat was present, i.e. the credential is not
/// capability-restricted.
pub type Capabilities = Option<BTreeSet<String>>;

impl Caveat {
    pub fn condition(&self) -> &'static str {
        match self {
            Caveat::Routes(_) => CONDITION_ROUTES,
            Caveat::Capabilities(_) => CONDITION_CAPABILITIES,
            Caveat::ExpiresAt(_) => CONDITION_EXPIRES_AT,
            Caveat::MaxRequests(_) => CONDITION_MAX_REQUESTS,
        }
    }

    /// Check this caveat alone against the request.
    pub fn check(&self, ctx: &RequestContext) -> bool {
        match self {
            Caveat::Routes(routes) => routes.iter().any(|r| r == &ctx.route),
            // Evaluated jointly in `evaluate`, an individual list always passes.
            Caveat::Capabilities(_) => true,
            Caveat::ExpiresAt(at) => ctx.now < *at,
            Caveat::MaxRequests(max) => ctx.requests_used < *max,
        }
    }
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caveat::Routes(v) | Caveat::Capabilities(v) => {
                write!(f, "{}={}", self.condition(), v.join(","))
            }
            Caveat::ExpiresAt(n) | Caveat::MaxRequests(n) => {
                write!(f, "{}={}", self.condition(), n)
            }
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl FromStr for Caveat {
    type Err = LsatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (condition, value) = s
            .split_once('=')
            .ok_or_else(|| LsatError::Malformed(format!("caveat without '=': {s}")))?;
        let number = |v: &str| {
            v.parse::<u64>()
                .map_err(|e| LsatError::Malformed(format!("caveat {condition}: {e}")))
        };
        match condition.trim() {
            CONDITION_ROUTES => Ok(Caveat::Routes(parse_list(value))),
            CONDITION_CAPABILITIES => Ok(Caveat::Capabilities(parse_list(value))),
            CONDITION_EXPIRES_AT => Ok(Caveat::ExpiresAt(number(value.trim())?)),
            CONDITION_MAX_REQUESTS => Ok(Caveat::MaxRequests(number(value.trim())?)),
            other => Err(LsatError::Malformed(format!(
                "unknown caveat condition: {other}"
            ))),
        }
    }
}

/// Evaluate caveats in order. Returns the resolved capabilities, or the
/// condition name of the first caveat that fails.
pub fn evaluate(caveats: &[Caveat], ctx: &RequestContext) -> Result<Capabilities, &'static str> {
    let mut granted: Capabilities = None;

    for caveat in caveats {
        if !caveat.check(ctx) {
            return Err(caveat.condition());
        }
        if let Caveat::Capabilities(list) = caveat {
            let set: BTreeSet<String> = list.iter().cloned().collect();
            let next = match granted.take() {
                None => set,
                Some(prev) => prev.intersection(&set).cloned().collect(),
            };
            if next.is_empty() {
                return Err(CONDITION_CAPABILITIES);
            }
            granted = Some(next);
        }
    }

    Ok(granted)
}

/// Tightest `max_requests` limit, if any caveat sets one.
pub fn request_quota(caveats: &[Caveat]) -> Option<u64> {
    caveats
        .iter()
        .filter_map(|c| match c {
            Caveat::MaxRequests(max) => Some(*max),
            _ => None,
        })
        .min()
}

/// Earliest `expires_at`, if any caveat sets one.
pub fn expiry(caveats: &[Caveat]) -> Option<u64> {
    caveats
        .iter()
        .filter_map(|c| match c {
            Caveat::ExpiresAt(at) => Some(*at),
            _ => None,
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(route: &str, now: u64, used: u64) -> RequestContext {
        RequestContext {
            route: route.to_string(),
            now,
            requests_used: used,
        }
    }

    #[test]
    fn test_text_form() {
        let cases = [
            Caveat::Routes(vec!["premium".into(), "basic".into()]),
            Caveat::Capabilities(vec!["read".into()]),
            Caveat::ExpiresAt(1_700_000_000),
            Caveat::MaxRequests(5),
        ];
        for caveat in cases {
            let parsed: Caveat = caveat.to_string().parse().unwrap();
            assert_eq!(parsed, caveat);
        }
        assert_eq!(
            Caveat::Routes(vec!["a".into(), "b".into()]).to_string(),
            "routes=a,b"
        );
    }

    #[test]
    fn test_unknown_condition_is_malformed() {
        assert!("colour=blue".parse::<Caveat>().is_err());
        assert!("no-equals".parse::<Caveat>().is_err());
        assert!("expires_at=soon".parse::<Caveat>().is_err());
    }

    #[test]
    fn test_route_scope() {
        let caveats = [Caveat::Routes(vec!["premium".into()])];
        assert!(evaluate(&caveats, &ctx("premium", 0, 0)).is_ok());
        assert_eq!(evaluate(&caveats, &ctx("basic", 0, 0)), Err("routes"));
    }

    #[test]
    fn test_expiry_is_exclusive() {
        let caveats = [Caveat::ExpiresAt(100)];
        assert!(evaluate(&caveats, &ctx("x", 99, 0)).is_ok());
        assert_eq!(evaluate(&caveats, &ctx("x", 100, 0)), Err("expires_at"));
    }

    #[test]
    fn test_quota() {
        let caveats = [Caveat::MaxRequests(2)];
        assert!(evaluate(&caveats, &ctx("x", 0, 1)).is_ok());
        assert_eq!(evaluate(&caveats, &ctx("x", 0, 2)), Err("max_requests"));
    }

    #[test]
    fn test_tightest_quota_and_expiry() {
        let caveats = [
            Caveat::MaxRequests(5),
            Caveat::ExpiresAt(300),
            Caveat::MaxRequests(2),
            Caveat::ExpiresAt(200),
        ];
        assert_eq!(request_quota(&caveats), Some(2));
        assert_eq!(expiry(&caveats), Some(200));
        assert_eq!(request_quota(&[]), None);
        assert_eq!(expiry(&[Caveat::Routes(vec!["x".into()])]), None);
    }

    #[test]
    fn test_capabilities_intersect() {
        let caveats = [
            Caveat::Capabilities(vec!["read".into(), "write".into()]),
            Caveat::Capabilities(vec!["read".into(), "admin".into()]),
        ];
        let caps = evaluate(&caveats, &ctx("x", 0, 0)).unwrap().unwrap();
        assert_eq!(caps.into_iter().collect::<Vec<_>>(), vec!["read"]);

        let disjoint = [
            Caveat::Capabilities(vec!["read".into()]),
            Caveat::Capabilities(vec!["write".into()]),
        ];
        assert_eq!(evaluate(&disjoint, &ctx("x", 0, 0)), Err("capabilities"));
    }

    #[test]
    fn test_no_capability_caveat_means_unrestricted() {
        assert_eq!(evaluate(&[], &ctx("x", 0, 0)), Ok(None));
    }

    #[test]
    fn test_single_failure_denies_regardless_of_others() {
        let caveats = [
            Caveat::Routes(vec!["premium".into()]),
            Caveat::Capabilities(vec!["read".into()]),
            Caveat::ExpiresAt(10),
            Caveat::MaxRequests(100),
        ];
        assert_eq!(evaluate(&caveats, &ctx("premium", 50, 0)), Err("expires_at"));
    }

    #[test]
    fn test_appending_never_widens() {
        let base = vec![Caveat::Routes(vec!["premium".into(), "basic".into()])];
        let request = ctx("basic", 0, 0);
        assert!(evaluate(&base, &request).is_ok());

        let mut narrowed = base.clone();
        narrowed.push(Caveat::Routes(vec!["premium".into()]));
        assert!(evaluate(&narrowed, &request).is_err());

        // A wider caveat appended later cannot undo the narrower one.
        narrowed.push(Caveat::Routes(vec!["premium".into(), "basic".into()]));
        assert!(evaluate(&narrowed, &request).is_err());
    }
}
