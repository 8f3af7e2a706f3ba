//! HTTP header encodings.
//!
//! - Request: `Authorization: LSAT <base64 credential>:<hex preimage>`
//!   (`L402` is accepted as an alias scheme).
//! - Challenge: `WWW-Authenticate: LSAT macaroon="..", invoice="..",
//!   payment_hash="..", amount_msat=".."`.

use std::collections::HashMap;

use crate::challenger::Obligation;
use crate::credential::Credential;
use crate::error::LsatError;
use crate::identifier::{PaymentHash, Preimage};

pub const AUTH_SCHEME: &str = "LSAT";
pub const AUTH_SCHEME_ALIAS: &str = "L402";

/// Credential plus settlement proof as sent by a client.
#[derive(Debug, Clone)]
pub struct PresentedToken {
    pub credential: Credential,
    pub preimage: Preimage,
}

fn strip_scheme(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(char::is_whitespace)?;
    if scheme.eq_ignore_ascii_case(AUTH_SCHEME) || scheme.eq_ignore_ascii_case(AUTH_SCHEME_ALIAS)
    {
        Some(rest.trim())
    } else {
        None
    }
}

/// Parse an `Authorization` header value.
pub fn parse_authorization(value: &str) -> Result<PresentedToken, LsatError> {
    let token = strip_scheme(value)
        .ok_or_else(|| LsatError::Malformed("missing LSAT authorization scheme".to_string()))?;
    let (credential, preimage) = token
        .rsplit_once(':')
        .ok_or_else(|| LsatError::Malformed("expected <credential>:<preimage>".to_string()))?;

    Ok(PresentedToken {
        credential: Credential::from_base64(credential)?,
        preimage: preimage.trim().parse()?,
    })
}

/// Build an `Authorization` header value.
pub fn authorization_value(credential: &Credential, preimage: &Preimage) -> String {
    format!(
        "{AUTH_SCHEME} {}:{}",
        credential.to_base64(),
        preimage.to_hex()
    )
}

/// Payment challenge returned with a 402 response.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub credential: Credential,
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    pub invoice: String,
}

impl Challenge {
    pub fn new(credential: Credential, obligation: &Obligation) -> Self {
        Self {
            credential,
            payment_hash: obligation.payment_hash,
            amount_msat: obligation.amount_msat,
            invoice: obligation.invoice.clone(),
        }
    }

    /// `WWW-Authenticate` header value.
    pub fn header_value(&self) -> String {
        format!(
            "{AUTH_SCHEME} macaroon=\"{}\", invoice=\"{}\", payment_hash=\"{}\", amount_msat=\"{}\"",
            self.credential.to_base64(),
            self.invoice,
            self.payment_hash.to_hex(),
            self.amount_msat
        )
    }

    /// Parse a `WWW-Authenticate` header value produced by [`Self::header_value`].
    pub fn from_header_value(value: &str) -> Result<Self, LsatError> {
        let params = strip_scheme(value)
            .ok_or_else(|| LsatError::Malformed("missing LSAT challenge scheme".to_string()))?;

        let mut fields = HashMap::new();
        for part in params.split(',') {
            let (key, raw) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| LsatError::Malformed(format!("bad challenge parameter: {part}")))?;
            fields.insert(key.trim(), raw.trim().trim_matches('"'));
        }
        let field = |name: &str| {
            fields
                .get(name)
                .copied()
                .ok_or_else(|| LsatError::Malformed(format!("challenge missing {name}")))
        };

        Ok(Self {
            credential: Credential::from_base64(field("macaroon")?)?,
            invoice: field("invoice")?.to_string(),
            payment_hash: field("payment_hash")?.parse()?,
            amount_msat: field("amount_msat")?
                .parse()
                .map_err(|e| LsatError::Malformed(format!("amount_msat: {e}")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{Identifier, RootKeyId};
    use crate::secrets::RootKey;

    fn credential(hash: PaymentHash) -> Credential {
        Credential::mint(
            &RootKey::from_bytes([3; 32]),
            RootKeyId([4; 32]),
            Identifier::new(hash).encode(),
        )
    }

    #[test]
    fn test_authorization_reconstructs_binary_form() {
        let preimage = Preimage([7; 32]);
        let cred = credential(preimage.hash());
        let header = authorization_value(&cred, &preimage);
        assert!(header.starts_with("LSAT "));

        let parsed = parse_authorization(&header).unwrap();
        assert_eq!(parsed.credential.to_bytes(), cred.to_bytes());
        assert_eq!(parsed.preimage, preimage);
    }

    #[test]
    fn test_l402_alias_and_case() {
        let preimage = Preimage([7; 32]);
        let cred = credential(preimage.hash());
        let value = format!("l402 {}:{}", cred.to_base64(), preimage.to_hex());
        assert!(parse_authorization(&value).is_ok());
    }

    #[test]
    fn test_malformed_authorization() {
        assert!(parse_authorization("").is_err());
        assert!(parse_authorization("Bearer abc").is_err());
        assert!(parse_authorization("LSAT no-colon").is_err());
        assert!(parse_authorization("LSAT AAAA:zz").is_err());
    }

    #[test]
    fn test_challenge_header_round_trip() {
        let hash = PaymentHash([9; 32]);
        let obligation = Obligation {
            payment_hash: hash,
            amount_msat: 2500,
            invoice: "lnbc25n1pexample".to_string(),
            expires_at: 0,
        };
        let challenge = Challenge::new(credential(hash), &obligation);
        let value = challenge.header_value();
        assert!(value.starts_with("LSAT macaroon=\""));

        let parsed = Challenge::from_header_value(&value).unwrap();
        assert_eq!(parsed.payment_hash, hash);
        assert_eq!(parsed.amount_msat, 2500);
        assert_eq!(parsed.invoice, "lnbc25n1pexample");
        assert_eq!(parsed.credential, challenge.credential);
    }

    #[test]
    fn test_challenge_missing_field() {
        assert!(Challenge::from_header_value("LSAT invoice=\"x\"").is_err());
    }
}
