//! Credential identifiers and the 32-byte values they embed.
//!
//! The identifier is the immutable payload a credential is signed over. It
//! binds the credential to exactly one payment obligation through the payment
//! hash, and carries a random token id that distinguishes credentials minted
//! for the same route.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LsatError;

/// Identifier layout version understood by this crate.
pub const IDENTIFIER_VERSION: u16 = 0;

/// Encoded identifier length: version (2) + payment hash (32) + token id (32).
pub const IDENTIFIER_LEN: usize = 2 + 32 + 32;

macro_rules! hex_bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, LsatError> {
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    LsatError::Malformed(format!(
                        "{} must be 32 bytes, got {}",
                        stringify!($name),
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }
        }

        impl FromStr for $name {
            type Err = LsatError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| {
                    LsatError::Malformed(format!("invalid {} hex: {e}", stringify!($name)))
                })?;
                Self::from_slice(&bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes32!(
    /// SHA-256 hash of a payment preimage; identifies one payment obligation.
    PaymentHash
);

hex_bytes32!(
    /// Random per-credential id, used to meter usage of a single token.
    TokenId
);

hex_bytes32!(
    /// Selects the signing key a credential was minted under.
    RootKeyId
);

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", self.to_hex())
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.to_hex())
    }
}

impl fmt::Debug for RootKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootKeyId({})", self.to_hex())
    }
}

impl TokenId {
    /// Fresh random token id from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::fill(&mut bytes);
        Self(bytes)
    }
}

impl RootKeyId {
    /// Root key id derived by hashing arbitrary bytes.
    pub fn derive(material: &[u8]) -> Self {
        Self(Sha256::digest(material).into())
    }
}

/// Payment preimage: the settlement proof for a [`PaymentHash`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::fill(&mut bytes);
        Self(bytes)
    }

    /// The payment hash this preimage settles.
    pub fn hash(&self) -> PaymentHash {
        PaymentHash(Sha256::digest(self.0).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Preimage {
    type Err = LsatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s).map_err(|e| LsatError::Malformed(format!("invalid preimage hex: {e}")))?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            LsatError::Malformed(format!("preimage must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage([REDACTED])")
    }
}

/// The immutable payload a credential is signed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier {
    pub version: u16,
    pub payment_hash: PaymentHash,
    pub token_id: TokenId,
}

impl Identifier {
    /// New identifier for the given payment hash with a random token id.
    pub fn new(payment_hash: PaymentHash) -> Self {
        Self {
            version: IDENTIFIER_VERSION,
            payment_hash,
            token_id: TokenId::random(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDENTIFIER_LEN);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(self.payment_hash.as_bytes());
        out.extend_from_slice(self.token_id.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LsatError> {
        if bytes.len() != IDENTIFIER_LEN {
            return Err(LsatError::Malformed(format!(
                "identifier must be {IDENTIFIER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version != IDENTIFIER_VERSION {
            return Err(LsatError::Malformed(format!(
                "unknown identifier version {version}"
            )));
        }
        Ok(Self {
            version,
            payment_hash: PaymentHash::from_slice(&bytes[2..34])?,
            token_id: TokenId::from_slice(&bytes[34..66])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_layout() {
        let id = Identifier {
            version: IDENTIFIER_VERSION,
            payment_hash: PaymentHash([0x11; 32]),
            token_id: TokenId([0x22; 32]),
        };
        let bytes = id.encode();
        assert_eq!(bytes.len(), IDENTIFIER_LEN);
        assert_eq!(&bytes[..2], &[0, 0]);
        assert_eq!(&bytes[2..34], &[0x11; 32]);
        assert_eq!(Identifier::decode(&bytes).unwrap(), id);
    }

    #[test]
    fn test_identifier_rejects_bad_length_and_version() {
        assert!(Identifier::decode(&[0u8; 10]).is_err());

        let mut bytes = Identifier::new(PaymentHash([1; 32])).encode();
        bytes[1] = 7;
        let err = Identifier::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown identifier version"));
    }

    #[test]
    fn test_random_token_ids_differ() {
        assert_ne!(TokenId::random(), TokenId::random());
    }

    #[test]
    fn test_preimage_hash_matches_sha256() {
        let preimage = Preimage([0u8; 32]);
        // sha256 of 32 zero bytes
        assert_eq!(
            preimage.hash().to_hex(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn test_preimage_debug_is_redacted() {
        let p = Preimage([0xab; 32]);
        assert!(!format!("{p:?}").contains("ab"));
    }

    #[test]
    fn test_payment_hash_hex_parse() {
        let h: PaymentHash = "aa".repeat(32).parse().unwrap();
        assert_eq!(h, PaymentHash([0xaa; 32]));
        assert!("zz".parse::<PaymentHash>().is_err());
        assert!("aabb".parse::<PaymentHash>().is_err());
    }
}
