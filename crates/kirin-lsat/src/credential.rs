//! Macaroon-style credentials with a chained HMAC-SHA256 signature.
//!
//! `sig0 = HMAC(root_key, identifier)` and `sig_i = HMAC(sig_{i-1}, caveat_i)`.
//! Appending a caveat only needs the current signature, so any holder can
//! attenuate a credential. Removing or editing a caveat requires the root key.
//!
//! The chain is computed over caveat bytes exactly as they were received, so
//! decoding and re-encoding never changes what the signature covers.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::caveat::Caveat;
use crate::error::LsatError;
use crate::identifier::{Identifier, RootKeyId};
use crate::secrets::RootKey;

type HmacSha256 = Hmac<Sha256>;

/// Binary format version.
pub const CREDENTIAL_VERSION: u8 = 1;

const SIGNATURE_LEN: usize = 32;

/// Upper bound on caveats accepted when decoding.
const MAX_CAVEATS: usize = 64;

/// A signed, attenuable access credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    root_key_id: RootKeyId,
    identifier: Vec<u8>,
    caveats: Vec<Caveat>,
    /// Wire text of each caveat, parallel to `caveats`.
    caveat_text: Vec<String>,
    signature: [u8; SIGNATURE_LEN],
}

fn keyed_digest(key: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

impl Credential {
    /// Sign a new credential with no caveats.
    pub fn mint(root_key: &RootKey, root_key_id: RootKeyId, identifier: Vec<u8>) -> Self {
        let signature = keyed_digest(root_key.as_bytes(), &identifier);
        Self {
            root_key_id,
            identifier,
            caveats: Vec::new(),
            caveat_text: Vec::new(),
            signature,
        }
    }

    /// Append a caveat, chaining the signature forward.
    pub fn add_caveat(&mut self, caveat: Caveat) {
        let text = caveat.to_string();
        self.signature = keyed_digest(&self.signature, text.as_bytes());
        self.caveats.push(caveat);
        self.caveat_text.push(text);
    }

    /// Builder-style [`Self::add_caveat`].
    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.add_caveat(caveat);
        self
    }

    pub fn root_key_id(&self) -> &RootKeyId {
        &self.root_key_id
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    /// Decode the identifier bytes into their structured form.
    pub fn decoded_identifier(&self) -> Result<Identifier, LsatError> {
        Identifier::decode(&self.identifier)
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    /// Recompute the signature chain under `root_key` and compare in constant time.
    pub fn verify_signature(&self, root_key: &RootKey) -> bool {
        let mut sig = keyed_digest(root_key.as_bytes(), &self.identifier);
        for text in &self.caveat_text {
            sig = keyed_digest(&sig, text.as_bytes());
        }
        sig.ct_eq(&self.signature).into()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + 2 + self.identifier.len() + 2 + 32);
        out.push(CREDENTIAL_VERSION);
        out.extend_from_slice(self.root_key_id.as_bytes());
        out.extend_from_slice(&(self.identifier.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.identifier);
        out.extend_from_slice(&(self.caveat_text.len() as u16).to_be_bytes());
        for text in &self.caveat_text {
            out.extend_from_slice(&(text.len() as u16).to_be_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LsatError> {
        let mut reader = Reader { bytes, pos: 0 };

        let version = reader.take(1)?[0];
        if version != CREDENTIAL_VERSION {
            return Err(LsatError::Malformed(format!(
                "unknown credential version {version}"
            )));
        }
        let root_key_id = RootKeyId::from_slice(reader.take(32)?)?;

        let id_len = reader.u16()? as usize;
        let identifier = reader.take(id_len)?.to_vec();

        let count = reader.u16()? as usize;
        if count > MAX_CAVEATS {
            return Err(LsatError::Malformed(format!(
                "too many caveats: {count} (max {MAX_CAVEATS})"
            )));
        }
        let mut caveats = Vec::with_capacity(count);
        let mut caveat_text = Vec::with_capacity(count);
        for _ in 0..count {
            let len = reader.u16()? as usize;
            let text = std::str::from_utf8(reader.take(len)?)
                .map_err(|_| LsatError::Malformed("caveat is not UTF-8".to_string()))?;
            caveats.push(text.parse()?);
            caveat_text.push(text.to_string());
        }

        let signature: [u8; SIGNATURE_LEN] = reader
            .take(SIGNATURE_LEN)?
            .try_into()
            .map_err(|_| LsatError::Malformed("truncated signature".to_string()))?;

        if reader.pos != bytes.len() {
            return Err(LsatError::Malformed(format!(
                "{} trailing bytes after signature",
                bytes.len() - reader.pos
            )));
        }

        Ok(Self {
            root_key_id,
            identifier,
            caveats,
            caveat_text,
            signature,
        })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, LsatError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| LsatError::Malformed(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("root_key_id", &self.root_key_id)
            .field("identifier", &hex::encode(&self.identifier))
            .field("caveats", &self.caveats)
            .finish_non_exhaustive()
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LsatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| LsatError::Malformed("truncated credential".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, LsatError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}
