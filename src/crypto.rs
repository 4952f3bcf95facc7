//! Token hashing, opaque token encoding and constant-time comparison.
//!
//! Opaque tokens have the shape `<base64url(lookup id)>.<secret>`. Only the
//! SHA-256 digest of the secret is persisted; the lookup id selects the row
//! and the digest is then compared in constant time.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{TokenHash, TokenLookupId};

/// Constant-time byte slice comparison.
///
/// Runtime depends only on the slice length, never on where the first
/// differing byte is. Length itself is not secret (hashes are fixed size).
#[inline]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let diff = a
        .iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));

    diff == 0
}

/// Constant-time comparison of two token hashes.
#[inline]
pub fn hashes_match(stored: &TokenHash, supplied: &TokenHash) -> bool {
    constant_time_eq(stored.as_str().as_bytes(), supplied.as_str().as_bytes())
}

/// Hash a token secret for storage and lookup (never store raw secrets).
pub fn hash_token(secret: &str) -> TokenHash {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    TokenHash::new(format!("{:x}", hasher.finalize()))
}

/// A freshly generated opaque token, before it is persisted.
#[derive(Debug, Clone)]
pub struct OpaqueToken {
    pub lookup_id: TokenLookupId,
    pub secret: String,
    pub hash: TokenHash,
}

impl OpaqueToken {
    /// Generate a new lookup id and secret pair.
    pub fn generate() -> Self {
        let lookup_id = TokenLookupId::new(Uuid::new_v4().simple().to_string());
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let hash = hash_token(&secret);

        Self {
            lookup_id,
            secret,
            hash,
        }
    }

    /// The value handed to the client. Shown once, never persisted.
    pub fn plaintext(&self) -> String {
        format!("{}.{}", URL_SAFE_NO_PAD.encode(self.lookup_id.as_str()), self.secret)
    }
}

/// Split a client-supplied opaque token into its lookup id and secret hash.
///
/// Returns `None` for anything that does not have the expected shape.
pub fn parse_opaque_token(token: &str) -> Option<(TokenLookupId, TokenHash)> {
    let (encoded_id, secret) = token.split_once('.')?;
    if encoded_id.is_empty() || secret.is_empty() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(encoded_id).ok()?;
    let lookup_id = String::from_utf8(decoded).ok()?;
    if lookup_id.is_empty() {
        return None;
    }

    Some((TokenLookupId::new(lookup_id), hash_token(secret)))
}
