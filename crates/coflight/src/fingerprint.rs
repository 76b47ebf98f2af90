use crate::{Error, Result};
use core::fmt;
use sha2::{Digest, Sha256};

/// Length of a [`Fingerprint`] in bytes (SHA-256 output).
pub const FINGERPRINT_LEN: usize = 32;

/// Dedup identity of a request: a SHA-256 digest over the case-normalized
/// method, the exact path-and-query, and the canonical form of the body.
///
/// Equal fingerprints mean "same request" for coalescing purposes. Each
/// segment is length-prefixed before hashing so no concatenation of one
/// request's fields can collide with a different split of another's.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Derives the fingerprint for a request snapshot.
    ///
    /// The method is ASCII-uppercased; the path is hashed exactly as given,
    /// query string included. A non-empty body must be valid JSON: it is
    /// parsed and re-serialized so that semantically equal payloads hash
    /// identically regardless of object key order or whitespace. An empty
    /// body hashes as the empty byte string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canonicalize`] if the body is non-empty and not
    /// valid JSON. Callers are expected to fail open and skip coalescing
    /// for that request.
    pub fn derive(method: &str, path: &str, body: &[u8]) -> Result<Self> {
        let canonical = canonicalize_body(body)?;
        let method = method.to_ascii_uppercase();

        let mut hasher = Sha256::new();
        for segment in [method.as_bytes(), path.as_bytes(), canonical.as_slice()] {
            hasher.update((segment.len() as u64).to_le_bytes());
            hasher.update(segment);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Fingerprint {
    /// Shortened hex form for log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Reduces a body to canonical bytes.
///
/// serde_json's object map is BTreeMap-backed, so parse-then-reserialize
/// yields a total order over keys at every nesting level. The
/// `preserve_order` feature must stay off for this to hold.
fn canonicalize_body(body: &[u8]) -> Result<Vec<u8>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| Error::Canonicalize {
        reason: e.to_string(),
    })?;
    serde_json::to_vec(&value).map_err(|e| Error::Canonicalize {
        reason: e.to_string(),
    })
}
