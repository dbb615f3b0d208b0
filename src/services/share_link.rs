use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareLinkError {
    Expired,
    InvalidSignature,
}

impl std::fmt::Display for ShareLinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareLinkError::Expired => write!(f, "Share link expired"),
            ShareLinkError::InvalidSignature => write!(f, "Share link not found"),
        }
    }
}

impl std::error::Error for ShareLinkError {}

/// Signs and verifies time-bounded guest links to a document.
///
/// A link is `sig = hex(HMAC-SHA256(secret, "{document_id}:{exp}"))` with
/// `exp` in unix seconds.
#[derive(Clone)]
pub struct ShareLinkSigner {
    secret: Vec<u8>,
}

impl ShareLinkSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, document_id: Uuid, exp: i64) -> HmacSha256 {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC key length is unrestricted"),
        };
        mac.update(format!("{}:{}", document_id, exp).as_bytes());
        mac
    }

    pub fn sign(&self, document_id: Uuid, exp: i64) -> String {
        hex::encode(self.mac(document_id, exp).finalize().into_bytes())
    }

    /// Check a presented link at time `now` (unix seconds). Expiry is checked
    /// before the signature.
    pub fn verify(&self, document_id: Uuid, sig: &str, exp: i64, now: i64) -> Result<(), ShareLinkError> {
        if exp <= now {
            return Err(ShareLinkError::Expired);
        }
        let presented = hex::decode(sig).map_err(|_| ShareLinkError::InvalidSignature)?;
        self.mac(document_id, exp)
            .verify_slice(&presented)
            .map_err(|_| ShareLinkError::InvalidSignature)
    }
}

impl std::fmt::Debug for ShareLinkSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareLinkSigner").finish_non_exhaustive()
    }
}
