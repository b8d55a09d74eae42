use crate::util::{decode_hex32, encode_hex};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    Malformed,
    BadSignature,
    Expired,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "token malformed"),
            Self::BadSignature => write!(f, "token signature mismatch"),
            Self::Expired => write!(f, "token expired"),
        }
    }
}

impl Error for AuthError {}

/// Identity carried by a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: i64,
    pub expires_at_ms: i64,
    pub session_epoch: i64,
}

/// Verifies bearer tokens presented at handshake. The gateway treats the
/// issuer as an external system; this seam is what tests substitute.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, now_ms: i64) -> Result<AuthClaims, AuthError>;
}

/// Token verifier over a shared keyed hash. Tokens have the shape
/// `user.expiry.epoch.signature` with a hex keyed digest over the first
/// three fields.
pub struct KeyedTokenVerifier {
    secret: [u8; 32],
}

impl KeyedTokenVerifier {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Mints a token for the given identity. Used by tooling and tests;
    /// production tokens come from the account service holding the same
    /// secret.
    pub fn issue(&self, user_id: i64, expires_at_ms: i64, session_epoch: i64) -> String {
        let payload = format!("{}.{}.{}", user_id, expires_at_ms, session_epoch);
        let signature = blake3::keyed_hash(&self.secret, payload.as_bytes());
        format!("{}.{}", payload, encode_hex(signature.as_bytes()))
    }
}

impl TokenVerifier for KeyedTokenVerifier {
    fn verify(&self, token: &str, now_ms: i64) -> Result<AuthClaims, AuthError> {
        let mut parts = token.split('.');
        let user_id = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or(AuthError::Malformed)?;
        let expires_at_ms = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or(AuthError::Malformed)?;
        let session_epoch = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or(AuthError::Malformed)?;
        let signature_hex = parts.next().ok_or(AuthError::Malformed)?;
        if parts.next().is_some() || user_id <= 0 {
            return Err(AuthError::Malformed);
        }
        let signature = decode_hex32(signature_hex).map_err(|_| AuthError::Malformed)?;
        let payload = format!("{}.{}.{}", user_id, expires_at_ms, session_epoch);
        let expected = blake3::keyed_hash(&self.secret, payload.as_bytes());
        // blake3::Hash comparison is constant time.
        if expected != blake3::Hash::from(signature) {
            return Err(AuthError::BadSignature);
        }
        if expires_at_ms <= now_ms {
            return Err(AuthError::Expired);
        }
        Ok(AuthClaims {
            user_id,
            expires_at_ms,
            session_epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [7u8; 32];

    #[test]
    fn issue_verify_roundtrip() {
        let verifier = KeyedTokenVerifier::new(SECRET);
        let token = verifier.issue(42, 10_000, 3);
        let claims = verifier.verify(&token, 9_999).expect("valid token");
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.session_epoch, 3);
    }

    #[test]
    fn rejects_tampered_signature() {
        let verifier = KeyedTokenVerifier::new(SECRET);
        let token = verifier.issue(42, 10_000, 0);
        let mut forged = token.clone();
        forged.pop();
        forged.push(if token.ends_with('0') { '1' } else { '0' });
        assert_eq!(
            verifier.verify(&forged, 1_000),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = KeyedTokenVerifier::new(SECRET);
        let token = verifier.issue(42, 10_000, 0);
        assert_eq!(verifier.verify(&token, 10_000), Err(AuthError::Expired));
    }

    #[test]
    fn rejects_garbage() {
        let verifier = KeyedTokenVerifier::new(SECRET);
        assert_eq!(verifier.verify("not-a-token", 0), Err(AuthError::Malformed));
        assert_eq!(verifier.verify("0.1.2.ff", 0), Err(AuthError::Malformed));
    }
}
