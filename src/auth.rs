//! Identity verification.
//!
//! A connection proves who it is once, with its `authenticate` event. Two
//! verifiers are provided:
//!
//! - [`TrustedClaimVerifier`] accepts the claimed user id as-is. Only suitable
//!   behind a gateway that already authenticated the client.
//! - [`SignedTokenVerifier`] accepts tokens minted by the login service:
//!   `<userId>.<expiresAtUnix>.<base64url(ed25519 signature)>`, where the
//!   signature covers `<userId>.<expiresAtUnix>`.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::{Error, Result};
use crate::protocol::{Credential, UserId};

/// Turns a presented credential into a user identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &Credential) -> Result<UserId>;
}

/// Accepts any positive claimed user id.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedClaimVerifier;

#[async_trait]
impl IdentityVerifier for TrustedClaimVerifier {
    async fn verify(&self, credential: &Credential) -> Result<UserId> {
        match credential {
            Credential::Claim(id) if id.0 > 0 => Ok(*id),
            Credential::Claim(id) => Err(Error::Authentication(format!(
                "invalid user id {}",
                id
            ))),
            Credential::Token(_) => Err(Error::Authentication(
                "token credentials are not enabled".to_string(),
            )),
        }
    }
}

/// Verifies Ed25519-signed session tokens against the issuer's public key.
#[derive(Debug, Clone)]
pub struct SignedTokenVerifier {
    key: VerifyingKey,
}

impl SignedTokenVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Build a verifier from a hex-encoded 32-byte public key.
    pub fn from_hex(public_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(public_key_hex.trim())
            .map_err(|e| Error::Config(format!("auth public key is not hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("auth public key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Error::Config(format!("auth public key is invalid: {}", e)))?;
        Ok(Self::new(key))
    }

    /// Check a token's signature and expiry against `now` (unix seconds).
    pub fn verify_token(&self, token: &str, now: i64) -> Result<UserId> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| Error::Authentication("malformed token".to_string()))?;
        let (user_part, expiry_part) = payload
            .split_once('.')
            .ok_or_else(|| Error::Authentication("malformed token".to_string()))?;

        let user: i64 = user_part
            .parse()
            .map_err(|_| Error::Authentication("malformed token subject".to_string()))?;
        let expires_at: i64 = expiry_part
            .parse()
            .map_err(|_| Error::Authentication("malformed token expiry".to_string()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::Authentication("malformed token signature".to_string()))?;
        let signature = Signature::from_slice(&signature)
            .map_err(|_| Error::Authentication("malformed token signature".to_string()))?;

        self.key
            .verify_strict(payload.as_bytes(), &signature)
            .map_err(|_| Error::Authentication("bad token signature".to_string()))?;

        if expires_at <= now {
            return Err(Error::Authentication("token expired".to_string()));
        }
        if user <= 0 {
            return Err(Error::Authentication(format!("invalid user id {}", user)));
        }

        Ok(UserId(user))
    }
}

#[async_trait]
impl IdentityVerifier for SignedTokenVerifier {
    async fn verify(&self, credential: &Credential) -> Result<UserId> {
        match credential {
            Credential::Token(token) => self.verify_token(token, Utc::now().timestamp()),
            Credential::Claim(_) => Err(Error::Authentication(
                "a signed token is required".to_string(),
            )),
        }
    }
}

/// Mint a token the way the login service does. Test-only helper.
#[cfg(test)]
pub(crate) fn sign_token(key: &ed25519_dalek::SigningKey, user: UserId, expires_at: i64) -> String {
    use ed25519_dalek::Signer;

    let payload = format!("{}.{}", user, expires_at);
    let signature = key.sign(payload.as_bytes());
    format!("{}.{}", payload, URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}
