//! Connection authentication
//!
//! Turns the token presented in a connection handshake into [`Claims`].
//!
//! # Token format
//!
//! Tokens are signed with a shared secret:
//! 1. Encode claims: Base64(JSON(claims))
//! 2. Calculate HMAC-SHA256 digest of the encoded part
//! 3. Format: `${encoded}--${digest_hex}`

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// What an authenticated connection is allowed to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Topics the connection may subscribe to. `None` means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permitted_topics: Option<BTreeSet<String>>,
    /// Expiry, unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl Claims {
    /// Claims restricted to `topics`
    pub fn permitting<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permitted_topics: Some(topics.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.exp.is_some_and(|exp| exp <= now)
    }
}

/// Yields claims for a handshake token, or `None` to reject the connection
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> Option<Claims>;
}

/// Accepts every connection with unrestricted claims (auth disabled)
#[derive(Debug, Default)]
pub struct OpenAuthenticator;

impl Authenticator for OpenAuthenticator {
    fn authenticate(&self, _token: Option<&str>) -> Option<Claims> {
        Some(Claims::default())
    }
}

/// Verifies tokens signed with a shared secret
pub struct TokenAuthenticator {
    verifier: MessageVerifier,
}

impl TokenAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            verifier: MessageVerifier::new(secret),
        }
    }

    /// Issue a token for `claims`
    pub fn issue(&self, claims: &Claims) -> Result<String, VerifyError> {
        self.verifier.sign(claims)
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Option<Claims> {
        let Some(token) = token else {
            debug!("no token presented");
            return None;
        };

        let claims: Claims = match self.verifier.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "token rejected");
                return None;
            }
        };

        if claims.is_expired(unix_now()) {
            debug!(sub = ?claims.sub, "token expired");
            return None;
        }

        Some(claims)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// HMAC-SHA256 message verifier
pub struct MessageVerifier {
    key: Vec<u8>,
}

impl MessageVerifier {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    /// Verify a signed message and decode its JSON payload
    ///
    /// Expected format: `base64(json(payload))--hex(hmac_sha256(base64_part))`
    pub fn verify<T: DeserializeOwned>(&self, signed: &str) -> Result<T, VerifyError> {
        let (encoded, signature) = match signed.split("--").collect::<Vec<_>>()[..] {
            [encoded, signature] => (encoded, signature),
            _ => return Err(VerifyError::InvalidFormat),
        };

        if !self.verify_signature(encoded.as_bytes(), signature)? {
            return Err(VerifyError::InvalidSignature);
        }

        let json = STANDARD.decode(encoded)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Sign a JSON payload
    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<String, VerifyError> {
        let json = serde_json::to_vec(payload)?;
        let encoded = STANDARD.encode(json);
        let signature = hex::encode(self.digest(encoded.as_bytes())?);

        Ok(format!("{}--{}", encoded, signature))
    }

    fn verify_signature(&self, data: &[u8], signature: &str) -> Result<bool, VerifyError> {
        let expected_hex = hex::encode(self.digest(data)?);

        // Constant-time comparison
        Ok(expected_hex.as_bytes().ct_eq(signature.as_bytes()).into())
    }

    fn digest(&self, data: &[u8]) -> Result<Vec<u8>, VerifyError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Errors during token verification
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
