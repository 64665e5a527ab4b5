//! Bypass token encoding and HMAC-SHA256 signing

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use super::SessionError;

type HmacSha256 = Hmac<Sha256>;

/// Field separator inside the decoded token
const SEPARATOR: char = '|';

/// Random bytes per token
pub const NONCE_LEN: usize = 16;

/// Length of a hex-encoded SHA-256 MAC
const SIGNATURE_HEX_LEN: usize = 64;

/// Fields carried by a token whose signature checked out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub client_ip: String,
    pub domain: String,
    pub issued_at: i64,
    pub nonce: String,
}

/// Signs and verifies bypass tokens with a server-wide secret
#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self, SessionError> {
        if secret.is_empty() {
            return Err(SessionError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| SessionError::EmptySecret)?;
        Ok(Self { mac })
    }

    /// Lowercase hex HMAC of `payload`
    pub fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex signature
    pub fn verify(&self, payload: &str, signature: &str) -> bool {
        if signature.len() != SIGNATURE_HEX_LEN
            || !signature
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return false;
        }

        let Ok(bytes) = hex::decode(signature) else {
            return false;
        };

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&bytes).is_ok()
    }

    /// Build a signed token for already-normalized inputs
    pub fn issue(&self, client_ip: &str, domain: &str, issued_at: i64) -> Result<String, SessionError> {
        if client_ip.is_empty() || client_ip.contains(SEPARATOR) {
            return Err(SessionError::InvalidInput("client IP"));
        }
        if domain.is_empty() || domain.contains(SEPARATOR) {
            return Err(SessionError::InvalidInput("domain"));
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| SessionError::Entropy(e.to_string()))?;

        let payload = format!(
            "{}{sep}{}{sep}{}{sep}{}",
            client_ip,
            domain,
            issued_at,
            hex::encode(nonce),
            sep = SEPARATOR
        );
        let signature = self.sign(&payload);

        Ok(URL_SAFE.encode(format!("{}{}{}", payload, SEPARATOR, signature)))
    }

    /// Decode a token and check its signature
    ///
    /// Every failure here is [`SessionError::InvalidToken`].
    pub fn open(&self, token: &str) -> Result<TokenClaims, SessionError> {
        let decoded = URL_SAFE
            .decode(token.trim())
            .map_err(|_| SessionError::InvalidToken)?;
        let decoded = String::from_utf8(decoded).map_err(|_| SessionError::InvalidToken)?;

        let fields: Vec<&str> = decoded.split(SEPARATOR).collect();
        let [ip, domain, issued_at, nonce, signature] = fields.as_slice() else {
            return Err(SessionError::InvalidToken);
        };

        let payload = fields[..4].join("|");
        if !self.verify(&payload, signature) {
            return Err(SessionError::InvalidToken);
        }

        let issued_at = issued_at
            .parse::<i64>()
            .map_err(|_| SessionError::InvalidToken)?;

        Ok(TokenClaims {
            client_ip: ip.to_string(),
            domain: domain.to_string(),
            issued_at,
            nonce: nonce.to_string(),
        })
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}
