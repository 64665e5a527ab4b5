//! Bypass Session Module
//!
//! Issues and checks time-limited bypass authorizations, one per
//! (client IP, domain) pair.
//!
//! ## Token format
//!
//! ```text
//! base64url( ip | domain | unix_ts | hex(nonce) | hex(hmac_sha256(first four fields)) )
//! ```
//!
//! Validation checks the signature first, so a forged token always fails
//! with [`SessionError::InvalidToken`] regardless of what else is wrong.

pub mod store;
pub mod token;

pub use store::{run_periodic_cleanup, BypassSession, SessionStore};
pub use token::{TokenClaims, TokenSigner};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("domain mismatch")]
    DomainMismatch,

    #[error("bypass secret must not be empty")]
    EmptySecret,

    #[error("token TTL must be positive and representable")]
    InvalidTtl,

    #[error("failed to gather token randomness: {0}")]
    Entropy(String),

    #[error("invalid {0} for bypass token")]
    InvalidInput(&'static str),
}
