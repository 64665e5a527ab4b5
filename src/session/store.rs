//! In-memory bypass session table
//!
//! Keyed by `ip:domain`. Sessions are volatile: nothing survives a restart.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use super::token::TokenSigner;
use super::SessionError;
use crate::types::{canonical_ip, normalize_domain, normalize_ip};

/// One client's authorization to reach one blocked domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassSession {
    pub client_ip: String,
    pub domain: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BypassSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Signed, expiring bypass sessions
pub struct SessionStore {
    signer: TokenSigner,
    ttl: chrono::Duration,
    sessions: RwLock<HashMap<String, BypassSession>>,
}

impl SessionStore {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, SessionError> {
        if ttl.is_zero() {
            return Err(SessionError::InvalidTtl);
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| SessionError::InvalidTtl)?;

        Ok(Self {
            signer: TokenSigner::new(secret)?,
            ttl,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Issue a token and store its session, replacing any prior one for the pair
    pub async fn create_token(&self, client_ip: &str, domain: &str) -> Result<String, SessionError> {
        let client_ip = normalize_ip(client_ip);
        let domain = normalize_domain(domain);

        let now = Utc::now();
        let token = self.signer.issue(&client_ip, &domain, now.timestamp())?;

        let session = BypassSession {
            client_ip: client_ip.clone(),
            domain: domain.clone(),
            token: token.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.sessions
            .write()
            .await
            .insert(session_key(&client_ip, &domain), session);

        debug!("Bypass issued for {} -> {}", client_ip, domain);
        Ok(token)
    }

    /// Check a presented token against the caller and the live session table
    ///
    /// Order: signature, domain, stored session (missing or expired), IP.
    pub async fn validate_token(
        &self,
        token: &str,
        client_ip: &str,
        domain: &str,
    ) -> Result<BypassSession, SessionError> {
        let client_ip = normalize_ip(client_ip);
        let domain = normalize_domain(domain);

        let claims = self.signer.open(token)?;

        let token_domain = normalize_domain(&claims.domain);
        if token_domain != domain {
            return Err(SessionError::DomainMismatch);
        }

        let key = session_key(&claims.client_ip, &token_domain);
        let session = self
            .sessions
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(SessionError::InvalidToken)?;

        if session.is_expired(Utc::now()) {
            self.evict_if_expired(&key).await;
            return Err(SessionError::ExpiredToken);
        }

        // A newer token for the same pair supersedes this one
        if session.token != token.trim() {
            return Err(SessionError::InvalidToken);
        }

        if !ip_matches(&claims.client_ip, &client_ip) {
            return Err(SessionError::InvalidToken);
        }

        Ok(session)
    }

    /// True iff a live session exists for the pair
    pub async fn has_bypass(&self, client_ip: &str, domain: &str) -> bool {
        let key = session_key(&normalize_ip(client_ip), &normalize_domain(domain));
        self.sessions
            .read()
            .await
            .get(&key)
            .is_some_and(|session| !session.is_expired(Utc::now()))
    }

    pub async fn revoke(&self, client_ip: &str, domain: &str) {
        let key = session_key(&normalize_ip(client_ip), &normalize_domain(domain));
        self.sessions.write().await.remove(&key);
    }

    /// Remove every expired session, returning how many went
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        before - sessions.len()
    }

    /// Size of the table, including expired sessions not yet swept
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl.to_std().unwrap_or_default()
    }

    async fn evict_if_expired(&self, key: &str) {
        let mut sessions = self.sessions.write().await;
        // Another task may have replaced it since the read
        if sessions.get(key).is_some_and(|s| s.is_expired(Utc::now())) {
            sessions.remove(key);
        }
    }
}

fn session_key(client_ip: &str, domain: &str) -> String {
    format!("{}:{}", client_ip, domain)
}

/// Exact match, or the same address once parsed (IPv4-mapped IPv6 included)
pub fn ip_matches(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }

    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => canonical_ip(a) == canonical_ip(b),
        _ => false,
    }
}

/// Sweep expired sessions every `interval` until shutdown
pub async fn run_periodic_cleanup(
    store: Arc<SessionStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = store.cleanup_expired().await;
                if removed > 0 {
                    info!("🧹 Removed {} expired bypass sessions", removed);
                }
            }
            _ = shutdown.changed() => {
                debug!("Session cleanup stopped");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn store(ttl: Duration) -> SessionStore {
        SessionStore::new(b"test-secret", ttl).unwrap()
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(
            SessionStore::new(b"", DAY),
            Err(SessionError::EmptySecret)
        ));
        assert!(matches!(
            SessionStore::new(b"secret", Duration::ZERO),
            Err(SessionError::InvalidTtl)
        ));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = store(DAY);
        let token = store.create_token("192.168.1.1", "example.com").await.unwrap();

        let session = store
            .validate_token(&token, "192.168.1.1", "example.com")
            .await
            .unwrap();
        assert_eq!(session.client_ip, "192.168.1.1");
        assert_eq!(session.domain, "example.com");
        assert_eq!(session.token, token);
        assert!(session.expires_at > session.created_at);
    }

    #[tokio::test]
    async fn test_inputs_are_normalized() {
        let store = store(DAY);
        let token = store.create_token("192.168.1.1:54321", "Example.COM.").await.unwrap();

        assert!(store.has_bypass("192.168.1.1", "example.com").await);
        assert!(store.validate_token(&token, "192.168.1.1:999", "EXAMPLE.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_token() {
        let store = store(DAY);
        let result = store.validate_token("invalid-token", "192.168.1.1", "example.com").await;
        assert_eq!(result, Err(SessionError::InvalidToken));
    }

    #[tokio::test]
    async fn test_domain_mismatch() {
        let store = store(DAY);
        let token = store.create_token("192.168.1.1", "example.com").await.unwrap();
        let result = store.validate_token(&token, "192.168.1.1", "other.com").await;
        assert_eq!(result, Err(SessionError::DomainMismatch));
    }

    #[tokio::test]
    async fn test_ip_mismatch() {
        let store = store(DAY);
        let token = store.create_token("192.168.1.1", "example.com").await.unwrap();
        let result = store.validate_token(&token, "192.168.1.2", "example.com").await;
        assert_eq!(result, Err(SessionError::InvalidToken));
    }

    #[tokio::test]
    async fn test_revoked_token_invalid() {
        let store = store(DAY);
        let token = store.create_token("192.168.1.1", "example.com").await.unwrap();
        store.revoke("192.168.1.1", "example.com").await;

        assert!(!store.has_bypass("192.168.1.1", "example.com").await);
        assert_eq!(
            store.validate_token(&token, "192.168.1.1", "example.com").await,
            Err(SessionError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_expiry_and_cleanup() {
        let store = store(Duration::from_millis(1));
        let token = store.create_token("192.168.1.1", "example.com").await.unwrap();
        store.create_token("192.168.1.1", "other.com").await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!store.has_bypass("192.168.1.1", "example.com").await);
        assert_eq!(
            store.validate_token(&token, "192.168.1.1", "example.com").await,
            Err(SessionError::ExpiredToken)
        );

        // The failed validation evicted one; the sweep gets the other
        assert_eq!(store.active_count().await, 1);
        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_one_session() {
        let store = store(DAY);
        let old = store.create_token("192.168.1.1", "example.com").await.unwrap();
        assert_eq!(store.active_count().await, 1);

        let new = store.create_token("192.168.1.1", "example.com").await.unwrap();
        assert_eq!(store.active_count().await, 1);
        assert_ne!(old, new);

        assert!(store.validate_token(&new, "192.168.1.1", "example.com").await.is_ok());
        assert_eq!(
            store.validate_token(&old, "192.168.1.1", "example.com").await,
            Err(SessionError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_concurrent_creation() {
        let store = Arc::new(store(DAY));
        let mut handles = Vec::new();

        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let ip = format!("10.0.0.{}", i);
                let token = store.create_token(&ip, "example.com").await.unwrap();
                store.validate_token(&token, &ip, "example.com").await.is_ok()
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(store.active_count().await, 50);
    }

    #[tokio::test]
    async fn test_periodic_cleanup_stops_on_shutdown() {
        let store = Arc::new(store(DAY));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodic_cleanup(
            Arc::clone(&store),
            Duration::from_secs(60),
            rx,
        ));

        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[test]
    fn test_ip_matches() {
        assert!(ip_matches("192.168.1.1", "192.168.1.1"));
        assert!(ip_matches("::ffff:192.168.1.1", "192.168.1.1"));
        assert!(ip_matches("2001:db8::1", "2001:0db8:0:0:0:0:0:1"));
        assert!(!ip_matches("192.168.1.1", "192.168.1.2"));
        assert!(!ip_matches("not-an-ip", "192.168.1.1"));
    }
}
