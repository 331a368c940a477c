//! # Auth & Session
//!
//! Challenge/response authentication against the directory's trust set,
//! and bearer session tokens with expiry.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   CHALLENGE / RESPONSE                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  client                              server                     │
//! │  ──────                              ──────                     │
//! │  challenge(username)   ───────────►  random opaque token,       │
//! │                                      expires in 10 min,         │
//! │                        ◄───────────  single use                 │
//! │                                                                 │
//! │  sign(token) with the                                           │
//! │  Ed25519 signing key   ───────────►  verify against the         │
//! │                                      directory's trusted keys   │
//! │                        ◄───────────  bearer session token       │
//! │                                      (15 min default)           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Challenges are consumed on first use, successful or not. Session
//! tokens are reusable until expiry. Expired state is dropped by
//! [`AuthManager::cleanup_expired`], which the server calls periodically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::{self, signing, Signature};
use crate::directory::TrustProvider;
use crate::error::{Error, Result};

/// Default challenge lifetime: 10 minutes
pub const DEFAULT_CHALLENGE_TTL_SECS: i64 = 600;

/// Default session lifetime: 15 minutes
pub const DEFAULT_SESSION_TTL_SECS: i64 = 900;

/// Auth timing configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub challenge_ttl_secs: i64,
    pub session_ttl_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }
}

struct Challenge {
    username: String,
    expires_at: i64,
}

struct Session {
    username: String,
    expires_at: i64,
}

/// Per-tenant authentication state.
pub struct AuthManager {
    trust: Arc<dyn TrustProvider>,
    config: AuthConfig,
    challenges: Mutex<HashMap<String, Challenge>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl AuthManager {
    pub fn new(trust: Arc<dyn TrustProvider>, config: AuthConfig) -> Self {
        Self {
            trust,
            config,
            challenges: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a challenge for a username.
    ///
    /// Fails with `UserNotFound` when the directory knows no keys for the
    /// user, and `UserRevoked` when every key has been revoked.
    pub fn issue_challenge(&self, username: &str) -> Result<String> {
        if self.trust.keys_for_user(username).is_empty() {
            if self.trust.is_revoked(username) {
                return Err(Error::UserRevoked(username.to_string()));
            }
            return Err(Error::UserNotFound(username.to_string()));
        }

        let challenge = hex::encode(crypto::random_bytes(32));
        self.challenges.lock().insert(
            challenge.clone(),
            Challenge {
                username: username.to_string(),
                expires_at: crate::time::now_timestamp_millis()
                    + self.config.challenge_ttl_secs * 1000,
            },
        );
        Ok(challenge)
    }

    /// Verify a signed challenge and mint a session token.
    ///
    /// The challenge is consumed whether or not verification succeeds.
    pub fn authenticate(&self, challenge: &str, signature: &Signature) -> Result<String> {
        let pending = self
            .challenges
            .lock()
            .remove(challenge)
            .ok_or(Error::ChallengeExpired)?;
        if pending.expires_at < crate::time::now_timestamp_millis() {
            return Err(Error::ChallengeExpired);
        }

        let verified = self
            .trust
            .keys_for_user(&pending.username)
            .iter()
            .any(|pem| signing::verify_signature(pem, challenge.as_bytes(), signature).is_ok());
        if !verified {
            if self.trust.is_revoked(&pending.username) {
                return Err(Error::UserRevoked(pending.username));
            }
            return Err(Error::InvalidSignature);
        }

        let token = hex::encode(crypto::random_bytes(32));
        self.sessions.lock().insert(
            token.clone(),
            Session {
                username: pending.username,
                expires_at: crate::time::now_timestamp_millis()
                    + self.config.session_ttl_secs * 1000,
            },
        );
        Ok(token)
    }

    /// Resolve a bearer token to its username, if valid and unexpired.
    pub fn validate_token(&self, token: &str) -> Result<String> {
        let sessions = self.sessions.lock();
        match sessions.get(token) {
            Some(session) if session.expires_at >= crate::time::now_timestamp_millis() => {
                Ok(session.username.clone())
            }
            _ => Err(Error::InvalidToken),
        }
    }

    /// Drop expired challenges and sessions. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = crate::time::now_timestamp_millis();
        let mut removed = 0;
        {
            let mut challenges = self.challenges.lock();
            let before = challenges.len();
            challenges.retain(|_, c| c.expires_at >= now);
            removed += before - challenges.len();
        }
        {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|_, s| s.expires_at >= now);
            removed += before - sessions.len();
        }
        removed
    }
}

// ============================================================================
// TESTS
// ============================================================================
