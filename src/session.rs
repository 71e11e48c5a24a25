// Session Authenticator - time-bounded proof of a successful match
//
// A session binds one authenticated account id to a token with an expiry.
// Expiry is checked against the current time on every validation, not only
// at creation; a stale token is rejected no matter how recently it was
// issued. Callers are told `AuthFailed` for both no-match and ambiguous
// outcomes so matcher internals never leak.

use crate::config::{EngineConfig, SessionPolicy};
use crate::error::{EngineError, EngineResult};
use crate::matcher::{MatchOutcome, Matcher};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

// ============================================================================
// SESSION
// ============================================================================

/// Ephemeral binding of an authenticated account to a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: Uuid,
    pub account_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// SESSION AUTHENTICATOR
// ============================================================================

pub struct SessionAuthenticator {
    matcher: Matcher,
    sessions: Mutex<HashMap<Uuid, Session>>,
    ttl: Duration,
    policy: SessionPolicy,
}

impl SessionAuthenticator {
    pub fn new(matcher: Matcher, config: &EngineConfig) -> Self {
        SessionAuthenticator {
            matcher,
            sessions: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(config.session_ttl_secs as i64),
            policy: config.session_policy,
        }
    }

    /// Match the candidate template and, on a unique match, issue a session.
    ///
    /// No-match and ambiguous-match both return `AuthFailed`; neither
    /// creates a session, and the near-matching account id stays internal.
    pub fn authenticate(&self, candidate: &[f32]) -> EngineResult<Session> {
        let account_id = match self.matcher.match_template(candidate)? {
            MatchOutcome::Matched { account_id, .. } => account_id,
            MatchOutcome::Ambiguous | MatchOutcome::NoMatch => {
                debug!("authentication rejected");
                return Err(EngineError::AuthFailed);
            }
        };

        let issued_at = Utc::now();
        let session = Session {
            token: Uuid::new_v4(),
            account_id,
            issued_at,
            expires_at: issued_at + self.ttl,
        };

        let mut sessions = self.lock_sessions();
        sessions.insert(session.token, session.clone());
        info!(account_id = %session.account_id, expires_at = %session.expires_at, "session issued");
        Ok(session)
    }

    /// Resolve a token to its account id, checking expiry against now
    pub fn validate(&self, token: &Uuid) -> EngineResult<String> {
        self.validate_at(token, Utc::now())
    }

    /// Expiry check against an explicit clock reading. A session is valid
    /// strictly before `expires_at`; at or past it, validation fails with
    /// `Expired` even with zero clock skew.
    pub fn validate_at(&self, token: &Uuid, now: DateTime<Utc>) -> EngineResult<String> {
        let mut sessions = self.lock_sessions();
        let session = sessions.get(token).ok_or(EngineError::Invalid)?;
        if now >= session.expires_at {
            sessions.remove(token);
            return Err(EngineError::Expired);
        }
        Ok(session.account_id.clone())
    }

    /// Validate a token for a mutating operation. Under the single-use
    /// policy the session is destroyed on admission; the operation already
    /// admitted still runs to completion.
    pub fn admit_mutation(&self, token: &Uuid) -> EngineResult<String> {
        self.admit_mutation_at(token, Utc::now())
    }

    pub fn admit_mutation_at(&self, token: &Uuid, now: DateTime<Utc>) -> EngineResult<String> {
        let account_id = self.validate_at(token, now)?;
        if self.policy == SessionPolicy::SingleUse {
            self.lock_sessions().remove(token);
            debug!(account_id = %account_id, "single-use session consumed");
        }
        Ok(account_id)
    }

    /// Explicitly destroy a session
    pub fn logout(&self, token: &Uuid) -> EngineResult<()> {
        match self.lock_sessions().remove(token) {
            Some(session) => {
                info!(account_id = %session.account_id, "session closed");
                Ok(())
            }
            None => Err(EngineError::Invalid),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
