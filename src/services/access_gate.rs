//! Administrator authentication and session-gated authorization.
//!
//! Per session: `Unauthenticated -> Authenticated` on [`AccessGate::authenticate`],
//! `Authenticated -> Revoked` on [`AccessGate::revoke`] or expiry. Revoked is
//! terminal: the token is forgotten and never issued again.

use crate::{
    models::session::AdminSession,
    services::error::{ServiceError, ServiceResult},
};
use chrono::Utc;
use parking_lot::RwLock;
use rand::{RngCore, rngs::OsRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

const SESSION_TOKEN_BYTES: usize = 32;

/// What a client presents at login.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Credentials {
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct AccessGate {
    sessions: Arc<RwLock<HashMap<String, AdminSession>>>,
    /// SHA-256 of the configured admin token; `None` means open mode.
    credential: Option<[u8; 32]>,
    ttl: chrono::Duration,
}

impl AccessGate {
    /// Build a gate. With `admin_token == None` every login succeeds.
    pub fn new(admin_token: Option<&str>, ttl: Duration) -> Self {
        let credential = admin_token.map(digest);
        if credential.is_none() {
            warn!("no admin token configured; any caller can log in as admin");
        }
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            credential,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    /// Verify `credentials` and open a new admin session.
    pub fn authenticate(&self, credentials: &Credentials) -> ServiceResult<AdminSession> {
        if let Some(expected) = &self.credential {
            let supplied = digest(credentials.password.as_deref().unwrap_or_default());
            if !bool::from(supplied.as_slice().ct_eq(expected.as_slice())) {
                warn!("rejected admin login with bad credentials");
                return Err(ServiceError::Forbidden);
            }
        }

        let now = Utc::now();
        let session = AdminSession {
            token: new_token(),
            is_admin: true,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.sessions
            .write()
            .insert(session.token.clone(), session.clone());
        info!(expires_at = %session.expires_at, "admin session opened");
        Ok(session)
    }

    /// True iff `token` names a live session carrying the admin flag.
    ///
    /// An expired session is revoked on the way.
    pub fn authorize(&self, token: &str) -> bool {
        self.session(token).is_some()
    }

    /// The live session behind `token`, or `Forbidden`.
    pub fn require(&self, token: Option<&str>) -> ServiceResult<AdminSession> {
        token
            .and_then(|t| self.session(t))
            .ok_or(ServiceError::Forbidden)
    }

    /// Destroy the session behind `token`.
    pub fn revoke(&self, token: &str) -> ServiceResult<()> {
        self.require(Some(token))?;
        self.sessions.write().remove(token);
        info!("admin session revoked");
        Ok(())
    }

    /// Drop every expired session; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        before - sessions.len()
    }

    fn session(&self, token: &str) -> Option<AdminSession> {
        let now = Utc::now();
        let found = self.sessions.read().get(token).cloned()?;
        if found.is_expired_at(now) {
            self.sessions.write().remove(token);
            return None;
        }
        found.is_admin.then_some(found)
    }
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

fn new_token() -> String {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
