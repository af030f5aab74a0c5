//! Represents an authenticated administrator session.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One administrator context, addressed by its random token.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdminSession {
    /// 64 hex characters; the only thing a client holds.
    #[serde(skip_serializing)]
    pub token: String,

    pub is_admin: bool,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl AdminSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
