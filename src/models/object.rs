//! Represents a stored object (uploaded file) and its opaque name.

use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::services::error::{ServiceError, ServiceResult};

/// Bytes of entropy in a generated object name.
pub const OBJECT_NAME_BYTES: usize = 16;

/// Opaque, randomly generated storage address of an object.
///
/// Always `OBJECT_NAME_BYTES * 2` lower-case hex characters. The uploader's
/// filename never takes part in addressing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectName(String);

impl ObjectName {
    /// Generate a fresh name from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; OBJECT_NAME_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Validate an externally supplied identifier.
    pub fn parse(raw: &str) -> ServiceResult<Self> {
        let well_formed = raw.len() == OBJECT_NAME_BYTES * 2
            && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if well_formed {
            Ok(Self(raw.to_string()))
        } else {
            Err(ServiceError::InvalidId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of one object in the chunk store.
///
/// The payload itself lives in `chunks`; this row only describes it. Rows
/// with `is_complete == false` are reservations of an upload still in flight
/// (or one that failed) and are never served.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Random storage name (see [`ObjectName`]).
    pub name: String,

    /// Filename supplied by the uploader, metadata only.
    pub original_name: String,

    /// MIME type supplied by the uploader, stored verbatim.
    pub content_type: String,

    /// Total payload size in bytes.
    pub size_bytes: i64,

    /// Nominal chunk size used when the object was written.
    pub chunk_size: i64,

    /// Number of chunks; `ceil(size_bytes / chunk_size)`.
    pub chunk_count: i64,

    /// Hex MD5 of the payload, computed while streaming.
    pub md5: Option<String>,

    pub is_complete: bool,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl StoredObject {
    pub fn object_name(&self) -> ObjectName {
        ObjectName(self.name.clone())
    }
}
