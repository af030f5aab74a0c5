//! Represents a proof-of-payment submission and the files it owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::error::{ServiceError, ServiceResult};

/// Submitter-supplied fields. Opaque strings; only emptiness is checked.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitterFields {
    pub full_name: String,
    pub email: String,
    pub payment_date: String,
    pub account_details: String,
}

impl SubmitterFields {
    /// Reject the first required field that is empty or blank.
    pub fn validate(&self) -> ServiceResult<()> {
        let required = [
            ("fullName", &self.full_name),
            ("email", &self.email),
            ("paymentDate", &self.payment_date),
            ("accountDetails", &self.account_details),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ServiceError::Validation(format!("{field} is required")));
            }
        }
        Ok(())
    }

    /// Assign a text field by its wire name. Unknown names are ignored.
    pub fn set(&mut self, field: &str, value: String) -> bool {
        let slot = match field {
            "fullName" => &mut self.full_name,
            "email" => &mut self.email,
            "paymentDate" => &mut self.payment_date,
            "accountDetails" => &mut self.account_details,
            _ => return false,
        };
        *slot = value;
        true
    }
}

/// Reference from a submission to one stored object.
///
/// Serialized with the names the admin front end expects.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileRef {
    #[serde(rename = "fileId")]
    pub object_name: String,

    #[serde(rename = "filename")]
    pub original_name: String,

    #[serde(rename = "contentType")]
    pub content_type: String,
}

/// One persisted submission.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(rename = "_id")]
    pub id: Uuid,

    #[serde(flatten)]
    pub fields: SubmitterFields,

    /// Ordered as uploaded; never empty.
    pub files: Vec<FileRef>,

    pub created_at: DateTime<Utc>,
}

/// Row shape of the `submissions` table.
#[derive(FromRow, Debug)]
pub(crate) struct SubmissionRow {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub payment_date: String,
    pub account_details: String,
    pub created_at: DateTime<Utc>,
}

impl SubmissionRow {
    pub fn into_submission(self, files: Vec<FileRef>) -> Submission {
        Submission {
            id: self.id,
            fields: SubmitterFields {
                full_name: self.full_name,
                email: self.email,
                payment_date: self.payment_date,
                account_details: self.account_details,
            },
            files,
            created_at: self.created_at,
        }
    }
}
