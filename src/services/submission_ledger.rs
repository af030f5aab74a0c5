//! Persists submissions and their ordered file references.

use crate::{
    models::{
        object::ObjectName,
        submission::{FileRef, Submission, SubmissionRow, SubmitterFields},
    },
    services::error::{ServiceError, ServiceResult, is_unique_violation},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc};
use tracing::info;
use uuid::Uuid;

/// File reference row joined with its owning submission.
#[derive(sqlx::FromRow)]
struct OwnedFileRef {
    submission_id: Uuid,
    object_name: String,
    original_name: String,
    content_type: String,
}

#[derive(Clone)]
pub struct SubmissionLedger {
    db: Arc<SqlitePool>,
}

impl SubmissionLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Persist one submission with all of its file references, or nothing.
    ///
    /// Every reference must point at a complete object that no other
    /// submission owns.
    pub async fn create_submission(
        &self,
        fields: SubmitterFields,
        files: Vec<FileRef>,
    ) -> ServiceResult<Submission> {
        fields.validate()?;
        if files.is_empty() {
            return Err(ServiceError::Validation(
                "at least one document is required".into(),
            ));
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO submissions (id, full_name, email, payment_date, account_details, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&fields.full_name)
        .bind(&fields.email)
        .bind(&fields.payment_date)
        .bind(&fields.account_details)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        for (position, file) in files.iter().enumerate() {
            let complete: Option<bool> =
                sqlx::query_scalar("SELECT is_complete FROM objects WHERE name = ?")
                    .bind(&file.object_name)
                    .fetch_optional(&mut *tx)
                    .await?;
            if complete != Some(true) {
                return Err(ServiceError::Validation(format!(
                    "`{}` is not a stored object",
                    file.object_name
                )));
            }

            sqlx::query(
                "INSERT INTO submission_files
                     (submission_id, position, object_name, original_name, content_type)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(&file.object_name)
            .bind(&file.original_name)
            .bind(&file.content_type)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ServiceError::Validation(format!(
                        "`{}` already belongs to a submission",
                        file.object_name
                    ))
                } else {
                    ServiceError::Sqlx(err)
                }
            })?;
        }

        tx.commit().await?;
        info!(submission = %id, files = files.len(), "submission recorded");

        Ok(Submission {
            id,
            fields,
            files,
            created_at,
        })
    }

    /// All submissions, newest first.
    pub async fn list_submissions(&self) -> ServiceResult<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(
            "SELECT id, full_name, email, payment_date, account_details, created_at
             FROM submissions ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&*self.db)
        .await?;

        let refs = sqlx::query_as::<_, OwnedFileRef>(
            "SELECT submission_id, object_name, original_name, content_type
             FROM submission_files ORDER BY submission_id, position",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut files_by_submission: HashMap<Uuid, Vec<FileRef>> = HashMap::new();
        for r in refs {
            files_by_submission
                .entry(r.submission_id)
                .or_default()
                .push(FileRef {
                    object_name: r.object_name,
                    original_name: r.original_name,
                    content_type: r.content_type,
                });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let files = files_by_submission.remove(&row.id).unwrap_or_default();
                row.into_submission(files)
            })
            .collect())
    }

    /// One submission by its UUID string.
    pub async fn get_submission(&self, raw_id: &str) -> ServiceResult<Submission> {
        let id = Uuid::parse_str(raw_id).map_err(|_| ServiceError::InvalidId(raw_id.to_string()))?;

        let row = sqlx::query_as::<_, SubmissionRow>(
            "SELECT id, full_name, email, payment_date, account_details, created_at
             FROM submissions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("submission `{}`", id)))?;

        let files = sqlx::query_as::<_, FileRef>(
            "SELECT object_name, original_name, content_type
             FROM submission_files WHERE submission_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;

        Ok(row.into_submission(files))
    }

    /// Whether some submission owns `name`.
    pub async fn is_referenced(&self, name: &ObjectName) -> ServiceResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM submission_files WHERE object_name = ?")
                .bind(name.as_str())
                .fetch_one(&*self.db)
                .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_support::test_pool,
        models::object::StoredObject,
        services::{
            chunk_store::ChunkStore,
            object_writer::{ObjectWriter, WriteLimits},
        },
    };
    use bytes::Bytes;
    use futures::stream;
    use std::io;

    fn ada() -> SubmitterFields {
        SubmitterFields {
            full_name: "Ada".into(),
            email: "ada@x.com".into(),
            payment_date: "2024-01-01".into(),
            account_details: "acct-1".into(),
        }
    }

    async fn stored(pool: &Arc<SqlitePool>, name: &str) -> StoredObject {
        let writer = ObjectWriter::new(
            ChunkStore::new(pool.clone()),
            WriteLimits {
                chunk_size: 8,
                max_object_size: 1024,
            },
        );
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"payload"))]);
        writer.write_object(body, "text/plain", name).await.unwrap()
    }

    fn file_ref(object: &StoredObject) -> FileRef {
        FileRef {
            object_name: object.name.clone(),
            original_name: object.original_name.clone(),
            content_type: object.content_type.clone(),
        }
    }

    async fn submission_count(pool: &Arc<SqlitePool>) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM submissions")
            .fetch_one(&**pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool.clone());
        let a = stored(&pool, "a.pdf").await;
        let b = stored(&pool, "b.png").await;

        let created = ledger
            .create_submission(ada(), vec![file_ref(&a), file_ref(&b)])
            .await
            .unwrap();
        let fetched = ledger.get_submission(&created.id.to_string()).await.unwrap();

        assert_eq!(fetched.fields, ada());
        assert_eq!(fetched.files, vec![file_ref(&a), file_ref(&b)]);
        assert!(ledger.is_referenced(&a.object_name()).await.unwrap());
    }

    #[tokio::test]
    async fn empty_file_list_is_rejected() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool.clone());

        assert!(matches!(
            ledger.create_submission(ada(), vec![]).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(submission_count(&pool).await, 0);
        assert!(ledger.list_submissions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_required_field_is_rejected() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool.clone());
        let a = stored(&pool, "a.pdf").await;
        let mut fields = ada();
        fields.full_name.clear();

        assert!(matches!(
            ledger.create_submission(fields, vec![file_ref(&a)]).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(submission_count(&pool).await, 0);
    }

    #[tokio::test]
    async fn unknown_object_reference_rolls_back() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool.clone());
        let a = stored(&pool, "a.pdf").await;
        let ghost = FileRef {
            object_name: ObjectName::generate().to_string(),
            original_name: "ghost.pdf".into(),
            content_type: "application/pdf".into(),
        };

        assert!(matches!(
            ledger.create_submission(ada(), vec![file_ref(&a), ghost]).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(submission_count(&pool).await, 0);
        assert!(!ledger.is_referenced(&a.object_name()).await.unwrap());
    }

    #[tokio::test]
    async fn an_object_belongs_to_one_submission() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool.clone());
        let a = stored(&pool, "a.pdf").await;

        ledger.create_submission(ada(), vec![file_ref(&a)]).await.unwrap();
        assert!(matches!(
            ledger.create_submission(ada(), vec![file_ref(&a)]).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(submission_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool.clone());

        let mut ids = Vec::new();
        for name in ["first.pdf", "second.pdf", "third.pdf"] {
            let object = stored(&pool, name).await;
            let submission = ledger
                .create_submission(ada(), vec![file_ref(&object)])
                .await
                .unwrap();
            ids.push(submission.id);
        }

        let listed: Vec<Uuid> = ledger
            .list_submissions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn listing_keeps_file_order() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool.clone());
        let objects = [
            stored(&pool, "1.pdf").await,
            stored(&pool, "2.pdf").await,
            stored(&pool, "3.pdf").await,
        ];
        let refs: Vec<FileRef> = objects.iter().map(file_ref).collect();

        ledger.create_submission(ada(), refs.clone()).await.unwrap();

        let listed = ledger.list_submissions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].files, refs);
    }

    #[tokio::test]
    async fn get_submission_distinguishes_malformed_and_unknown_ids() {
        let (_tmp, pool) = test_pool().await;
        let ledger = SubmissionLedger::new(pool);

        assert!(matches!(
            ledger.get_submission("42").await,
            Err(ServiceError::InvalidId(_))
        ));
        assert!(matches!(
            ledger.get_submission(&Uuid::new_v4().to_string()).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
