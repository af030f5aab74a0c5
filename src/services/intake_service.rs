//! src/services/intake_service.rs
//!
//! IntakeService: the operations the HTTP layer calls.
//!
//! - Submit: stream every file through the object writer, then record the
//!   submission; any failure discards what was already written.
//! - Admin login/logout, list submissions, fetch a file: each passes the
//!   access gate first.
//!
//! The service owns its components; it is cloned into every handler.

use crate::{
    models::{
        object::{ObjectName, StoredObject},
        session::AdminSession,
        submission::{FileRef, Submission, SubmitterFields},
    },
    services::{
        access_gate::{AccessGate, Credentials},
        chunk_store::ChunkStore,
        error::{ServiceError, ServiceResult},
        object_reader::{Download, ObjectReader},
        object_writer::{ObjectWriter, WriteLimits},
        submission_ledger::SubmissionLedger,
    },
};
use bytes::Bytes;
use futures::Stream;
use sqlx::SqlitePool;
use std::{io, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct IntakeService {
    /// Shared SQLite connection pool (objects, chunks, submissions).
    pub db: Arc<SqlitePool>,
    store: ChunkStore,
    writer: ObjectWriter,
    reader: ObjectReader,
    ledger: SubmissionLedger,
    gate: AccessGate,
}

impl IntakeService {
    pub fn new(db: Arc<SqlitePool>, limits: WriteLimits, gate: AccessGate) -> Self {
        let store = ChunkStore::new(db.clone());
        Self {
            writer: ObjectWriter::new(store.clone(), limits),
            reader: ObjectReader::new(store.clone()),
            ledger: SubmissionLedger::new(db.clone()),
            store,
            gate,
            db,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Start collecting the files of one submission.
    pub fn begin_submission(&self) -> PendingSubmission {
        PendingSubmission {
            writer: self.writer.clone(),
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            stored: Vec::new(),
        }
    }

    pub fn login(&self, credentials: &Credentials) -> ServiceResult<AdminSession> {
        self.gate.authenticate(credentials)
    }

    pub fn logout(&self, token: Option<&str>) -> ServiceResult<()> {
        let token = token.ok_or(ServiceError::Forbidden)?;
        self.gate.revoke(token)
    }

    pub async fn list_submissions(&self, token: Option<&str>) -> ServiceResult<Vec<Submission>> {
        self.authorize(token)?;
        self.ledger.list_submissions().await
    }

    pub async fn get_submission(&self, token: Option<&str>, id: &str) -> ServiceResult<Submission> {
        self.authorize(token)?;
        self.ledger.get_submission(id).await
    }

    /// Open a file for download.
    ///
    /// Only objects owned by a submission are served; anything else
    /// (including orphans of failed uploads) is `NotFound`.
    pub async fn fetch_file(&self, token: Option<&str>, raw_name: &str) -> ServiceResult<Download> {
        self.authorize(token)?;
        let name = ObjectName::parse(raw_name)?;
        if !self.ledger.is_referenced(&name).await? {
            return Err(ServiceError::NotFound(format!("file `{}`", name)));
        }
        self.reader.open_download_stream(name.as_str()).await
    }

    fn authorize(&self, token: Option<&str>) -> ServiceResult<()> {
        match token {
            Some(token) if self.gate.authorize(token) => Ok(()),
            _ => Err(ServiceError::Forbidden),
        }
    }
}

/// Files written so far for a submission that is not yet recorded.
///
/// Dropping it without [`commit`](Self::commit) or [`abort`](Self::abort)
/// leaves the written objects orphaned (unreachable, but not cleaned up).
pub struct PendingSubmission {
    writer: ObjectWriter,
    store: ChunkStore,
    ledger: SubmissionLedger,
    stored: Vec<StoredObject>,
}

impl PendingSubmission {
    /// Write one file. On failure every file of this submission is discarded.
    pub async fn add_file<S>(
        &mut self,
        stream: S,
        content_type: &str,
        original_name: &str,
    ) -> ServiceResult<&StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        match self
            .writer
            .write_object(stream, content_type, original_name)
            .await
        {
            Ok(object) => {
                self.stored.push(object);
                Ok(&self.stored[self.stored.len() - 1])
            }
            Err(err) => {
                self.discard_stored().await;
                Err(err)
            }
        }
    }

    pub fn file_count(&self) -> usize {
        self.stored.len()
    }

    /// Record the submission referencing every stored file, or discard them all.
    pub async fn commit(mut self, fields: SubmitterFields) -> ServiceResult<Submission> {
        let files = self
            .stored
            .iter()
            .map(|object| FileRef {
                object_name: object.name.clone(),
                original_name: object.original_name.clone(),
                content_type: object.content_type.clone(),
            })
            .collect();

        match self.ledger.create_submission(fields, files).await {
            Ok(submission) => Ok(submission),
            Err(err) => {
                self.discard_stored().await;
                Err(err)
            }
        }
    }

    /// Give up on the submission and remove its files.
    pub async fn abort(mut self) {
        self.discard_stored().await;
    }

    async fn discard_stored(&mut self) {
        if self.stored.is_empty() {
            return;
        }
        info!(files = self.stored.len(), "discarding files of failed submission");
        for object in self.stored.drain(..) {
            if let Err(err) = self.store.discard(&object.object_name()).await {
                warn!(object = %object.name, error = %err, "failed to discard object");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;
    use futures::{TryStreamExt, stream};
    use std::time::Duration;

    fn service(pool: Arc<SqlitePool>) -> IntakeService {
        IntakeService::new(
            pool,
            WriteLimits {
                chunk_size: 8,
                max_object_size: 64,
            },
            AccessGate::new(None, Duration::from_secs(60)),
        )
    }

    fn ada() -> SubmitterFields {
        SubmitterFields {
            full_name: "Ada".into(),
            email: "ada@x.com".into(),
            payment_date: "2024-01-01".into(),
            account_details: "acct-1".into(),
        }
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    fn admin(service: &IntakeService) -> String {
        service.login(&Credentials::default()).unwrap().token
    }

    async fn count(pool: &Arc<SqlitePool>, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&**pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submit_then_fetch_returns_original_bytes() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool);
        let note: &'static [u8] = b"thirty bytes of proof payload!";
        assert_eq!(note.len(), 30);

        let mut pending = service.begin_submission();
        pending.add_file(body(note), "text/plain", "note.txt").await.unwrap();
        let submission = pending.commit(ada()).await.unwrap();
        assert_eq!(submission.files.len(), 1);

        let token = admin(&service);
        let listed = service.list_submissions(Some(&token)).await.unwrap();
        assert_eq!(listed, vec![submission.clone()]);

        let download = service
            .fetch_file(Some(&token), &submission.files[0].object_name)
            .await
            .unwrap();
        assert_eq!(download.object.content_type, "text/plain");
        assert_eq!(download.object.original_name, "note.txt");
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), note);
    }

    #[tokio::test]
    async fn empty_name_creates_nothing_and_leaves_no_chunks() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool.clone());
        let mut fields = ada();
        fields.full_name = String::new();

        let mut pending = service.begin_submission();
        pending.add_file(body(b"some bytes here"), "text/plain", "a.txt").await.unwrap();
        let result = pending.commit(fields).await;

        assert!(matches!(result, Err(ServiceError::Validation(_))));
        assert_eq!(count(&pool, "submissions").await, 0);
        assert_eq!(count(&pool, "objects").await, 0);
        assert_eq!(count(&pool, "chunks").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failed_submissions_leave_nothing_behind() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool.clone());

        let tasks = (0..32).map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                let mut fields = ada();
                fields.full_name = String::new();
                let mut pending = service.begin_submission();
                for name in ["a.txt", "b.txt", "c.txt"] {
                    pending
                        .add_file(body(b"twenty bytes of data"), "text/plain", name)
                        .await
                        .unwrap();
                }
                pending.commit(fields).await
            })
        });
        for result in futures::future::join_all(tasks).await {
            assert!(matches!(result.unwrap(), Err(ServiceError::Validation(_))));
        }

        assert_eq!(count(&pool, "submissions").await, 0);
        assert_eq!(count(&pool, "objects").await, 0);
        assert_eq!(count(&pool, "chunks").await, 0);
    }

    #[tokio::test]
    async fn submission_without_files_is_rejected() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool);

        let result = service.begin_submission().commit(ada()).await;

        assert!(matches!(result, Err(ServiceError::Validation(_))));
        let token = admin(&service);
        assert!(service.list_submissions(Some(&token)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_file_discards_earlier_files() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool.clone());

        let mut pending = service.begin_submission();
        pending.add_file(body(b"fine"), "text/plain", "ok.txt").await.unwrap();
        let too_big: &'static [u8] = &[0u8; 65];
        let result = pending.add_file(body(too_big), "application/octet-stream", "big.bin").await;

        assert!(matches!(result, Err(ServiceError::PayloadTooLarge { .. })));
        assert_eq!(pending.file_count(), 0);
        assert_eq!(count(&pool, "objects").await, 0);
        assert_eq!(count(&pool, "chunks").await, 0);
    }

    #[tokio::test]
    async fn abort_discards_written_files() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool.clone());

        let mut pending = service.begin_submission();
        pending.add_file(body(b"one"), "text/plain", "1.txt").await.unwrap();
        pending.add_file(body(b"two"), "text/plain", "2.txt").await.unwrap();
        pending.abort().await;

        assert_eq!(count(&pool, "objects").await, 0);
        assert_eq!(count(&pool, "chunks").await, 0);
    }

    #[tokio::test]
    async fn admin_operations_require_a_session() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool);
        let name = ObjectName::generate();

        assert!(matches!(service.list_submissions(None).await, Err(ServiceError::Forbidden)));
        assert!(matches!(
            service.list_submissions(Some("bogus")).await,
            Err(ServiceError::Forbidden)
        ));
        assert!(matches!(
            service.fetch_file(None, name.as_str()).await,
            Err(ServiceError::Forbidden)
        ));
        assert!(matches!(service.logout(None), Err(ServiceError::Forbidden)));
    }

    #[tokio::test]
    async fn logout_revokes_access() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool);
        let token = admin(&service);

        service.logout(Some(&token)).unwrap();

        assert!(matches!(
            service.list_submissions(Some(&token)).await,
            Err(ServiceError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn fetch_with_malformed_id_is_invalid_id() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool);
        let token = admin(&service);

        assert!(matches!(
            service.fetch_file(Some(&token), "64b0c0ffee").await,
            Err(ServiceError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn orphaned_objects_are_not_served() {
        let (_tmp, pool) = test_pool().await;
        let service = service(pool);
        let token = admin(&service);

        // Written but never committed to a submission.
        let mut pending = service.begin_submission();
        let orphan = pending
            .add_file(body(b"orphan"), "text/plain", "o.txt")
            .await
            .unwrap()
            .name
            .clone();
        drop(pending);

        assert!(matches!(
            service.fetch_file(Some(&token), &orphan).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
