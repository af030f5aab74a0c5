//! src/services/chunk_store.rs
//!
//! ChunkStore: durable, append-only chunk storage backed by SQLite.
//!
//! An object is a row in `objects` plus `chunk_count` rows in `chunks`, keyed
//! by `(object_name, seq)`. The object row is reserved (incomplete) before any
//! chunk is written and flipped to complete in the same transaction as the
//! final chunk, so a reader either sees every chunk or refuses the object.

use crate::{
    models::object::{ObjectName, StoredObject},
    services::error::{ServiceError, ServiceResult, is_unique_violation},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// Lazy, ordered, finite sequence of chunk payloads.
pub type ChunkStream = BoxStream<'static, ServiceResult<Bytes>>;

const OBJECT_COLUMNS: &str = "name, original_name, content_type, size_bytes, chunk_size, \
     chunk_count, md5, is_complete, created_at, completed_at";

/// Appends a chunk only while its object is still awaiting completion.
const INSERT_CHUNK: &str = "INSERT INTO chunks (object_name, seq, data)
     SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM objects WHERE name = ? AND is_complete = 0)";

const PROBE_PAYLOAD: &[u8] = b"readyz";

#[derive(Clone)]
pub struct ChunkStore {
    /// Shared SQLite connection pool holding both metadata and chunks.
    db: Arc<SqlitePool>,
}

impl ChunkStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Reserve `name` for a new upload.
    ///
    /// Returns `false` when the name is already taken so the caller can draw
    /// another one; an existing object is never overwritten.
    pub async fn reserve(
        &self,
        name: &ObjectName,
        content_type: &str,
        original_name: &str,
        chunk_size: usize,
    ) -> ServiceResult<bool> {
        let result = sqlx::query(
            "INSERT INTO objects (name, original_name, content_type, chunk_size, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name.as_str())
        .bind(original_name)
        .bind(content_type)
        .bind(chunk_size as i64)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(ServiceError::Sqlx(err)),
        }
    }

    /// Durably append chunk `seq` of a reserved object.
    ///
    /// Fails if the chunk already exists or the object is unknown or already
    /// complete.
    pub async fn write_chunk(&self, name: &ObjectName, seq: u32, bytes: &[u8]) -> ServiceResult<()> {
        let result = sqlx::query(INSERT_CHUNK)
            .bind(name.as_str())
            .bind(i64::from(seq))
            .bind(bytes)
            .bind(name.as_str())
            .execute(&*self.db)
            .await
            .map_err(|err| chunk_write_error(err, name, seq))?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::Storage(format!(
                "object `{}` is not accepting chunks",
                name
            )));
        }
        Ok(())
    }

    /// Write the final chunk (if any) and mark the object complete, atomically.
    ///
    /// `next_seq` is the number of chunks already written through
    /// [`ChunkStore::write_chunk`].
    pub async fn commit(
        &self,
        name: &ObjectName,
        next_seq: u32,
        final_chunk: Option<&[u8]>,
        size_bytes: u64,
        md5: &str,
    ) -> ServiceResult<StoredObject> {
        let mut tx = self.db.begin().await?;

        let mut chunk_count = i64::from(next_seq);
        if let Some(bytes) = final_chunk {
            let result = sqlx::query(INSERT_CHUNK)
                .bind(name.as_str())
                .bind(chunk_count)
                .bind(bytes)
                .bind(name.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|err| chunk_write_error(err, name, next_seq))?;
            if result.rows_affected() == 0 {
                return Err(ServiceError::Storage(format!(
                    "object `{}` is not accepting chunks",
                    name
                )));
            }
            chunk_count += 1;
        }

        let sql = format!(
            "UPDATE objects
             SET size_bytes = ?, chunk_count = ?, md5 = ?, is_complete = 1, completed_at = ?
             WHERE name = ? AND is_complete = 0
             RETURNING {OBJECT_COLUMNS}"
        );
        let object = sqlx::query_as::<_, StoredObject>(&sql)
            .bind(size_bytes as i64)
            .bind(chunk_count)
            .bind(md5)
            .bind(Utc::now())
            .bind(name.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                ServiceError::Storage(format!("object `{}` is not awaiting completion", name))
            })?;

        // Dropping `tx` on mismatch rolls the completion back.
        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE object_name = ?")
            .bind(name.as_str())
            .fetch_one(&mut *tx)
            .await?;
        if stored != chunk_count {
            return Err(ServiceError::Storage(format!(
                "object `{}` has {} chunks, expected {}",
                name, stored, chunk_count
            )));
        }

        tx.commit().await?;
        Ok(object)
    }

    /// Remove an unreferenced object and its chunks.
    ///
    /// Returns the number of chunks removed. Objects owned by a submission
    /// are refused. Both deletes carry the ownership guard so the
    /// transaction takes the write lock on its first statement.
    pub async fn discard(&self, name: &ObjectName) -> ServiceResult<u64> {
        let mut tx = self.db.begin().await?;

        let chunks = sqlx::query(
            "DELETE FROM chunks WHERE object_name = ?
               AND NOT EXISTS (SELECT 1 FROM submission_files WHERE object_name = ?)",
        )
        .bind(name.as_str())
        .bind(name.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let objects = sqlx::query(
            "DELETE FROM objects WHERE name = ?
               AND NOT EXISTS (SELECT 1 FROM submission_files WHERE object_name = ?)",
        )
        .bind(name.as_str())
        .bind(name.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if objects == 0 {
            let referenced: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM submission_files WHERE object_name = ?")
                    .bind(name.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
            if referenced > 0 {
                return Err(ServiceError::Storage(format!(
                    "object `{}` is referenced by a submission",
                    name
                )));
            }
        }

        tx.commit().await?;
        debug!(object = %name, chunks, "discarded object");
        Ok(chunks)
    }

    /// Fetch object metadata, complete or not.
    pub async fn fetch_object(&self, name: &ObjectName) -> ServiceResult<StoredObject> {
        let sql = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE name = ?");
        sqlx::query_as::<_, StoredObject>(&sql)
            .bind(name.as_str())
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("object `{}`", name)))
    }

    /// Open the chunks of a complete object in ascending `seq` order.
    pub async fn read_chunks_in_order(
        &self,
        name: &ObjectName,
    ) -> ServiceResult<(StoredObject, ChunkStream)> {
        let object = self.fetch_object(name).await?;
        if !object.is_complete {
            return Err(ServiceError::IncompleteObject(name.to_string()));
        }
        let chunks = self.stream_chunks(&object);
        Ok((object, chunks))
    }

    /// One query per chunk, issued only when the consumer polls, so no
    /// cursor or connection is held between chunks and dropping the stream
    /// releases everything.
    fn stream_chunks(&self, object: &StoredObject) -> ChunkStream {
        let db = self.db.clone();
        let name = object.name.clone();
        let count = object.chunk_count;
        stream::try_unfold(0i64, move |seq| fetch_chunk(db.clone(), name.clone(), seq, count))
            .boxed()
    }

    /// Delete reservations that never completed and are older than `older_than`.
    pub async fn sweep_incomplete(&self, older_than: Duration) -> ServiceResult<u64> {
        let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - age;

        let mut tx = self.db.begin().await?;
        let chunks = sqlx::query(
            "DELETE FROM chunks WHERE object_name IN
                 (SELECT name FROM objects WHERE is_complete = 0 AND created_at <= ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let objects = sqlx::query("DELETE FROM objects WHERE is_complete = 0 AND created_at <= ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if objects > 0 {
            info!(objects, chunks, "swept unfinished uploads");
        }
        Ok(objects)
    }

    /// Delete complete objects that no submission owns and that are older
    /// than `older_than`.
    ///
    /// Only safe while no submission is in flight, i.e. at startup.
    pub async fn sweep_orphans(&self, older_than: Duration) -> ServiceResult<u64> {
        let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - age;

        let mut tx = self.db.begin().await?;
        let chunks = sqlx::query(
            "DELETE FROM chunks WHERE object_name IN
                 (SELECT name FROM objects
                  WHERE is_complete = 1 AND created_at <= ?
                    AND name NOT IN (SELECT object_name FROM submission_files))",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let objects = sqlx::query(
            "DELETE FROM objects
             WHERE is_complete = 1 AND created_at <= ?
               AND name NOT IN (SELECT object_name FROM submission_files)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if objects > 0 {
            info!(objects, chunks, "swept orphaned objects");
        }
        Ok(objects)
    }

    /// Write and read back a probe chunk inside a transaction that is rolled back.
    pub async fn probe(&self) -> ServiceResult<()> {
        let name = ObjectName::generate();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO objects (name, original_name, content_type, chunk_size, created_at)
             VALUES (?, '.readyz', 'application/octet-stream', ?, ?)",
        )
        .bind(name.as_str())
        .bind(PROBE_PAYLOAD.len() as i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        sqlx::query(INSERT_CHUNK)
            .bind(name.as_str())
            .bind(0i64)
            .bind(PROBE_PAYLOAD)
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?;
        let data: Vec<u8> =
            sqlx::query_scalar("SELECT data FROM chunks WHERE object_name = ? AND seq = 0")
                .bind(name.as_str())
                .fetch_one(&mut *tx)
                .await?;

        tx.rollback().await?;

        if data == PROBE_PAYLOAD {
            Ok(())
        } else {
            Err(ServiceError::Storage("probe chunk content mismatch".into()))
        }
    }

    /// Stored chunk lengths in `seq` order.
    #[cfg(test)]
    pub(crate) async fn chunk_lengths(&self, name: &ObjectName) -> Vec<i64> {
        sqlx::query_scalar("SELECT length(data) FROM chunks WHERE object_name = ? ORDER BY seq")
            .bind(name.as_str())
            .fetch_all(&*self.db)
            .await
            .unwrap()
    }

    #[cfg(test)]
    pub(crate) async fn total_chunks(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&*self.db)
            .await
            .unwrap()
    }
}

async fn fetch_chunk(
    db: Arc<SqlitePool>,
    name: String,
    seq: i64,
    count: i64,
) -> ServiceResult<Option<(Bytes, i64)>> {
    if seq >= count {
        return Ok(None);
    }

    let data: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT data FROM chunks WHERE object_name = ? AND seq = ?")
            .bind(&name)
            .bind(seq)
            .fetch_optional(&*db)
            .await?;

    match data {
        Some(data) => Ok(Some((Bytes::from(data), seq + 1))),
        None => Err(ServiceError::Storage(format!(
            "chunk {} of `{}` is missing",
            seq, name
        ))),
    }
}

fn chunk_write_error(err: sqlx::Error, name: &ObjectName, seq: u32) -> ServiceError {
    if is_unique_violation(&err) {
        ServiceError::Storage(format!("chunk {} of `{}` was already written", seq, name))
    } else {
        ServiceError::Sqlx(err)
    }
}
