//! Streams an incoming file into the chunk store under a fresh random name.

use crate::{
    models::object::{ObjectName, StoredObject},
    services::{
        chunk_store::ChunkStore,
        error::{ServiceError, ServiceResult},
    },
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::io;
use tracing::{debug, warn};

/// Name draws before giving up on a reservation.
const MAX_NAME_ATTEMPTS: usize = 8;

/// Size knobs for the write path.
#[derive(Clone, Copy, Debug)]
pub struct WriteLimits {
    /// Nominal chunk size; every chunk but the last is exactly this long.
    pub chunk_size: usize,
    /// Largest accepted object, in bytes.
    pub max_object_size: u64,
}

#[derive(Clone)]
pub struct ObjectWriter {
    store: ChunkStore,
    limits: WriteLimits,
}

impl ObjectWriter {
    pub fn new(store: ChunkStore, limits: WriteLimits) -> Self {
        let limits = WriteLimits {
            chunk_size: limits.chunk_size.max(1),
            ..limits
        };
        Self { store, limits }
    }

    /// Stream-upload one object.
    ///
    /// - Reserves a random name before any chunk is written.
    /// - Consumes the stream incrementally, writing each chunk as it fills.
    /// - Commits the final chunk and metadata in one transaction.
    ///
    /// On any failure (store error, size limit, client stream error) the
    /// partial object is discarded best-effort and the error returned.
    pub async fn write_object<S>(
        &self,
        stream: S,
        content_type: &str,
        original_name: &str,
    ) -> ServiceResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let name = self.reserve_name(content_type, original_name).await?;

        match self.fill_chunks(&name, stream).await {
            Ok(object) => {
                debug!(
                    object = %name,
                    size = object.size_bytes,
                    chunks = object.chunk_count,
                    "stored object"
                );
                Ok(object)
            }
            Err(err) => {
                if let Err(cleanup) = self.store.discard(&name).await {
                    warn!(object = %name, error = %cleanup, "failed to discard partial object");
                }
                Err(err)
            }
        }
    }

    async fn reserve_name(&self, content_type: &str, original_name: &str) -> ServiceResult<ObjectName> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = ObjectName::generate();
            if self
                .store
                .reserve(&name, content_type, original_name, self.limits.chunk_size)
                .await?
            {
                return Ok(name);
            }
            warn!(object = %name, "object name collision, drawing another");
        }
        Err(ServiceError::Storage(
            "could not allocate a unique object name".into(),
        ))
    }

    async fn fill_chunks<S>(&self, name: &ObjectName, stream: S) -> ServiceResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let chunk_size = self.limits.chunk_size;
        let mut pending = BytesMut::with_capacity(chunk_size);
        let mut next_seq: u32 = 0;
        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();

        pin_mut!(stream);
        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(ServiceError::Interrupted)?;
            size_bytes += piece.len() as u64;
            if size_bytes > self.limits.max_object_size {
                return Err(ServiceError::PayloadTooLarge {
                    limit: self.limits.max_object_size,
                });
            }
            digest.consume(&piece);
            pending.extend_from_slice(&piece);

            // Keep at least one byte back so the last chunk is always written
            // by `commit`, together with the metadata.
            while pending.len() > chunk_size {
                let chunk = pending.split_to(chunk_size);
                self.store.write_chunk(name, next_seq, &chunk).await?;
                next_seq = next_seq.checked_add(1).ok_or_else(|| {
                    ServiceError::Storage(format!("object `{}` exceeds the chunk sequence range", name))
                })?;
            }
        }

        let final_chunk = (!pending.is_empty()).then_some(&pending[..]);
        let md5 = format!("{:x}", digest.compute());
        self.store
            .commit(name, next_seq, final_chunk, size_bytes, &md5)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;
    use futures::{TryStreamExt, stream};

    fn writer(store: &ChunkStore, chunk_size: usize, max_object_size: u64) -> ObjectWriter {
        ObjectWriter::new(
            store.clone(),
            WriteLimits {
                chunk_size,
                max_object_size,
            },
        )
    }

    /// Split `data` into uneven pieces, as a network body would arrive.
    fn body(data: &[u8], piece: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + use<> {
        let pieces: Vec<io::Result<Bytes>> = data
            .chunks(piece.max(1))
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(pieces)
    }

    async fn read_all(store: &ChunkStore, object: &StoredObject) -> Vec<u8> {
        let (_, chunks) = store.read_chunks_in_order(&object.object_name()).await.unwrap();
        let chunks: Vec<Bytes> = chunks.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn chunk_layout_matches_size() {
        let (_tmp, pool) = test_pool().await;
        let store = ChunkStore::new(pool);
        let data = vec![7u8; 10];

        let object = writer(&store, 4, 1024)
            .write_object(body(&data, 3), "application/octet-stream", "seven.bin")
            .await
            .unwrap();

        assert_eq!(object.size_bytes, 10);
        assert_eq!(object.chunk_count, 3);
        assert_eq!(store.chunk_lengths(&object.object_name()).await, vec![4, 4, 2]);
        assert_eq!(object.md5.as_deref(), Some(format!("{:x}", md5::compute(&data)).as_str()));
    }

    #[tokio::test]
    async fn exact_multiple_of_chunk_size_has_no_empty_tail() {
        let (_tmp, pool) = test_pool().await;
        let store = ChunkStore::new(pool);

        let object = writer(&store, 4, 1024)
            .write_object(body(b"abcdefgh", 5), "text/plain", "eight.txt")
            .await
            .unwrap();

        assert_eq!(object.chunk_count, 2);
        assert_eq!(store.chunk_lengths(&object.object_name()).await, vec![4, 4]);
        assert_eq!(read_all(&store, &object).await, b"abcdefgh");
    }

    #[tokio::test]
    async fn empty_upload_has_zero_chunks() {
        let (_tmp, pool) = test_pool().await;
        let store = ChunkStore::new(pool);

        let object = writer(&store, 4, 1024)
            .write_object(body(b"", 1), "text/plain", "empty.txt")
            .await
            .unwrap();

        assert!(object.is_complete);
        assert_eq!(object.chunk_count, 0);
        assert!(read_all(&store, &object).await.is_empty());
    }

    #[tokio::test]
    async fn metadata_is_stored_verbatim() {
        let (_tmp, pool) = test_pool().await;
        let store = ChunkStore::new(pool);

        let object = writer(&store, 16, 1024)
            .write_object(body(b"hello", 2), "text/plain; charset=utf-8", "../etc/passwd")
            .await
            .unwrap();

        assert_eq!(object.content_type, "text/plain; charset=utf-8");
        assert_eq!(object.original_name, "../etc/passwd");
        assert!(ObjectName::parse(&object.name).is_ok());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_and_cleaned_up() {
        let (_tmp, pool) = test_pool().await;
        let store = ChunkStore::new(pool);

        let result = writer(&store, 4, 10)
            .write_object(body(&[1u8; 32], 4), "application/octet-stream", "big.bin")
            .await;

        assert!(matches!(result, Err(ServiceError::PayloadTooLarge { limit: 10 })));
        assert_eq!(store.total_chunks().await, 0);
    }

    #[tokio::test]
    async fn interrupted_stream_discards_partial_chunks() {
        let (_tmp, pool) = test_pool().await;
        let store = ChunkStore::new(pool.clone());
        let pieces: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcdefgh")),
            Ok(Bytes::from_static(b"ijklmnop")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];

        let result = writer(&store, 4, 1024)
            .write_object(stream::iter(pieces), "text/plain", "cut.txt")
            .await;

        assert!(matches!(result, Err(ServiceError::Interrupted(_))));
        assert_eq!(store.total_chunks().await, 0);
        let objects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects")
            .fetch_one(&*pool)
            .await
            .unwrap();
        assert_eq!(objects, 0);
    }

    #[tokio::test]
    async fn concurrent_uploads_get_distinct_names() {
        let (_tmp, pool) = test_pool().await;
        let store = ChunkStore::new(pool);
        let writer = writer(&store, 8, 1024);

        let uploads = (0..16).map(|i| {
            let writer = writer.clone();
            tokio::spawn(async move {
                let data = vec![i as u8; 20];
                writer
                    .write_object(body(&data, 7), "application/octet-stream", "same.bin")
                    .await
                    .unwrap()
            })
        });
        let objects = futures::future::join_all(uploads).await;

        let mut names: Vec<String> = objects.into_iter().map(|o| o.unwrap().name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 16);
    }

    mod round_trip {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn bytes_survive_any_chunk_size(
                data in proptest::collection::vec(any::<u8>(), 0..2048),
                chunk_size in 1usize..300,
                piece in 1usize..500,
            ) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                let (read_back, object) = rt.block_on(async {
                    let (_tmp, pool) = test_pool().await;
                    let store = ChunkStore::new(pool);
                    let object = writer(&store, chunk_size, 1 << 20)
                        .write_object(body(&data, piece), "application/octet-stream", "p.bin")
                        .await
                        .unwrap();
                    (read_all(&store, &object).await, object)
                });

                prop_assert_eq!(&read_back, &data);
                prop_assert_eq!(object.chunk_count as usize, data.len().div_ceil(chunk_size));
            }
        }
    }
}
