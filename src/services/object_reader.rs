//! Opens stored objects for streaming back out.

use crate::{
    models::object::{ObjectName, StoredObject},
    services::{
        chunk_store::{ChunkStore, ChunkStream},
        error::ServiceResult,
    },
};

/// An object opened for reading.
///
/// `body` is consumed once; dropping it mid-way stops the reads. Open the
/// object again to start over.
pub struct Download {
    pub object: StoredObject,
    pub body: ChunkStream,
}

#[derive(Clone)]
pub struct ObjectReader {
    store: ChunkStore,
}

impl ObjectReader {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    /// Open `raw_name` for streaming.
    ///
    /// Malformed names fail with `InvalidId` before the store is touched;
    /// unknown names with `NotFound`.
    pub async fn open_download_stream(&self, raw_name: &str) -> ServiceResult<Download> {
        let name = ObjectName::parse(raw_name)?;
        let (object, body) = self.store.read_chunks_in_order(&name).await?;
        Ok(Download { object, body })
    }
}
