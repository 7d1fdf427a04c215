//! Utility for reading chunks from storage in the background.

use crate::{
    server::{
        channel::*,
        storage::Storage,
        ServerEvent,
    },
    thread_pool::ThreadPool,
    util_abort_handle::AbortHandle,
};
use chunk_data::*;
use std::sync::Arc;


/// Utility for reading chunks from storage in the background.
///
/// Load results are sent back to the server loop as `ChunkReady` events at storage priority.
/// Clone-shareable.
#[derive(Clone)]
pub struct ChunkLoader {
    storage: Arc<dyn Storage>,
    server_send: ServerSender,
    thread_pool: ThreadPool,
}

impl ChunkLoader {
    /// Construct a chunk loader.
    pub fn new(storage: Arc<dyn Storage>, server_send: ServerSender, thread_pool: ThreadPool) -> Self {
        ChunkLoader { storage, server_send, thread_pool }
    }

    /// Submit a job to read the objects of a chunk. Its result event is discarded if aborted.
    pub fn trigger_load(&self, chunk_id: ChunkId, aborted: AbortHandle) {
        let storage = Arc::clone(&self.storage);
        let server_send = self.server_send.clone();
        self.thread_pool.submit(aborted, move |aborted| {
            trace!(%chunk_id, "reading chunk from storage");
            let result = storage.find_objects_by_chunk(chunk_id);
            server_send.send(
                ServerEvent::ChunkReady { chunk_id, result },
                EventPriority::Storage,
                Some(aborted),
            );
        });
    }
}
