//! The world server: chunked world state, its tick loop, storage, and client connections.

pub mod channel;
pub mod chunk;
pub mod chunk_loader;
pub mod conn_mgr;
pub mod network;
pub mod runner;
pub mod save_content;
pub mod save_db;
pub mod session;
pub mod storage;
pub mod tick_mgr;
pub mod world;


use self::{
    network::NetworkEvent,
    storage::StorageError,
};
use chunk_data::*;


/// Event sent to the server loop.
#[derive(Debug)]
pub enum ServerEvent {
    /// Stop the server.
    Stop,
    /// Network event.
    Network(NetworkEvent),
    /// A chunk's objects have been read from storage.
    ChunkReady {
        chunk_id: ChunkId,
        result: Result<Vec<GameObject>, StorageError>,
    },
}
