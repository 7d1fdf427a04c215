//! The storage contract the world is persisted through, and an in-memory implementation of it.

use crate::server::save_content::*;
use chunk_data::*;
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
    },
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};
use parking_lot::Mutex;


/// Storage failure. Kept distinguishable from other errors so that callers can tell a failing
/// backend apart from a programming error even when it's been wrapped in an `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] redb::Error),
    #[error("corrupt record: {0}")]
    Codec(#[from] bincode::Error),
    #[error("object {0} referenced but not stored")]
    MissingObject(ObjectId),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

macro_rules! impl_from_redb_error {
    ($( $t:ident, )*)=>{$(
        impl From<redb::$t> for StorageError {
            fn from(e: redb::$t) -> Self {
                StorageError::Db(e.into())
            }
        }
    )*};
}
impl_from_redb_error!(
    DatabaseError,
    TransactionError,
    TableError,
    StorageError,
    CommitError,
);


/// Blocking storage of game objects and players.
///
/// Called from the server thread and from thread pool storage jobs.
pub trait Storage: Send + Sync {
    /// All objects whose stored chunk id is `chunk_id`.
    fn find_objects_by_chunk(&self, chunk_id: ChunkId) -> Result<Vec<GameObject>, StorageError>;

    /// Look up a single object.
    fn find_object(&self, id: ObjectId) -> Result<Option<GameObject>, StorageError>;

    /// Any one object of the given kind.
    fn find_object_by_kind(&self, kind: ObjectKind) -> Result<Option<GameObject>, StorageError>;

    /// Store a new object, assigning it an id.
    fn insert_object(&self, record: &StoredObject) -> Result<ObjectId, StorageError>;

    /// Overwrite an existing object's chunk id and position.
    fn update_object_position_and_chunk(&self, write: &ObjectWrite) -> Result<(), StorageError>;

    /// Overwrite the chunk id and position of many objects.
    fn update_objects(&self, writes: &[ObjectWrite]) -> Result<(), StorageError> {
        for write in writes {
            self.update_object_position_and_chunk(write)?;
        }
        Ok(())
    }

    /// Look up a player by username.
    fn find_player_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StorageError>;

    /// Store a new player.
    fn insert_player(&self, record: &PlayerRecord) -> Result<(), StorageError>;
}


/// Storage that lives and dies with the process.
///
/// Counts calls, which is mostly interesting to tests.
#[derive(Debug, Default)]
pub struct MemStorage {
    state: Mutex<MemState>,
    chunk_fetches: AtomicUsize,
    object_updates: AtomicUsize,
}

#[derive(Debug, Default)]
struct MemState {
    next_id: u64,
    objects: BTreeMap<ObjectId, StoredObject>,
    chunk_objects: HashMap<ChunkId, BTreeSet<ObjectId>>,
    players: HashMap<String, PlayerRecord>,
}

impl MemStorage {
    /// Construct empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `find_objects_by_chunk` calls so far.
    pub fn chunk_fetches(&self) -> usize {
        self.chunk_fetches.load(Ordering::SeqCst)
    }

    /// Number of single-object updates so far.
    pub fn object_updates(&self) -> usize {
        self.object_updates.load(Ordering::SeqCst)
    }

    /// Read back an object's stored record.
    pub fn stored(&self, id: ObjectId) -> Option<StoredObject> {
        self.state.lock().objects.get(&id).cloned()
    }
}

impl Storage for MemStorage {
    fn find_objects_by_chunk(&self, chunk_id: ChunkId) -> Result<Vec<GameObject>, StorageError> {
        self.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state.chunk_objects
            .get(&chunk_id)
            .into_iter()
            .flatten()
            .map(|&id| state.objects[&id].clone().into_game_object(id))
            .collect())
    }

    fn find_object(&self, id: ObjectId) -> Result<Option<GameObject>, StorageError> {
        Ok(self.state.lock().objects
            .get(&id)
            .map(|record| record.clone().into_game_object(id)))
    }

    fn find_object_by_kind(&self, kind: ObjectKind) -> Result<Option<GameObject>, StorageError> {
        Ok(self.state.lock().objects
            .iter()
            .find(|(_, record)| record.kind == kind)
            .map(|(&id, record)| record.clone().into_game_object(id)))
    }

    fn insert_object(&self, record: &StoredObject) -> Result<ObjectId, StorageError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = ObjectId(state.next_id);
        state.objects.insert(id, record.clone());
        state.chunk_objects.entry(record.chunk_id).or_default().insert(id);
        Ok(id)
    }

    fn update_object_position_and_chunk(&self, write: &ObjectWrite) -> Result<(), StorageError> {
        self.object_updates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let record = state.objects
            .get_mut(&write.id)
            .ok_or(StorageError::MissingObject(write.id))?;
        let old_chunk_id = record.chunk_id;
        record.chunk_id = write.chunk_id;
        record.position = write.position;
        if old_chunk_id != write.chunk_id {
            if let Some(ids) = state.chunk_objects.get_mut(&old_chunk_id) {
                ids.remove(&write.id);
            }
            state.chunk_objects.entry(write.chunk_id).or_default().insert(write.id);
        }
        Ok(())
    }

    fn find_player_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StorageError> {
        Ok(self.state.lock().players.get(username).cloned())
    }

    fn insert_player(&self, record: &PlayerRecord) -> Result<(), StorageError> {
        self.state.lock().players.insert(record.username.clone(), record.clone());
        Ok(())
    }
}
