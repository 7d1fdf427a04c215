//! Reading and writing the save file. See also the `save_content` module.
//!
//! The save file is a redb database with four tables:
//!
//! - `objects`: object id to bincode-encoded `StoredObject`.
//! - `chunk_index`: multimap from `"x,y"` chunk id to the ids of objects stored in that chunk.
//!   Kept in step with the `chunk_id` field of each object record within the same transaction.
//! - `players`: username to the id of that player's object.
//! - `meta`: counters, currently only the last assigned object id.
//!
//! All tables are created when the database is opened, so read transactions can always open
//! them.

use crate::server::{
    save_content::*,
    storage::{
        Storage,
        StorageError,
    },
};
use chunk_data::*;
use std::{
    fs,
    path::Path,
};
use anyhow::Context;
use redb::{
    Database,
    TableDefinition,
    MultimapTableDefinition,
    ReadableTable,
    ReadableMultimapTable,
    WriteTransaction,
};


const SAVES_SUBDIR: &'static str = "saves";

const OBJECTS: TableDefinition<u64, &[u8]> = TableDefinition::new("objects");
const CHUNK_INDEX: MultimapTableDefinition<&str, u64> = MultimapTableDefinition::new("chunk_index");
const PLAYERS: TableDefinition<&str, u64> = TableDefinition::new("players");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const LAST_OBJECT_ID_KEY: &'static str = "last_object_id";


/// Open handle for reading and writing a save file database.
///
/// Operations are blocking.
#[derive(Debug)]
pub struct SaveDb {
    db: Database,
}

impl SaveDb {
    /// Open the save file of the given name in the saves directory, creating it if it doesn't
    /// yet exist.
    pub fn open(name: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(SAVES_SUBDIR)
            .with_context(|| format!("creating {SAVES_SUBDIR} directory"))?;
        let mut name = name.to_owned();
        name.push_str(".redb");
        let path = Path::new(SAVES_SUBDIR).join(name);
        let pre_existent = path.try_exists()?;
        trace!(?pre_existent, ?path, "opening database");
        let save_db = Self::open_path(&path)?;
        info!(?pre_existent, ?path, "successfully opened save file database");
        Ok(save_db)
    }

    /// Open a save file database at an exact path, creating it if it doesn't yet exist.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(OBJECTS)?;
        txn.open_multimap_table(CHUNK_INDEX)?;
        txn.open_table(PLAYERS)?;
        txn.open_table(META)?;
        txn.commit()?;

        Ok(SaveDb { db })
    }
}

// allocate the next object id within a write transaction
fn next_object_id(txn: &WriteTransaction) -> Result<ObjectId, StorageError> {
    let mut meta = txn.open_table(META)?;
    let last = meta.get(LAST_OBJECT_ID_KEY)?.map(|guard| guard.value()).unwrap_or(0);
    meta.insert(LAST_OBJECT_ID_KEY, last + 1)?;
    Ok(ObjectId(last + 1))
}

impl Storage for SaveDb {
    fn find_objects_by_chunk(&self, chunk_id: ChunkId) -> Result<Vec<GameObject>, StorageError> {
        let txn = self.db.begin_read()?;
        let index = txn.open_multimap_table(CHUNK_INDEX)?;
        let objects = txn.open_table(OBJECTS)?;
        let mut found = Vec::new();
        for id in index.get(chunk_id.to_string().as_str())? {
            let id = ObjectId(id?.value());
            let record: StoredObject = match objects.get(id.0)? {
                Some(guard) => bincode::deserialize(guard.value())?,
                None => return Err(StorageError::MissingObject(id)),
            };
            found.push(record.into_game_object(id));
        }
        Ok(found)
    }

    fn find_object(&self, id: ObjectId) -> Result<Option<GameObject>, StorageError> {
        let txn = self.db.begin_read()?;
        let objects = txn.open_table(OBJECTS)?;
        let record: Option<StoredObject> = match objects.get(id.0)? {
            Some(guard) => Some(bincode::deserialize(guard.value())?),
            None => None,
        };
        Ok(record.map(|record| record.into_game_object(id)))
    }

    fn find_object_by_kind(&self, kind: ObjectKind) -> Result<Option<GameObject>, StorageError> {
        let txn = self.db.begin_read()?;
        let objects = txn.open_table(OBJECTS)?;
        for entry in objects.iter()? {
            let (id, bytes) = entry?;
            let record: StoredObject = bincode::deserialize(bytes.value())?;
            if record.kind == kind {
                return Ok(Some(record.into_game_object(ObjectId(id.value()))));
            }
        }
        Ok(None)
    }

    fn insert_object(&self, record: &StoredObject) -> Result<ObjectId, StorageError> {
        let bytes = bincode::serialize(record)?;
        let txn = self.db.begin_write()?;
        let id = next_object_id(&txn)?;
        let mut objects = txn.open_table(OBJECTS)?;
        objects.insert(id.0, bytes.as_slice())?;
        drop(objects);
        let mut index = txn.open_multimap_table(CHUNK_INDEX)?;
        index.insert(record.chunk_id.to_string().as_str(), id.0)?;
        drop(index);
        txn.commit()?;
        Ok(id)
    }

    fn update_object_position_and_chunk(&self, write: &ObjectWrite) -> Result<(), StorageError> {
        self.update_objects(&[*write])
    }

    fn update_objects(&self, writes: &[ObjectWrite]) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        let mut objects = txn.open_table(OBJECTS)?;
        let mut index = txn.open_multimap_table(CHUNK_INDEX)?;
        for write in writes {
            let mut record: StoredObject = match objects.get(write.id.0)? {
                Some(guard) => bincode::deserialize(guard.value())?,
                None => return Err(StorageError::MissingObject(write.id)),
            };
            if record.chunk_id != write.chunk_id {
                index.remove(record.chunk_id.to_string().as_str(), write.id.0)?;
                index.insert(write.chunk_id.to_string().as_str(), write.id.0)?;
            }
            record.chunk_id = write.chunk_id;
            record.position = write.position;
            objects.insert(write.id.0, bincode::serialize(&record)?.as_slice())?;
        }
        drop(objects);
        drop(index);
        txn.commit()?;
        Ok(())
    }

    fn find_player_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StorageError> {
        let txn = self.db.begin_read()?;
        let players = txn.open_table(PLAYERS)?;
        let object_id = players.get(username)?.map(|guard| ObjectId(guard.value()));
        Ok(object_id.map(|object_id| PlayerRecord {
            username: username.to_owned(),
            object_id,
        }))
    }

    fn insert_player(&self, record: &PlayerRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        let mut players = txn.open_table(PLAYERS)?;
        players.insert(record.username.as_str(), record.object_id.0)?;
        drop(players);
        txn.commit()?;
        Ok(())
    }
}
