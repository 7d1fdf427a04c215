//! The shapes of things as they are kept in storage. See also the `save_db` module.

use chunk_data::*;
use serde::{Serialize, Deserialize};


/// A game object as persisted. The object id is the storage key, not part of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub kind: ObjectKind,
    pub position: Position,
    pub chunk_id: ChunkId,
    pub player_name: Option<String>,
}

impl StoredObject {
    /// Construct a record for an object at `position`, deriving its chunk.
    pub fn new(kind: ObjectKind, position: Position, player_name: Option<String>) -> Self {
        StoredObject {
            kind,
            position,
            chunk_id: chunk_id_of(position),
            player_name,
        }
    }

    /// Bring a stored record to life under its storage-assigned id.
    pub fn into_game_object(self, id: ObjectId) -> GameObject {
        GameObject {
            id,
            kind: self.kind,
            position: self.position,
            chunk_id: self.chunk_id,
            player_name: self.player_name,
            chat_message: None,
        }
    }
}


/// The fields of a game object which get written back to storage as it moves.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ObjectWrite {
    pub id: ObjectId,
    pub chunk_id: ChunkId,
    pub position: Position,
}

impl ObjectWrite {
    /// Capture the current persisted fields of a live object.
    pub fn of(obj: &GameObject) -> Self {
        ObjectWrite {
            id: obj.id,
            chunk_id: obj.chunk_id,
            position: obj.position,
        }
    }
}


/// Binding of a username to the game object which is that player's body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub username: String,
    pub object_id: ObjectId,
}
