//! Messages sent between client and server.
//!
//! Every message crosses the wire as a JSON text frame of the form
//! `{"event": <name>, "payload": <payload>}`.

use chunk_data::*;
use serde::{Serialize, Deserialize};


/// Event name of the response to a log in, carrying a `PlayerSnapshot`.
pub const PLAYER_STATE_EVENT: &'static str = "playerState";

/// Event name of the per-tick push, carrying a `WorldUpdate`.
pub const WORLD_UPDATES_EVENT: &'static str = "worldUpdates";


/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum UpMsg {
    /// Attach this connection to the named player, creating the player if new.
    LogIn {
        username: String,
    },
    /// Start walking towards a position.
    MoveTo {
        position: Position,
    },
    /// Set the player's chat message.
    Say {
        text: String,
    },
}

/// Frame of a message sent from server to client.
#[derive(Debug, Clone, Serialize)]
pub struct DownFrame<'a> {
    pub event: &'a str,
    pub payload: serde_json::Value,
}


/// Everything a client needs to render the world around a player upon logging in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub player_id: ObjectId,
    pub chunk_id: ChunkId,
    pub chunks_ids: Vec<ChunkId>,
    pub position: Position,
    pub chunks: Vec<ChunkListing>,
}

/// Full listing of a chunk's objects, except the receiving player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkListing {
    pub id: ChunkId,
    pub game_objects: Vec<FormattedObject>,
}

/// A tick's worth of changes visible to a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldUpdate {
    /// The player's own position.
    pub position: Position,
    pub chunks_ids: Vec<ChunkId>,
    pub updated_chunks: Vec<ChunkDiff>,
}

/// Changes to one chunk. For a newly subscribed chunk, `updated` lists all its objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDiff {
    pub id: ChunkId,
    pub updated: Vec<FormattedObject>,
    pub removed: Vec<ObjectId>,
}
