//! Player sessions and the requests and intents queued against the world on their behalf.

use crate::message::PlayerSnapshot;
use chunk_data::*;
use std::collections::BTreeSet;
use tokio::sync::oneshot;


/// Means of pushing events to a connected player's client.
///
/// Sending must not block. A failure is reported, and the world logs it and carries on.
pub trait Transport: Send {
    /// Send an event with a JSON payload.
    fn send(&self, event: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}


/// A connected player's binding to its game object and subscription state.
pub struct Session {
    /// Id of the player's game object.
    pub player_id: ObjectId,
    pub username: String,
    /// Chunk the player's object is located in.
    pub chunk_id: ChunkId,
    /// Subscribed neighborhood of `chunk_id`.
    pub chunks_ids: Vec<ChunkId>,
    /// Chunks which entered the neighborhood since the last broadcast.
    pub new_chunks: BTreeSet<ChunkId>,
    /// Position most recently told to the client.
    pub last_position: Position,
    /// Where the player is walking to, if anywhere.
    pub move_target: Option<Position>,
    pub transport: Box<dyn Transport>,
}


/// Intent applied at the start of the next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    /// Set a player's chat message.
    UpdateText {
        player_id: ObjectId,
        text: String,
    },
}


/// Request for a player's state snapshot, resolved at the end of the next tick.
pub struct SnapshotRequest {
    pub username: String,
    /// Becomes the session's transport once resolved.
    pub transport: Box<dyn Transport>,
    pub resolve: oneshot::Sender<anyhow::Result<PlayerSnapshot>>,
}
