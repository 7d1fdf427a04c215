//! Telling each session what changed around it this tick.

use super::World;
use crate::{
    message::*,
    server::chunk::Chunk,
};


impl World {
    // phase 4
    pub(super) fn send_updates(&mut self) {
        for session in self.sessions.values_mut() {
            let player_id = session.player_id;
            let mut position = None;
            let mut updated_chunks = Vec::new();

            for &chunk_id in &session.chunks_ids {
                // a chunk not loaded yet is listed in full once it is
                let chunk = match self.chunks.get(&chunk_id) {
                    Some(chunk) if chunk.is_loaded() => chunk,
                    _ => continue,
                };
                // moving always marks the player updated in the chunk it ends up in, including
                // the destination of a migration
                if chunk.is_updated(player_id) {
                    if let Some(obj) = chunk.get(player_id) {
                        position = Some(obj.position);
                    }
                }
                if session.new_chunks.contains(&chunk_id) {
                    updated_chunks.push(ChunkDiff {
                        id: chunk_id,
                        updated: chunk.objects_except(player_id).collect(),
                        removed: Vec::new(),
                    });
                } else if chunk.has_changes_except(player_id) {
                    updated_chunks.push(ChunkDiff {
                        id: chunk_id,
                        updated: chunk.updated_except(player_id).collect(),
                        removed: chunk.removed_except(player_id).collect(),
                    });
                }
            }
            let chunks = &self.chunks;
            session.new_chunks.retain(|chunk_id| !chunks
                .get(chunk_id)
                .map(Chunk::is_loaded)
                .unwrap_or(false));

            let moved = position
                .map(|position| position != session.last_position)
                .unwrap_or(false);
            if updated_chunks.is_empty() && !moved {
                continue;
            }
            if let Some(position) = position {
                session.last_position = position;
            }

            let update = WorldUpdate {
                position: session.last_position,
                chunks_ids: session.chunks_ids.clone(),
                updated_chunks,
            };
            let payload = match serde_json::to_value(&update) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(?player_id, %e, "failed to encode world update");
                    continue;
                }
            };
            if let Err(e) = session.transport.send(WORLD_UPDATES_EVENT, payload) {
                warn!(?player_id, %e, "failed to send world update");
            }
        }
    }
}
