//! Moving objects, and the chunk migration that results.

use super::World;
use crate::server::{
    chunk::{
        Chunk,
        Migration,
    },
    save_content::ObjectWrite,
};
use chunk_data::*;
use std::collections::BTreeSet;
use anyhow::Result;


impl World {
    // phase 3. moves are planned for every session first, then applied.
    pub(super) fn move_players(&mut self, delta: f64) -> Result<()> {
        self.retry_subscribed_chunks()?;
        let max_step = self.player_speed * delta;

        let mut moves = Vec::new();
        for session in self.sessions.values_mut() {
            let target = match session.move_target {
                Some(target) => target,
                None => continue,
            };
            let position = match self.chunks
                .get(&session.chunk_id)
                .and_then(|chunk| chunk.get(session.player_id))
            {
                Some(obj) => obj.position,
                None => {
                    debug!(player_id=?session.player_id, "player object not live, can't move");
                    continue;
                }
            };
            let (next, arrived) = step_towards(position, target, max_step);
            if arrived {
                session.move_target = None;
            }
            moves.push((session.player_id, session.chunk_id, next));
        }

        let mut to_await = BTreeSet::new();
        for (player_id, from, position) in moves {
            let chunk_id = match self.move_object(from, player_id, position) {
                Some(chunk_id) => chunk_id,
                None => continue,
            };
            let session = match self.sessions.get_mut(&player_id) {
                Some(session) => session,
                None => continue,
            };
            if chunk_id != session.chunk_id {
                trace!(?player_id, from=%session.chunk_id, to=%chunk_id, "player changed chunk");
                let chunks_ids = neighborhood_of(chunk_id);
                for &new in &chunks_ids {
                    if !session.chunks_ids.contains(&new) {
                        session.new_chunks.insert(new);
                    }
                }
                session.chunk_id = chunk_id;
                session.chunks_ids = chunks_ids;
            }
            to_await.extend(session.chunks_ids.iter().copied());
        }

        let to_await = to_await.into_iter().collect::<Vec<_>>();
        self.await_chunks(&to_await)
    }

    // await every subscribed chunk which isn't loaded, retrying those whose load failed. a
    // player whose own chunk failed can't move until it loads.
    fn retry_subscribed_chunks(&mut self) -> Result<()> {
        let mut to_await = BTreeSet::new();
        for session in self.sessions.values() {
            to_await.extend(session.chunks_ids
                .iter()
                .copied()
                .filter(|chunk_id| !self.chunks
                    .get(chunk_id)
                    .map(Chunk::is_loaded)
                    .unwrap_or(false)));
        }
        if to_await.is_empty() {
            return Ok(());
        }
        debug!(num_chunks=to_await.len(), "awaiting subscribed chunks not loaded");
        let to_await = to_await.into_iter().collect::<Vec<_>>();
        self.await_chunks(&to_await)
    }

    /// Move an object located in chunk `from`, handing it over to its destination chunk if it
    /// crosses into one.
    ///
    /// Returns the chunk the object is now located in, or `None` if it wasn't found in `from`. If
    /// the destination hasn't been requested, the object leaves live simulation until that chunk
    /// loads it from storage.
    pub(super) fn move_object(
        &mut self,
        from: ChunkId,
        id: ObjectId,
        position: Position,
    ) -> Option<ChunkId> {
        let migration = self.chunks.get_mut(&from)?.update_position(id, position);
        match migration {
            Migration::Local => Some(from),
            Migration::Missing => None,
            Migration::Departed(obj) => {
                let to = obj.chunk_id;
                match self.chunks.get_mut(&to) {
                    Some(destination) => destination.add_object(obj),
                    None => {
                        debug!(object_id=?id, chunk_id=%to, "object moved into unrequested chunk");
                        if let Some(source) = self.chunks.get_mut(&from) {
                            source.retain_write(ObjectWrite::of(&obj));
                        }
                    }
                }
                Some(to)
            }
        }
    }
}

/// Step from `from` towards `to` by at most `max_step`.
///
/// Returns the new position and whether it reached `to`, in which case it's exactly `to`.
fn step_towards(from: Position, to: Position, max_step: f64) -> (Position, bool) {
    let offset = to - from;
    let distance = offset.magnitude();
    if distance > max_step {
        (from + offset * (max_step / distance), false)
    } else {
        (to, true)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use vek::*;

    #[test]
    fn step_clamps_then_snaps() {
        let (next, arrived) = step_towards(Vec2::new(0.0, 0.0), Vec2::new(30.0, 40.0), 10.0);
        assert!(!arrived);
        assert!((next - Vec2::new(6.0, 8.0)).magnitude() < 1e-9);

        let (next, arrived) = step_towards(Vec2::new(29.0, 39.0), Vec2::new(30.0, 40.0), 10.0);
        assert!(arrived);
        assert_eq!(next, Vec2::new(30.0, 40.0));
    }
}
