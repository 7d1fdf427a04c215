//! Resolving queued snapshot requests into sessions.

use super::World;
use crate::{
    message::*,
    server::{
        save_content::*,
        session::*,
        storage::StorageError,
    },
};
use chunk_data::*;
use std::{
    collections::BTreeSet,
    mem::take,
};
use anyhow::{
    Result,
    anyhow,
};


impl World {
    // phase 7
    pub(super) fn resolve_snapshot_requests(&mut self) -> Result<()> {
        for request in take(&mut self.snapshot_requests) {
            let SnapshotRequest { username, transport, resolve } = request;

            let player = match self.find_or_create_player(&username) {
                Ok(player) => {
                    self.on_storage_success();
                    player
                }
                Err(e) => {
                    error!(%username, %e, "storage failure acquiring player");
                    let _ = resolve.send(Err(anyhow!("unable to load player {:?}", username)));
                    self.on_storage_failure(e)?;
                    continue;
                }
            };

            let player_id = player.id;
            // the live copy is authoritative if there is one. it may be elsewhere than storage
            // says if saving it failed.
            let chunk_id = self.chunks
                .iter()
                .find(|(_, chunk)| chunk.holding(player_id).is_some())
                .map(|(&chunk_id, _)| chunk_id)
                .unwrap_or_else(|| chunk_id_of(player.position));
            let chunks_ids = neighborhood_of(chunk_id);
            self.await_chunks(&chunks_ids)?;

            let home = self.chunks
                .get_mut(&chunk_id)
                .ok_or_else(|| anyhow!("chunk {} not present after awaiting it", chunk_id))?;
            let position = match home.holding(player_id) {
                Some(live) => live.position,
                None => {
                    let position = player.position;
                    home.add_object(player);
                    position
                }
            };

            let snapshot = PlayerSnapshot {
                player_id,
                chunk_id,
                chunks_ids: chunks_ids.clone(),
                position,
                chunks: chunks_ids
                    .iter()
                    .map(|&id| ChunkListing {
                        id,
                        game_objects: self.chunks
                            .get(&id)
                            .map(|chunk| chunk.objects_except(player_id).collect())
                            .unwrap_or_default(),
                    })
                    .collect(),
            };

            // chunks which failed to load were listed empty, so list them again once loaded
            let new_chunks = chunks_ids
                .iter()
                .copied()
                .filter(|chunk_id| !self.chunks[chunk_id].is_loaded())
                .collect::<BTreeSet<_>>();
            let session = Session {
                player_id,
                username: username.clone(),
                chunk_id,
                chunks_ids,
                new_chunks,
                last_position: position,
                move_target: None,
                transport,
            };
            if let Some(replaced) = self.sessions.insert(player_id, session) {
                warn!(?player_id, username=%replaced.username, "replacing existing player session");
            }
            if resolve.send(Ok(snapshot)).is_err() {
                debug!(?player_id, %username, "snapshot requester went away, dropping session");
                self.sessions.remove(&player_id);
            } else {
                info!(?player_id, %username, "player connected");
            }
        }
        Ok(())
    }

    // look up a player's object, or create a new player if the username is new
    fn find_or_create_player(&mut self, username: &str) -> Result<GameObject, StorageError> {
        if let Some(record) = self.storage.find_player_by_username(username)? {
            return self.storage
                .find_object(record.object_id)?
                .ok_or(StorageError::MissingObject(record.object_id));
        }

        let record = StoredObject::new(ObjectKind::Player, self.spawn, Some(username.to_owned()));
        let object_id = self.storage.insert_object(&record)?;
        self.storage.insert_player(&PlayerRecord {
            username: username.to_owned(),
            object_id,
        })?;
        info!(?object_id, %username, "created new player");

        let player = record.into_game_object(object_id);
        if let Some(chunk) = self.chunks.get_mut(&player.chunk_id) {
            chunk.add_object(player.clone());
        }
        Ok(player)
    }
}
