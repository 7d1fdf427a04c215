//! See `World`.

mod movement;
mod broadcast;
mod snapshot;
#[cfg(test)]
mod tests;


use crate::{
    config::ServerConfig,
    message::PlayerSnapshot,
    server::{
        channel::*,
        chunk::Chunk,
        chunk_loader::ChunkLoader,
        save_content::StoredObject,
        session::*,
        storage::{
            Storage,
            StorageError,
        },
        tick_mgr::TickMgr,
        ServerEvent,
    },
    thread_pool::ThreadPool,
    util_abort_handle::AbortGuard,
};
use chunk_data::*;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    mem::take,
    sync::Arc,
    time::Instant,
};
use tokio::sync::oneshot;
use anyhow::{
    Result,
    Error,
};
use vek::*;


/// The authoritative world state, and the tick which advances it.
///
/// Owns every loaded chunk and every player session. All mutation happens on the thread which owns
/// the world: between ticks by queueing intents and requests, and within `tick` by the phases it
/// runs in a fixed order:
///
/// 1. Apply queued tick actions.
/// 2. Move scripted objects.
/// 3. Move players towards their targets, migrating them across chunks and loading chunks which
///    enter their neighborhoods.
/// 4. Send each session the changes visible to it.
/// 5. Clean up per-tick chunk bookkeeping.
/// 6. Flush changed objects to storage.
/// 7. Resolve queued snapshot requests.
///
/// Chunk loads run on the thread pool. When a tick needs chunks loaded it blocks on storage events
/// alone, so intents arriving meanwhile stay queued until the tick is over.
pub struct World {
    player_speed: f64,
    spawn: Position,
    max_storage_failures: u32,

    storage: Arc<dyn Storage>,
    chunk_loader: ChunkLoader,
    server_recv: ServerReceiver,
    tick_mgr: TickMgr,

    chunks: HashMap<ChunkId, Chunk>,
    sessions: BTreeMap<ObjectId, Session>,
    tick_actions: Vec<TickAction>,
    snapshot_requests: Vec<SnapshotRequest>,
    scripts: Vec<OrbitScript>,

    // consecutive storage failures, reset by any success
    storage_failures: u32,
}

// an object moved by its orbit each tick
#[derive(Debug, Clone)]
struct OrbitScript {
    object_id: ObjectId,
    // chunk the object was last known to be located in
    chunk_id: ChunkId,
    center: Position,
    radius: f64,
}

impl World {
    /// Construct with nothing loaded.
    ///
    /// `server_recv` must receive from the channel `server_send` sends to.
    pub fn new(
        config: &ServerConfig,
        storage: Arc<dyn Storage>,
        thread_pool: ThreadPool,
        server_send: ServerSender,
        server_recv: ServerReceiver,
    ) -> Self {
        World {
            player_speed: config.player_speed,
            spawn: config.spawn,
            max_storage_failures: config.max_storage_failures.max(1),

            chunk_loader: ChunkLoader::new(Arc::clone(&storage), server_send, thread_pool),
            storage,
            server_recv,
            tick_mgr: TickMgr::new(config.tick_interval()),

            chunks: HashMap::new(),
            sessions: BTreeMap::new(),
            tick_actions: Vec::new(),
            snapshot_requests: Vec::new(),
            scripts: Vec::new(),

            storage_failures: 0,
        }
    }

    /// Set up scripted objects, creating them in storage if this world has never had them.
    pub fn seed(&mut self, config: &ServerConfig) -> Result<()> {
        let orbit = match &config.orbit {
            Some(orbit) => orbit,
            None => return Ok(()),
        };
        let npc = match self.storage.find_object_by_kind(ObjectKind::Npc)? {
            Some(npc) => npc,
            None => {
                let record = StoredObject::new(
                    ObjectKind::Npc,
                    orbit_position(orbit.center, orbit.radius, 0.0),
                    None,
                );
                let id = self.storage.insert_object(&record)?;
                info!(object_id=?id, "created orbiting npc");
                record.into_game_object(id)
            }
        };
        self.scripts.push(OrbitScript {
            object_id: npc.id,
            chunk_id: npc.chunk_id,
            center: orbit.center,
            radius: orbit.radius,
        });
        Ok(())
    }

    /// When the next tick is due.
    pub fn next_tick(&self) -> Instant {
        self.tick_mgr.next_tick()
    }

    /// Queue a request for the named player's state, connecting it through `transport`.
    ///
    /// Resolved at the end of the next tick, creating the player if it's new. From then on the
    /// player has a session which receives world updates.
    pub fn connect(
        &mut self,
        username: String,
        transport: Box<dyn Transport>,
    ) -> oneshot::Receiver<Result<PlayerSnapshot>> {
        let (resolve, resolved) = oneshot::channel();
        self.snapshot_requests.push(SnapshotRequest { username, transport, resolve });
        resolved
    }

    /// Set the position a player walks towards.
    pub fn set_move_target(&mut self, player_id: ObjectId, target: Position) {
        if !(target.x.is_finite() && target.y.is_finite()) {
            debug!(?player_id, ?target, "ignoring non-finite move target");
            return;
        }
        match self.sessions.get_mut(&player_id) {
            Some(session) => session.move_target = Some(target),
            None => warn!(?player_id, "move target for player without session"),
        }
    }

    /// Queue setting a player's chat message at the start of the next tick.
    pub fn update_text_from(&mut self, player_id: ObjectId, text: String) {
        self.tick_actions.push(TickAction::UpdateText { player_id, text });
    }

    /// Remove a player's session. Its object stays in the world.
    pub fn disconnect(&mut self, player_id: ObjectId) {
        if self.sessions.remove(&player_id).is_some() {
            debug!(?player_id, "player session removed");
        }
    }

    /// Get a chunk, if it's been requested.
    pub fn chunk(&self, chunk_id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&chunk_id)
    }

    /// Get a player's session, if connected.
    pub fn session(&self, player_id: ObjectId) -> Option<&Session> {
        self.sessions.get(&player_id)
    }

    /// Start loading a chunk unless it's loaded or already loading.
    pub fn request_chunk(&mut self, chunk_id: ChunkId) {
        match self.chunks.get_mut(&chunk_id) {
            Some(chunk) => {
                if chunk.is_failed() {
                    debug!(%chunk_id, "retrying chunk load");
                    let aborted = AbortGuard::new();
                    self.chunk_loader.trigger_load(chunk_id, aborted.new_handle());
                    chunk.retry_load(aborted);
                }
            }
            None => {
                let aborted = AbortGuard::new();
                self.chunk_loader.trigger_load(chunk_id, aborted.new_handle());
                self.chunks.insert(chunk_id, Chunk::new_loading(chunk_id, aborted));
            }
        }
    }

    /// Request the given chunks and block until none of them is still loading.
    ///
    /// Only storage events are taken from the channel while blocking. A chunk can still end up
    /// failed rather than loaded.
    pub fn await_chunks(&mut self, chunk_ids: &[ChunkId]) -> Result<()> {
        for &chunk_id in chunk_ids {
            self.request_chunk(chunk_id);
        }
        while chunk_ids.iter().any(|chunk_id| self.chunks[chunk_id].is_loading()) {
            match self.server_recv.recv_blocking(EventPriority::Storage) {
                ServerEvent::ChunkReady { chunk_id, result } => self.on_chunk_ready(chunk_id, result)?,
                _ => error!("non-storage event received at storage priority"),
            }
        }
        Ok(())
    }

    /// Call upon a chunk load job finishing.
    ///
    /// Errors if storage has failed too many times in a row.
    pub fn on_chunk_ready(
        &mut self,
        chunk_id: ChunkId,
        result: Result<Vec<GameObject>, StorageError>,
    ) -> Result<()> {
        let chunk = match self.chunks.get_mut(&chunk_id) {
            Some(chunk) => chunk,
            None => {
                warn!(%chunk_id, "load result for chunk never requested");
                return Ok(());
            }
        };
        match result {
            Ok(objects) => {
                chunk.on_loaded(objects);
                self.on_storage_success();
                Ok(())
            }
            Err(e) => {
                error!(%chunk_id, %e, "failed to load chunk");
                chunk.on_load_failed();
                self.on_storage_failure(e)
            }
        }
    }

    /// Do a tick. See the type-level docs.
    ///
    /// Errors if storage has failed too many times in a row, in which case the server should stop.
    pub fn tick(&mut self) -> Result<()> {
        let started = Instant::now();
        let info = self.tick_mgr.begin_tick();
        trace!(tick=info.tick, "beginning tick");

        self.apply_tick_actions();
        self.run_scripts(info.time);
        self.move_players(info.delta)?;
        self.send_updates();
        self.tick_clean_up();
        self.flush()?;
        self.resolve_snapshot_requests()?;

        self.tick_mgr.on_tick_done(started);
        Ok(())
    }

    // phase 1
    fn apply_tick_actions(&mut self) {
        for action in take(&mut self.tick_actions) {
            match action {
                TickAction::UpdateText { player_id, text } => {
                    let chunk_id = match self.sessions.get(&player_id) {
                        Some(session) => session.chunk_id,
                        None => {
                            debug!(?player_id, "dropping text from disconnected player");
                            continue;
                        }
                    };
                    let applied = self.chunks
                        .get_mut(&chunk_id)
                        .map(|chunk| chunk
                            .update_object(player_id, |obj| obj.chat_message = Some(text)))
                        .unwrap_or(false);
                    if !applied {
                        warn!(?player_id, %chunk_id, "player object not found for text update");
                    }
                }
            }
        }
    }

    // phase 2
    fn run_scripts(&mut self, time: f64) {
        for i in 0..self.scripts.len() {
            let OrbitScript { object_id, chunk_id, center, radius } = self.scripts[i].clone();
            let loaded = self.chunks
                .get(&chunk_id)
                .map(Chunk::is_loaded)
                .unwrap_or(false);
            if !loaded {
                continue;
            }
            let position = orbit_position(center, radius, time);
            match self.move_object(chunk_id, object_id, position) {
                Some(chunk_id) => self.scripts[i].chunk_id = chunk_id,
                None => trace!(?object_id, "scripted object not found"),
            }
        }
    }

    // phase 5
    fn tick_clean_up(&mut self) {
        for chunk in self.chunks.values_mut() {
            chunk.tick_clean_up();
        }
        self.tick_actions.clear();
    }

    /// Write every changed object to storage, chunk by chunk.
    ///
    /// Changes which fail to write are kept for the next flush. Errors if storage has failed too
    /// many times in a row.
    pub fn flush(&mut self) -> Result<()> {
        let mut written = 0;
        let mut failure = None;
        for chunk in self.chunks.values_mut() {
            match chunk.flush_changes(&*self.storage) {
                Ok(n) => written += n,
                Err(e) => {
                    error!(chunk_id=%chunk.id(), %e, "failed to save chunk changes");
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => self.on_storage_failure(e),
            None => {
                if written > 0 {
                    trace!(written, "saved changed objects");
                    self.on_storage_success();
                }
                Ok(())
            }
        }
    }

    fn on_storage_success(&mut self) {
        self.storage_failures = 0;
    }

    // count a storage failure, erroring once there have been too many in a row
    fn on_storage_failure(&mut self, e: StorageError) -> Result<()> {
        self.storage_failures += 1;
        if self.storage_failures >= self.max_storage_failures {
            let n = self.storage_failures;
            return Err(Error::new(e).context(format!("{n} consecutive storage failures")));
        }
        warn!(failures=self.storage_failures, max=self.max_storage_failures, "storage failure");
        Ok(())
    }
}

// position on an orbit at the given time, rounded to whole units
fn orbit_position(center: Position, radius: f64, time: f64) -> Position {
    Vec2::new(
        (center.x + radius * time.cos()).round(),
        (center.y + radius * time.sin()).round(),
    )
}
