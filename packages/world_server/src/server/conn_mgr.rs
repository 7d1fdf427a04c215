//! See `ConnMgr`.

use crate::{
    message::*,
    server::{
        network::*,
        world::World,
    },
};
use chunk_data::*;
use std::collections::HashMap;
use slab::Slab;
use tokio::sync::oneshot::{
    self,
    error::TryRecvError,
};
use anyhow::{
    Result,
    anyhow,
    ensure,
};


/// Manages network connections and binds them to players.
///
/// Bridges from the "connection" layer of abstraction to the "player" layer of abstraction. A
/// connection goes through these states:
///
/// 1. Not a player. A connection begins here and may only send a log in.
/// 2. Logging in. The log in has been queued against the world as a snapshot request, which
///    resolves at the end of the next tick.
/// 3. Player. The snapshot has been sent to the client and the connection is bound to the
///    player's object. Movement and chat go to the world on the player's behalf.
///
/// Anything else a client sends is a protocol error which kills its connection. At most one
/// connection is bound to a player. If a player logs in again, the newer connection takes over
/// and the older one is killed.
#[derive(Default)]
pub struct ConnMgr {
    // state for each network connection, with the same indices as the network server's slab
    connections: Slab<ConnectionState>,
    // for each bound player, its connection index
    player_conn_idx: HashMap<ObjectId, usize>,
    // sequence number of the next log in, in the order the world receives them
    next_log_in: u64,
}

// state for each network connection
struct ConnectionState {
    // handle to the actual connection
    connection: Connection,
    // bound player, once logged in
    player_id: Option<ObjectId>,
    // pending log in
    logging_in: Option<PendingLogIn>,
    // whether the connection was killed. messages still in flight from it are ignored.
    killed: bool,
}

// log in queued against the world
struct PendingLogIn {
    // log ins resolving in the same tick are bound in this order, so that the last one queued wins
    // both here and in the world
    seq: u64,
    resolved: oneshot::Receiver<Result<PlayerSnapshot>>,
}

// result of polling a pending log in
enum LogInOutcome {
    Resolved(PlayerSnapshot),
    Failed(anyhow::Error),
}

impl ConnMgr {
    /// Construct.
    pub fn new() -> Self {
        Self::default()
    }

    /// The player a connection is bound to, if any.
    #[cfg(test)]
    pub fn player(&self, conn_idx: usize) -> Option<ObjectId> {
        self.connections.get(conn_idx).and_then(|state| state.player_id)
    }

    /// Process a received network event.
    pub fn handle_network_event(&mut self, world: &mut World, network_event: NetworkEvent) {
        match network_event {
            NetworkEvent::AddConnection(conn_idx, connection) => {
                // connection created, add it
                let conn_idx2 = self.connections.insert(ConnectionState {
                    connection,
                    player_id: None,
                    logging_in: None,
                    killed: false,
                });
                debug_assert_eq!(conn_idx, conn_idx2, "NetworkEvent::AddConnection idx mismatch");
                trace!(conn_idx, "connection added");
            }
            NetworkEvent::Message(conn_idx, msg) => {
                // received message, try to process it
                if let Err(e) = self.try_handle_msg(world, conn_idx, msg) {
                    // on error, kill connection
                    warn!(%e, conn_idx, "client protocol error, closing connection");
                    self.kill_connection(world, conn_idx);
                }
            }
            NetworkEvent::RemoveConnection(conn_idx) => {
                // connection stopped, remove it
                let player_id = self.connections.remove(conn_idx).player_id;
                if let Some(player_id) = player_id {
                    self.unbind_player(world, player_id, conn_idx);
                }
                trace!(conn_idx, "connection removed");
            }
        }
    }

    /// Complete log ins whose snapshot requests have resolved.
    ///
    /// Call after each tick. Sends each resolved snapshot to its client and binds the connection
    /// to the player, and kills connections whose log in failed.
    pub fn poll_logins(&mut self, world: &mut World) {
        let mut outcomes = Vec::new();
        for (conn_idx, state) in self.connections.iter_mut() {
            let pending = match state.logging_in.as_mut() {
                Some(pending) => pending,
                None => continue,
            };
            let outcome = match pending.resolved.try_recv() {
                Ok(Ok(snapshot)) => LogInOutcome::Resolved(snapshot),
                Ok(Err(e)) => LogInOutcome::Failed(e),
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Closed) => LogInOutcome::Failed(anyhow!("log in dropped")),
            };
            outcomes.push((pending.seq, conn_idx, outcome));
            state.logging_in = None;
        }

        outcomes.sort_by_key(|&(seq, _, _)| seq);
        for (_, conn_idx, outcome) in outcomes {
            match outcome {
                LogInOutcome::Resolved(snapshot) => self.bind_player(conn_idx, snapshot),
                LogInOutcome::Failed(e) => {
                    warn!(%e, conn_idx, "log in failed, closing connection");
                    self.kill_connection(world, conn_idx);
                }
            }
        }
    }

    // internal method to try to process a message from a network connection. error indicates that
    // the network connection should be terminated.
    fn try_handle_msg(&mut self, world: &mut World, conn_idx: usize, msg: UpMsg) -> Result<()> {
        let state = &mut self.connections[conn_idx];
        if state.killed {
            return Ok(());
        }
        match msg {
            UpMsg::LogIn { username } => {
                ensure!(
                    state.player_id.is_none() && state.logging_in.is_none(),
                    "client tried to log in twice",
                );
                ensure!(!username.is_empty(), "client tried to log in with empty username");
                debug!(conn_idx, %username, "client logging in");
                let transport = Box::new(state.connection.clone());
                state.logging_in = Some(PendingLogIn {
                    seq: self.next_log_in,
                    resolved: world.connect(username, transport),
                });
                self.next_log_in += 1;
            }
            UpMsg::MoveTo { position } => {
                let player_id = state.player_id
                    .ok_or_else(|| anyhow!("wrong time to send move to"))?;
                world.set_move_target(player_id, position);
            }
            UpMsg::Say { text } => {
                let player_id = state.player_id
                    .ok_or_else(|| anyhow!("wrong time to send say"))?;
                world.update_text_from(player_id, text);
            }
        }
        Ok(())
    }

    // internal method to send a resolved snapshot and bind the connection to its player, taking
    // the player over from any older connection.
    fn bind_player(&mut self, conn_idx: usize, snapshot: PlayerSnapshot) {
        let player_id = snapshot.player_id;
        let state = &mut self.connections[conn_idx];
        match serde_json::to_value(&snapshot) {
            Ok(payload) => {
                if let Err(e) = state.connection.send(PLAYER_STATE_EVENT, payload) {
                    debug!(%e, conn_idx, "failed to send player state");
                }
            }
            Err(e) => error!(%e, conn_idx, "failed to encode player state"),
        }
        state.player_id = Some(player_id);

        if let Some(old_conn_idx) = self.player_conn_idx.insert(player_id, conn_idx) {
            if old_conn_idx != conn_idx {
                // the world already replaced the older session, so just drop the old connection
                debug!(?player_id, old_conn_idx, conn_idx, "player logged in again, closing older connection");
                let old = &mut self.connections[old_conn_idx];
                old.player_id = None;
                old.killed = true;
                old.connection.kill();
            }
        }
    }

    // internal method to actively terminate a connection and disconnect the associated player if
    // there is one.
    fn kill_connection(&mut self, world: &mut World, conn_idx: usize) {
        // tell the network connection to die. this will trigger a corresponding
        // `NetworkEvent::RemoveConnection` to happen soon.
        let state = &mut self.connections[conn_idx];
        state.connection.kill();
        state.killed = true;
        state.logging_in = None;
        if let Some(player_id) = state.player_id.take() {
            self.unbind_player(world, player_id, conn_idx);
        }
    }

    // internal method to disconnect a player from the world, if the connection still owns it
    fn unbind_player(&mut self, world: &mut World, player_id: ObjectId, conn_idx: usize) {
        if self.player_conn_idx.get(&player_id) == Some(&conn_idx) {
            self.player_conn_idx.remove(&player_id);
            world.disconnect(player_id);
            info!(?player_id, conn_idx, "player disconnected");
        }
    }
}
