//! Handle to the tokio system for handling network IO with clients.

use crate::{
    message::*,
    server::{
        channel::*,
        session::Transport,
        ServerEvent,
    },
};
use std::sync::Arc;
use parking_lot::Mutex;
use slab::Slab;
use tokio::{
    runtime::Handle,
    task::AbortHandle,
};
use anyhow::Result;

mod ws;


/// Main handle to the tokio system for handling network IO with clients.
///
/// Sends network events to the server loop. Serializes changes to the space of network
/// connections. Shuts down all network tasks when dropped, although won't necessarily send
/// `RemoveConnection` events in that case, because it's assumed the whole server is dropping too.
pub struct NetworkServer(NetworkServerHandle);

/// Secondary handle to the tokio system for handling network IO with clients.
///
/// Does not keep network server alive nor shut it down when dropped--see `NetworkServer` for
/// that. Can be used to open the server to new connections.
#[derive(Clone)]
pub struct NetworkServerHandle(Arc<NetworkServerSharedState>);

// network server state shared between main handle and other tasks
struct NetworkServerSharedState {
    // sender handle to the server channel
    server_send: ServerSender,
    // lockable shared state
    lockable: Mutex<NetworkServerLockableState>,
}

// network server state guarded by the mutex that synchronizes changes to the space of connections
struct NetworkServerLockableState {
    // whether the network server has been shut down as a whole. if this happens, new connections
    // should not be created. remove connection events aren't necessary in this state either.
    shut_down: bool,
    // slab that allocates connection indices and tracks handles for shutting down all connections
    // if the network server as a whole is shut down.
    slab: Slab<ws::SlabEntry>,
    // handles to abort tasks which accept new connections
    bind_abort_handles: Vec<AbortHandle>,
}

/// Handle to the network IO connection with a single client.
///
/// Only used for transmitting to the client. Messages received from the client are placed into
/// `NetworkEvent`s so as to be serialized through the server event channel.
///
/// Dropping this handle does not itself close the network connection. Clones refer to the same
/// connection.
#[derive(Debug, Clone)]
pub struct Connection(ws::Connection);

/// Some discrete network input event happened. Goes to the conn mgr for processing.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A new network connection was created and assigned a connection index in a slab pattern.
    AddConnection(usize, Connection),
    /// A message was received from a current network connection.
    Message(usize, UpMsg),
    /// A network connection has been destroyed and its connection index deallocated.
    RemoveConnection(usize),
}

impl NetworkServer {
    /// Construct. Doesn't yet bind.
    pub fn new(server_send: ServerSender) -> Self {
        NetworkServer(NetworkServerHandle(Arc::new(NetworkServerSharedState {
            server_send,
            lockable: Mutex::new(NetworkServerLockableState {
                shut_down: false,
                slab: Default::default(),
                bind_abort_handles: Default::default(),
            }),
        })))
    }

    /// Get a handle, which can be used directly to bind, or cloned for use elsewhere.
    pub fn handle(&self) -> &NetworkServerHandle {
        &self.0
    }
}

impl NetworkServerHandle {
    /// Bind to an address and open the network server to connections on it.
    ///
    /// Binding happens in the background, retrying with backoff on failure.
    pub fn bind(&self, bind_to: String, rt: &Handle) {
        ws::bind(&self.0, bind_to, rt);
    }
}

impl Connection {
    /// Enqueue an event to be transmitted to the client as a JSON text frame.
    ///
    /// Never blocks. Errors if the connection is already closed. Closure for other reasons
    /// becomes apparent through a `NetworkEvent::RemoveConnection` event.
    pub fn send(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        let frame = serde_json::to_string(&DownFrame { event, payload })?;
        self.0.send(frame)
    }

    /// Kill and disconnect the network connection.
    ///
    /// Never blocks or errors. Triggers a `NetworkEvent::RemoveConnection` event soon, unless
    /// something else killed the connection first. Subsequent sends are dropped. An attempt is
    /// made to gracefully close the websocket, but not to finish transmitting enqueued messages.
    pub fn kill(&self) {
        self.0.kill();
    }
}

#[cfg(test)]
impl Connection {
    /// Construct a connection with no socket behind it. Returns the queue of frames sent on it and
    /// the notify it signals when killed.
    pub(crate) fn detached() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<String>,
        Arc<tokio::sync::Notify>,
    ) {
        let (inner, frames, killed) = ws::Connection::detached();
        (Connection(inner), frames, killed)
    }
}

impl Transport for Connection {
    fn send(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        Connection::send(self, event, payload)
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        // shut down everything upon the main handle being dropped
        let mut lock = self.0.0.lockable.lock();
        for abort_handle in &lock.bind_abort_handles {
            abort_handle.abort();
        }
        lock.shut_down = true;
        for (_, entry) in &lock.slab {
            entry.shutdown();
        }
    }
}

// allocate a connection idx and send an add connection network event in a synchronized way.
// returns none if the whole network server is shutting down, in which case the caller should abort
// and clean itself up.
fn create_conn(
    shared: &NetworkServerSharedState,
    slab_entry: ws::SlabEntry,
    connection: Connection,
) -> Option<usize> {
    let mut lock = shared.lockable.lock();
    if lock.shut_down {
        return None;
    }
    let conn_idx = lock.slab.insert(slab_entry);
    shared.server_send.send(
        ServerEvent::Network(NetworkEvent::AddConnection(conn_idx, connection)),
        EventPriority::Network,
        None,
    );
    Some(conn_idx)
}

// deallocate a connection idx and send a remove connection network event in a synchronized way.
fn destroy_conn(shared: &NetworkServerSharedState, conn_idx: usize) {
    let mut lock = shared.lockable.lock();
    if lock.shut_down {
        // save work, make shutdown faster
        return;
    }
    lock.slab.remove(conn_idx);
    shared.server_send.send(
        ServerEvent::Network(NetworkEvent::RemoveConnection(conn_idx)),
        EventPriority::Network,
        None,
    );
}
