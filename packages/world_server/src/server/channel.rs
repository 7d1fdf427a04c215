//! Channel for sending events to the server loop.

use crate::{
    util_abort_handle::AbortHandle,
    server::ServerEvent,
};
use std::{
    time::Instant,
    sync::Arc,
};
use parking_lot::{Mutex, Condvar};
use crossbeam::queue::SegQueue;


/// Priority level. Variants decrease in priority.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(usize)]
pub enum EventPriority {
    /// Results of storage jobs. The tick may block on these alone while leaving everything else
    /// queued.
    Storage = 0,
    /// Control events, sent to the server from some sort of administrative context.
    Control = 1,
    /// Messages received from the network.
    Network = 2,
}

// number of priority levels
const LEVELS: usize = 3;


/// Create the channel for sending events to the server loop.
///
/// The server consists of the primary "server thread" loop, which owns the world and spends its
/// time ticking, sleeping, and processing events, and asynchronous helper systems (the storage
/// thread pool and the tokio network tasks) which send their results back to the server in the
/// form of events. This channel is the means by which those events arrive.
///
/// Beyond a stock mpsc implementation, this channel supports:
///
/// - Different priority levels for events, and the ability to poll only for events of a certain
///   priority or higher.
/// - The ability to associate with a sent event an abort handle such that whether the event was
///   aborted is checked upon receipt and discarded if so.
///
/// Within a priority level, event delivery is FIFO.
pub fn channel() -> (ServerSender, ServerReceiver) {
    let state_0 = Arc::new(State::default());
    let state_1 = Arc::clone(&state_0);
    (ServerSender(state_0), ServerReceiver(state_1))
}

/// Sending half of server event channel.
#[derive(Clone)]
pub struct ServerSender(Arc<State>);

/// Receiving half of server event channel.
#[derive(Clone)]
pub struct ServerReceiver(Arc<State>);

// channel inner state
#[derive(Default)]
struct State {
    // queue for each priority level
    queues: [SegQueue<InnerMsg>; LEVELS],
    // mutex to track the size of each queue
    sizes: Mutex<[usize; LEVELS]>,
    // condvar to monitor changes to sizes
    sizes_cvar: Condvar,
}

// internal message sent across queue
struct InnerMsg {
    event: ServerEvent,
    aborted: Option<AbortHandle>,
}

impl ServerSender {
    /// Send an event on the given priority level.
    ///
    /// If `aborted` is provided, the receiver will discard the event upon taking from the queue
    /// if it has been marked as aborted when taken from the queue.
    pub fn send(&self, event: ServerEvent, priority: EventPriority, aborted: Option<AbortHandle>) {
        self.0.queues[priority as usize].push(InnerMsg { event, aborted });
        self.0.sizes.lock()[priority as usize] += 1;
        self.0.sizes_cvar.notify_all();
    }

    /// Send a stop control event.
    pub fn send_stop(&self) {
        self.send(ServerEvent::Stop, EventPriority::Control, None);
    }
}

impl ServerReceiver {
    /// Attempt to receive an event.
    ///
    /// Higher priority events will be taken before lower priority ones.
    ///
    /// If `block_until` is provided, may block until that instant if waiting for event to become
    /// available. Otherwise, will never block.
    ///
    /// If `priority_lteq` is provided, will only take events with priority less than or equal to
    /// that value (as in, of that priority or a greater priority, since the ordering is
    /// backwards).
    pub fn recv(
        &self,
        block_until: Option<Instant>,
        priority_lteq: Option<EventPriority>,
    ) -> Option<ServerEvent> {
        self.recv_inner(Deadline::from(block_until), priority_lteq)
    }

    /// Block until an event of the given priority or higher arrives.
    pub fn recv_blocking(&self, priority_lteq: EventPriority) -> ServerEvent {
        loop {
            if let Some(event) = self.recv_inner(Deadline::Never, Some(priority_lteq)) {
                return event;
            }
        }
    }

    fn recv_inner(
        &self,
        deadline: Deadline,
        priority_lteq: Option<EventPriority>,
    ) -> Option<ServerEvent> {
        let bound = priority_lteq.map(|p| p as usize + 1).unwrap_or(LEVELS);
        loop {
            let mut sizes = self.0.sizes.lock();
            let found = loop {
                if let Some(found) = (0..bound).find(|&i| sizes[i] > 0) {
                    break found;
                }
                match deadline {
                    Deadline::Now => return None,
                    Deadline::At(deadline) => {
                        if self.0.sizes_cvar.wait_until(&mut sizes, deadline).timed_out() {
                            return None;
                        }
                    }
                    Deadline::Never => self.0.sizes_cvar.wait(&mut sizes),
                }
            };
            sizes[found] -= 1;
            drop(sizes);

            // counted after being pushed, so this is there
            let InnerMsg { event, aborted } = match self.0.queues[found].pop() {
                Some(msg) => msg,
                None => continue,
            };
            if aborted.map(|aborted| !aborted.is_aborted()).unwrap_or(true) {
                return Some(event)
            }
            trace!("discarding aborted server event");
        }
    }
}

// how long a receive may block
#[derive(Copy, Clone)]
enum Deadline {
    Now,
    At(Instant),
    Never,
}

impl From<Option<Instant>> for Deadline {
    fn from(block_until: Option<Instant>) -> Self {
        block_until.map(Deadline::At).unwrap_or(Deadline::Now)
    }
}
