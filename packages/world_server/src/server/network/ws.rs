//! Network connection implementation for websocket transport.
//!
//! This is a websocket connection running over TCP. Encryption is not enabled. Only text messages
//! are used, each holding one JSON-encoded `{"event", "payload"}` frame. A client sending anything
//! which doesn't decode as an up message has its connection closed.
//!
//! Internals
//! ---------
//!
//! The bind task accepts TCP streams, and then spawns a new receive task for each stream. The
//! receive task is the only task that generates network events for the connection. The receive
//! task does the ws handshake, creates the connection, and spawns the send task. Once the send
//! task is spawned it is the only task that sends data on the stream.
//!
//! The receive task has associated with it a shared `Notify` that is used to put it into the
//! shutdown state. This can be called from the connection handle if killed, from the network
//! server if dropped, or from the send task if it errors. Upon entering this state, it destroys
//! the connection and uses a second `Notify` to put the send task into its own shutdown state, in
//! which it attempts to gracefully close the websocket connection on a timeout, then dies.
//!
//! Additionally, a bound-length channel is shared between the receive and send tasks for the
//! receive task to convey to the send task pong messages it should send in response to pings.

use super::*;
use std::{
    sync::Once,
    time::Duration,
    convert::Infallible,
    cmp::min,
    future::Future,
};
use tokio::{
    sync::{
        mpsc::{
            Receiver,
            UnboundedSender,
            UnboundedReceiver,
            channel,
            unbounded_channel,
        },
        Notify,
    },
    net::{TcpListener, TcpStream},
    time::{
        Instant,
        sleep,
        timeout,
        timeout_at,
    },
};
use tokio_tungstenite::{
    tungstenite::{
        protocol::{
            frame::{
                coding::CloseCode,
                CloseFrame,
            },
            WebSocketConfig,
        },
        error::Error as TungsteniteError,
        Message,
    },
    accept_async_with_config,
    WebSocketStream,
};
use futures::{
    sink::{Sink, SinkExt},
    stream::StreamExt,
    future::pending,
};
use anyhow::{Error, anyhow};


// 1 MiB. maximum message size we tell the websocket implementation to be willing to receive.
const RECEIVE_LIMIT: usize = 1 << 20;

// exponential backoff parameters for various failures in accepting new TCP connections
const BIND_BACKOFF_MIN: Duration = Duration::from_millis(100);
const BIND_BACKOFF_MAX: Duration = Duration::from_secs(60);

// timeout for the websocket handshake to complete after a TCP connection is established
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

// timeout for attempting to send a close frame on a websocket connection.
const SEND_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

// number of simultaneous ping pong messages the server will buffer for sending back in a response
// before backpressure is triggered on receive from the websocket connection.
const PING_PONG_BUFFER_LIMIT: usize = 10;


// slab entry inner type for websocket connections.
pub(super) struct SlabEntry {
    // notify to put the recv task into the shutdown state
    send_shutdown_recv: Arc<Notify>,
}

impl SlabEntry {
    // called upon network shutdown
    pub(super) fn shutdown(&self) {
        self.send_shutdown_recv.notify_one();
    }
}

// connection inner type for websocket connections
#[derive(Debug, Clone)]
pub(super) struct Connection {
    // sender for queue of encoded frames to send
    send_send: UnboundedSender<String>,
    // notify to put the recv task into the shutdown state
    send_shutdown_recv: Arc<Notify>,
}

// general module-level shared context
struct WsShared {
    // the network server shared state struct
    ns_shared: Arc<NetworkServerSharedState>,
    // handle to the tokio runtime for spawning tasks
    rt: Handle,
}


impl Connection {
    // see outer type
    pub(super) fn send(&self, frame: String) -> Result<(), Error> {
        self.send_send
            .send(frame)
            .map_err(|_| anyhow!("connection closed"))
    }

    // see outer type
    pub(super) fn kill(&self) {
        self.send_shutdown_recv.notify_one();
    }

    // connection with no socket behind it, for tests
    #[cfg(test)]
    pub(super) fn detached() -> (Self, UnboundedReceiver<String>, Arc<Notify>) {
        let (send_send, recv_send) = unbounded_channel();
        let send_shutdown_recv = Arc::new(Notify::new());
        let connection = Connection {
            send_send,
            send_shutdown_recv: Arc::clone(&send_shutdown_recv),
        };
        (connection, recv_send, send_shutdown_recv)
    }
}

// bind to address and start accepting connections on it
pub(super) fn bind(ns_shared: &Arc<NetworkServerSharedState>, bind_to: String, rt: &Handle) {
    let mut lock = ns_shared.lockable.lock();
    if lock.shut_down {
        return;
    }

    // spawn the accept task
    let join_accept = rt.spawn(accept_task(
        Arc::new(WsShared {
            ns_shared: Arc::clone(ns_shared),
            rt: rt.clone(),
        }),
        bind_to,
    ));

    // store its abort handle for when the network server closes
    lock.bind_abort_handles.push(join_accept.abort_handle());
}

// body of the task to bind to the TCP port and start accepting new connections
async fn accept_task(ws_shared: Arc<WsShared>, bind_to: String) {
    // keep trying the inner part
    let mut backoff = BIND_BACKOFF_MIN;
    loop {
        // try until error
        let attempt_start = Instant::now();
        let result = try_accept_task_inner(&ws_shared, &bind_to).await;
        let attempt_elapsed = attempt_start.elapsed();

        // log error
        let e = match result {
            Ok(never) => match never {},
            Err(e) => e,
        };
        error!(%e, %bind_to, "websocket accept task error (retrying in {:.3} s)", backoff.as_secs_f32());

        // backoff sleep
        sleep(backoff).await;

        // increase the backoff, unless the attempt ran for a long time, in which case reset it
        if attempt_elapsed > BIND_BACKOFF_MAX {
            backoff = BIND_BACKOFF_MIN;
        } else {
            backoff = min(backoff * 2, BIND_BACKOFF_MAX);
        }
    }
}

// inner part of the accept task which gets retried if fails
async fn try_accept_task_inner(
    ws_shared: &Arc<WsShared>,
    bind_to: &str,
) -> Result<Infallible, Error> {
    // TCP bind
    let listener = TcpListener::bind(bind_to).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "listening for websocket connections");

    // accept connections
    loop {
        // spawn the receive task for each
        let (tcp, peer) = listener.accept().await?;
        trace!(%peer, "accepted TCP connection");
        ws_shared.rt.spawn(recv_task(Arc::clone(ws_shared), tcp));
    }
}

// body of the receive task for a connection
//
// 1. does the ws handshake
// 2. spawns the corresponding send task
// 3. switches to itself doing the receive loop
async fn recv_task(ws_shared: Arc<WsShared>, tcp: TcpStream) {
    // attempt to disable nagling
    try_denagle(&tcp);

    // attempt to do the ws handshake (with timeout)
    let ws = match try_handshake(tcp).await {
        Some(ws) => ws,
        // if handshake failed, the task can just stop here
        None => return,
    };

    // split this beast in twain and in twixt
    let (ws_send, mut ws_recv) = ws.split();

    // construct channels for communicating with tasks

    // (send/recv)_shutdown_recv tells the recv task to shut down
    let send_shutdown_recv_1 = Arc::new(Notify::new());
    let send_shutdown_recv_2 = Arc::clone(&send_shutdown_recv_1);
    let send_shutdown_recv_3 = Arc::clone(&send_shutdown_recv_1);
    let recv_shutdown_recv = Arc::clone(&send_shutdown_recv_1);
    // (send/recv)_shutdown_send tells the send task to shut down
    let send_shutdown_send = Arc::new(Notify::new());
    let recv_shutdown_send = Arc::clone(&send_shutdown_send);
    // (send/recv)_pong tells the send task to send a pong message
    let (send_pong, recv_pong) = channel(PING_PONG_BUFFER_LIMIT);
    // (send/recv)_send tells the send task to send an application message
    let (send_send, recv_send) = unbounded_channel();

    // create the connection
    let conn_idx = create_conn(
        &ws_shared.ns_shared,
        SlabEntry { send_shutdown_recv: send_shutdown_recv_1 },
        super::Connection(Connection {
            send_send,
            send_shutdown_recv: send_shutdown_recv_2,
        }),
    );
    let conn_idx = match conn_idx {
        Some(conn_idx) => conn_idx,
        // this case happens if the whole network server is shutting down. just drop everything.
        None => return,
    };

    // spawn the send task
    ws_shared.rt.spawn(send_task(
        ws_send,
        send_shutdown_recv_3,
        recv_shutdown_send,
        recv_pong,
        recv_send,
    ));

    // enter receive task event loop, break loop when connection should be shut down
    loop {
        // try to receive a message, break loop if told to shut down
        let result = tokio::select! {
            biased;
            _ = recv_shutdown_recv.notified() => break,
            result = ws_recv.next() => result,
        };

        // try to extract ok result, log and break loop on error or end of stream
        let msg = match result {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                trace!(%e, "ws error receiving message (killing connection)");
                break;
            }
            None => break,
        };

        // try to extract application message
        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(payload) => {
                // in the event of a ping, try to tell the send task to send a pong
                tokio::select! {
                    _ = send_pong.send(payload) => (),
                    // but if gets blocked on ping-pong buffer backpressure, and then told to shut
                    // down while still blocking on that, break loop
                    _ = recv_shutdown_recv.notified() => break,
                };

                // upon successfully forwarding ping pong, continue loop
                continue;
            }
            Message::Pong(_) => continue,
            // if connection closed on ws level, break loop
            Message::Close(_) => break,
            // if any other type of message received, break loop
            _ => {
                trace!("invalid ws msg type received (killing connection)");
                break;
            }
        };

        // try to decode up msg, on error log and break loop
        let msg: UpMsg = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%e, conn_idx, "error decoding up msg (killing connection)");
                break;
            }
        };

        // finally, we can send the received message to the server loop
        ws_shared.ns_shared.server_send.send(
            ServerEvent::Network(NetworkEvent::Message(conn_idx, msg)),
            EventPriority::Network,
            None,
        );
    }

    // loop is broken, so shut down connection
    drop(ws_recv);
    send_shutdown_send.notify_one();
    destroy_conn(&ws_shared.ns_shared, conn_idx);
}

// body of the send task for a connection
async fn send_task<W: Sink<Message, Error=TungsteniteError> + Unpin>(
    mut ws_send: W,
    send_shutdown_recv: Arc<Notify>,
    shutdown_send: Arc<Notify>,
    mut recv_pong: Receiver<Vec<u8>>,
    mut recv_send: UnboundedReceiver<String>,
) {
    // enter send task event loop
    loop {
        // determine what message we should send, or early return
        let msg = tokio::select! {
            biased;
            // send task was told to shut down by recv task
            _ = shutdown_send.notified() => {
                try_close(&mut ws_send, None).await;
                return;
            },
            // respond to a ping with a pong
            payload = some_or_pending(recv_pong.recv()) => Message::Pong(payload),
            // send already-encoded frame
            frame = some_or_pending(recv_send.recv()) => Message::Text(frame),
        };

        // try to send the message
        tokio::select! {
            result = ws_send.send(msg) => {
                if let Err(e) = result {
                    // if encounter error sending it, kill the connection
                    trace!(%e, "ws error sending message (killing connection)");
                    send_shutdown_recv.notify_one();
                    return;
                }
            }
            // if send task told to shut down by recv task while waiting for message to send, then
            // shut down.
            _ = shutdown_send.notified() => {
                try_close(&mut ws_send, None).await;
                return;
            }
        }
    }
}

// wrapper around a future option that resolves to the some value or pends forever
async fn some_or_pending<T, F: Future<Output=Option<T>>>(option: F) -> T {
    match option.await {
        Some(t) => t,
        None => pending().await,
    }
}

// attempt to disable nagling, log error on failure
fn try_denagle(tcp: &TcpStream) {
    if let Err(e) = tcp.set_nodelay(true) {
        static WARN_DENAGLE_FAILED: Once = Once::new();
        WARN_DENAGLE_FAILED.call_once(|| warn!(%e, "failed to disable nagling"));
    }
}

// attempt to do a ws handshake on the TCP stream with a timeout, logging failure
async fn try_handshake(tcp: TcpStream) -> Option<WebSocketStream<TcpStream>> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let config = WebSocketConfig {
        max_message_size: Some(RECEIVE_LIMIT),
        ..Default::default()
    };
    match timeout_at(deadline, accept_async_with_config(tcp, Some(config))).await {
        Ok(Ok(ws)) => Some(ws),
        Ok(Err(e)) => {
            trace!(%e, "ws-level handshake error");
            None
        }
        Err(_) => {
            trace!("ws handshake timeout");
            None
        }
    }
}

// attempt to elegantly close a websocket connection by sending a close message, with a timeout. if
// `reason` is given it will be sent in a close frame to the client.
async fn try_close<W>(ws: &mut W, reason: Option<&'static str>)
where
    W: Sink<Message, Error=TungsteniteError> + Unpin,
{
    trace!(?reason, "sending ws close frame");
    let close_frame = reason
        .map(|reason| CloseFrame {
            code: CloseCode::Invalid,
            reason: reason.into(),
        });
    match timeout(SEND_CLOSE_TIMEOUT, ws.send(Message::Close(close_frame))).await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => trace!(%e, "error sending close frame"),
        Err(_) => trace!("timeout sending close frame"),
    }
}
