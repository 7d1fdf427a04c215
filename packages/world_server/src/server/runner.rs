//! Running the server.
//!
//! This is the top-level integration layer between server modules.

use crate::server::{
    channel::*,
    conn_mgr::ConnMgr,
    world::World,
    ServerEvent,
};
use anyhow::{
    Result,
    Context,
};


/// Run the server in this thread until it's stopped or fails. Does _not_ run the network server.
///
/// `server_recv` must be the channel the world's chunk loads and the network report to. Errors if
/// the world fails, in which case nothing more is flushed.
pub fn run(mut world: World, server_recv: ServerReceiver) -> Result<()> {
    let mut conn_mgr = ConnMgr::new();

    // enter event loop
    loop {
        // do tick
        world.tick().context("server tick failed")?;
        conn_mgr.poll_logins(&mut world);

        // process events between ticks
        while let Some(event) = server_recv.recv(Some(world.next_tick()), None) {
            match event {
                ServerEvent::Stop => {
                    info!("server stopping (stop requested)");
                    return world.flush().context("final flush failed");
                }
                ServerEvent::Network(event) => {
                    conn_mgr.handle_network_event(&mut world, event);
                }
                ServerEvent::ChunkReady { chunk_id, result } => {
                    world.on_chunk_ready(chunk_id, result)?;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        server::storage::{
            MemStorage,
            Storage,
        },
        thread_pool::ThreadPool,
    };
    use chunk_data::*;
    use std::sync::Arc;

    #[test]
    fn stop_flushes_and_returns() {
        let config = ServerConfig::default();
        let storage = Arc::new(MemStorage::new());
        let (server_send, server_recv) = channel();
        let mut world = World::new(
            &config,
            storage.clone(),
            ThreadPool::with_threads(1),
            server_send.clone(),
            server_recv.clone(),
        );
        world.seed(&config).unwrap();

        server_send.send_stop();
        run(world, server_recv).unwrap();
        assert!(storage.find_object_by_kind(ObjectKind::Npc).unwrap().is_some());
    }
}
