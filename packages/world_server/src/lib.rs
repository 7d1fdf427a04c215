//! Authoritative server for a chunked 2D world.
//!
//! The world is partitioned into square chunks which are loaded on demand from storage. Each
//! connected player is subscribed to the neighborhood of chunks around it, and every tick the
//! server moves players towards their targets, migrates objects between chunks, and pushes each
//! player the changes visible to it.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod logging;
pub mod message;
pub mod server;
pub mod thread_pool;
pub mod util_abort_handle;
