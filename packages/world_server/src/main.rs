#[macro_use]
extern crate tracing;

use world_server::{
    config::*,
    logging::init_logging,
    thread_pool::ThreadPool,
    server::{
        channel::*,
        network::NetworkServer,
        save_db::SaveDb,
        storage::{
            Storage,
            MemStorage,
        },
        world::World,
        runner::run,
    },
};
use std::{
    sync::Arc,
    thread,
    env::args,
};
use tokio::runtime::Runtime;
use anyhow::{
    Result,
    Context,
};


const CLI_INTRO: &'static str = r#"World server: chunked world state and tick synchronization."#;

const CLI_HELP: &'static str = r#"
Examples:

    [this command]
    Run the server with options from server.json, or defaults.

    [this command] --save=world --bind=127.0.0.1:35566
    Run the server with explicit options.

    [this command] --config=other.json --memory
    Read options from another file, and keep the world in memory only.

    (Note: Change 127.0.0.1 to 0.0.0.0 to allow connections from other computers).

Env var examples:
    RUST_LOG=world_server=trace
    Changes logging levels"#;


fn main() {
    println!("{}", CLI_INTRO);
    let args = args().collect::<Vec<_>>();
    if args.get(1).map(String::as_str) == Some("--help") {
        println!("{}", CLI_HELP);
        return;
    }
    if let Err(e) = init_logging() {
        eprintln!("error initializing logging: {:?}", e);
    }
    if let Err(e) = run_server_from_cli(&args) {
        error!("server failed: {:?}", e);
        std::process::exit(1);
    }
}

// get the value of a --name= argument
fn arg<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter()
        .filter_map(|arg| arg.strip_prefix(prefix))
        .next()
}

// parse CLI args and run server from that
fn run_server_from_cli(args: &[String]) -> Result<()> {
    let config_path = arg(args, "--config=").unwrap_or(CONFIG_FILE_NAME);
    let mut config = ServerConfig::read(config_path);
    if let Some(save) = arg(args, "--save=") {
        config.save = save.to_owned();
    }
    if let Some(bind) = arg(args, "--bind=") {
        config.bind = bind.to_owned();
    }
    if args.iter().any(|arg| arg == "--memory") {
        config.storage = StorageKind::Memory;
    }
    debug!(?config, "starting server");
    run_server(config)
}

// run server until it stops or fails
fn run_server(config: ServerConfig) -> Result<()> {
    let storage: Arc<dyn Storage> = match config.storage {
        StorageKind::Redb => Arc::new(SaveDb::open(&config.save).context("error opening save file")?),
        StorageKind::Memory => {
            warn!("world is kept in memory only, nothing will be saved");
            Arc::new(MemStorage::new())
        }
    };
    let rt = Runtime::new().context("error creating tokio runtime")?;
    let thread_pool = ThreadPool::with_threads(config.storage_threads);
    let (server_send, server_recv) = channel();
    stop_on_kill(server_send.clone());
    let network_server = NetworkServer::new(server_send.clone());
    network_server.handle().bind(config.bind.clone(), rt.handle());

    let mut world = World::new(&config, storage, thread_pool, server_send, server_recv.clone());
    world.seed(&config).context("error seeding world")?;
    let result = run(world, server_recv);
    drop(network_server);
    result
}

// hook up sigkill to graceful server shutdown
fn stop_on_kill(server_send: ServerSender) {
    let result = ctrlc::set_handler(move || {
        let server_send = server_send.clone();
        // spawn another thread to actually do this to avoid deadlock
        thread::spawn(move || {
            info!("stopping server (process received kill signal)");
            server_send.send_stop();
        });
    });
    if let Err(e) = result {
        warn!(%e, "error setting kill signal handler");
    }
}
