//! Server configuration, read from a JSON file.

use chunk_data::Position;
use std::{
    path::Path,
    fs::File,
    io::{
        BufReader,
        BufWriter,
    },
    time::Duration,
};
use serde::{Serialize, Deserialize};
use anyhow::*;
use vek::*;


pub const CONFIG_FILE_NAME: &'static str = "server.json";


/// Server configuration. Every field may be omitted from the file, falling back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Wall-clock and simulated length of a tick.
    pub tick_interval_ms: u64,
    /// World units per simulated second a player walks.
    pub player_speed: f64,
    /// Where new players appear.
    pub spawn: Position,
    /// Name of the save file within the saves directory.
    pub save: String,
    pub storage: StorageKind,
    /// Address to accept websocket connections on.
    pub bind: String,
    /// Number of threads doing storage IO.
    pub storage_threads: usize,
    /// Number of consecutive storage failures after which the server stops.
    pub max_storage_failures: u32,
    /// Scripted NPC, if any.
    pub orbit: Option<OrbitConfig>,
}

/// Which storage backend to persist the world through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// The save file.
    Redb,
    /// Nothing outlives the process.
    Memory,
}

/// An NPC which circles around a center point, one radian per simulated second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    pub center: Position,
    pub radius: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            tick_interval_ms: 333,
            player_speed: 20.0,
            spawn: Vec2::new(700.0, 700.0),
            save: "world".into(),
            storage: StorageKind::Redb,
            bind: "127.0.0.1:35566".into(),
            storage_threads: num_cpus::get(),
            max_storage_failures: 5,
            orbit: Some(OrbitConfig::default()),
        }
    }
}

impl Default for OrbitConfig {
    fn default() -> Self {
        OrbitConfig {
            center: Vec2::new(730.0, 650.0),
            radius: 50.0,
        }
    }
}

impl ServerConfig {
    /// Read from the file, or default if absent or invalid.
    pub fn read(path: impl AsRef<Path>) -> Self {
        Self::try_read(path).unwrap_or_default()
    }

    pub fn try_read(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_fields_default() {
        let config: ServerConfig = serde_json::from_str(r#"{
            "tick_interval_ms": 100,
            "storage": "memory",
            "orbit": null
        }"#).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.orbit, None);
        assert_eq!(config.spawn, Vec2::new(700.0, 700.0));
        assert_eq!(config.max_storage_failures, 5);
    }

    #[test]
    fn write_then_read_file() {
        let path = std::env::temp_dir().join(format!("world-server-config-{}.json", uuid::Uuid::new_v4()));
        let mut config = ServerConfig::default();
        config.save = "elsewhere".into();
        config.write(&path).unwrap();
        let read = ServerConfig::read(&path);
        let _ = std::fs::remove_file(&path);
        assert_eq!(read, config);
        assert_eq!(ServerConfig::read(&path), ServerConfig::default());
    }
}
