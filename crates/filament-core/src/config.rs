use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable holding a debug endpoint port. When set, the
/// synchronizer binds an HTTP listener exposing queue and index listings.
pub const DEBUG_PORT_ENV: &str = "ANYDEBUG";

/// Top-level storage-core configuration (loaded from filament.toml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilamentConfig {
    pub store: StoreConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the local flat block store
    pub blocks_dir: PathBuf,
    /// RocksDB path for the file index and queues
    pub state_db: PathBuf,
    /// Max concurrently connected remote peers
    pub max_connections: usize,
    /// Capacity of the shared remote task queue
    pub max_tasks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            blocks_dir: PathBuf::from("blocks"),
            state_db: PathBuf::from("state"),
            max_connections: 10,
            max_tasks: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Blocks per BlocksCheck/push batch during upload
    pub batch_size: usize,
    /// Pause between retry-queue passes, in seconds
    pub retry_pause_secs: u64,
    /// Node usage refresh period, in seconds
    pub usage_refresh_secs: u64,
    /// Skip all remote traffic (local-only mode)
    pub local_only: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            retry_pause_secs: 10,
            usage_refresh_secs: 300,
            local_only: false,
        }
    }
}

impl FilamentConfig {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Debug port from the environment, if the variable parses as a port.
    pub fn debug_port() -> Option<u16> {
        std::env::var(DEBUG_PORT_ENV).ok()?.parse().ok()
    }
}
