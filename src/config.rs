//! Server configuration file.
//!
//! ```toml
//! listen = "127.0.0.1:7878"
//! data_dir = "./data"
//!
//! [store]
//! append_lease_wait_ms = 90000
//!
//! [compaction]
//! summarize_timeout_ms = 60000
//! auto_compact_threshold = 500
//!
//! [server]
//! heartbeat_interval_ms = 15000
//! auth_token = "secret"
//! ```

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_compaction::CompactionConfig;
use tether_log::{StoreConfig, StoreConfigBuilder};
use tether_sync::SyncServerConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Address the WebSocket listener binds to.
    pub listen: String,
    /// Directory holding one JSONL log per session.
    pub data_dir: PathBuf,
    pub store: StoreSection,
    pub compaction: CompactionConfig,
    pub server: SyncServerConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        TetherConfig {
            listen: "127.0.0.1:7878".to_string(),
            data_dir: PathBuf::from("data"),
            store: StoreSection::default(),
            compaction: CompactionConfig::default(),
            server: SyncServerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub append_lease_wait_ms: u64,
    pub event_capacity: usize,
    /// Flush every write to disk before acknowledging it.
    pub fsync: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        let defaults = StoreConfig::default();
        StoreSection {
            append_lease_wait_ms: defaults.append_lease_wait.as_millis() as u64,
            event_capacity: defaults.event_capacity,
            fsync: true,
        }
    }
}

impl StoreSection {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfigBuilder::new()
            .append_lease_wait(Duration::from_millis(self.append_lease_wait_ms))
            .event_capacity(self.event_capacity)
            .build()
    }
}

impl TetherConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the server.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.server.heartbeat_interval_ms > 0,
            "server.heartbeat_interval_ms must be positive"
        );
        ensure!(
            self.server.ack_timeout_ms > 0,
            "server.ack_timeout_ms must be positive"
        );
        ensure!(
            self.compaction.summarize_timeout_ms > 0,
            "compaction.summarize_timeout_ms must be positive"
        );
        Ok(())
    }

    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}
