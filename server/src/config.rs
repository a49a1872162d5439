//! Server configuration loaded from TOML, with command-line overrides
//! applied by the binary.

use crate::error::{Result, ServerError};
use crate::processor::Backpressure;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// How a processor reacts when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Wait up to `block_timeout_ms` for a slot.
    Block,
    /// Reject the incoming item.
    DropNewest,
    /// Evict the oldest queued item to make room.
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub name: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queued items across all workers. Never less than one per worker.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_policy")]
    pub policy: QueuePolicy,
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_workers() -> usize {
    1
}

fn default_capacity() -> usize {
    1024
}

fn default_policy() -> QueuePolicy {
    QueuePolicy::Block
}

fn default_block_timeout_ms() -> u64 {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl ProcessorConfig {
    pub fn new(name: &str, workers: usize, capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            name: name.to_string(),
            workers,
            capacity,
            policy,
            block_timeout_ms: default_block_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }

    pub fn backpressure(&self) -> Backpressure {
        match self.policy {
            QueuePolicy::Block => Backpressure::Block(Duration::from_millis(self.block_timeout_ms)),
            QueuePolicy::DropNewest => Backpressure::DropNewest,
            QueuePolicy::DropOldest => Backpressure::DropOldest,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    /// Seconds without any inbound frame before a connection is dropped.
    pub idle_timeout_secs: u64,
    /// Outbound frames buffered per connection.
    pub outbound_queue: usize,
    /// Countdown before halting jobs and processors on shutdown.
    pub drain_delay_secs: u64,
    pub scheduler_grace_ms: u64,
    /// Pending requests the randomness routine will buffer.
    pub random_buffer: usize,
    pub log_level: String,
    pub processors: Vec<ProcessorConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5816,
            max_clients: 1000,
            idle_timeout_secs: 30,
            outbound_queue: 256,
            drain_delay_secs: 5,
            scheduler_grace_ms: 2000,
            random_buffer: 1024,
            log_level: "info".to_string(),
            processors: vec![
                ProcessorConfig::new("server", 4, 4096, QueuePolicy::Block),
                ProcessorConfig::new("world", 1, 1024, QueuePolicy::Block),
                ProcessorConfig::new("log", 1, 1024, QueuePolicy::DropOldest),
            ],
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(raw).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(ServerError::Config("max_clients must be at least 1".into()));
        }
        if self.outbound_queue == 0 || self.random_buffer == 0 {
            return Err(ServerError::Config("queue sizes must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for processor in &self.processors {
            if processor.workers == 0 {
                return Err(ServerError::Config(format!(
                    "processor '{}' needs at least one worker",
                    processor.name
                )));
            }
            if processor.capacity == 0 {
                return Err(ServerError::Config(format!(
                    "processor '{}' needs a capacity of at least one",
                    processor.name
                )));
            }
            if !names.insert(processor.name.as_str()) {
                return Err(ServerError::Config(format!(
                    "processor '{}' declared twice",
                    processor.name
                )));
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_secs(self.drain_delay_secs)
    }

    pub fn scheduler_grace(&self) -> Duration {
        Duration::from_millis(self.scheduler_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = assert_ok!(ServerConfig::from_toml(""));
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.processors.len(), 3);
        assert_eq!(config.bind_address(), "127.0.0.1:5816");
    }

    #[test]
    fn test_processor_tables_parse() {
        let raw = r#"
            port = 9000
            drain_delay_secs = 0

            [[processors]]
            name = "server"
            workers = 8
            capacity = 16
            policy = "block"
            block_timeout_ms = 50

            [[processors]]
            name = "log"
            policy = "drop_newest"
        "#;

        let config = assert_ok!(ServerConfig::from_toml(raw));
        assert_eq!(config.port, 9000);
        assert_eq!(config.drain_delay(), Duration::ZERO);
        assert_eq!(config.processors.len(), 2);

        let server = &config.processors[0];
        assert_eq!(server.workers, 8);
        assert_eq!(server.backpressure(), Backpressure::Block(Duration::from_millis(50)));

        let log = &config.processors[1];
        assert_eq!(log.workers, 1);
        assert_eq!(log.capacity, 1024);
        assert_eq!(log.backpressure(), Backpressure::DropNewest);
    }

    #[test]
    fn test_validation_rejects_bad_processors() {
        let mut config = ServerConfig::default();
        config.processors[0].workers = 0;
        assert_err!(config.validate());

        let mut config = ServerConfig::default();
        config.processors[1].capacity = 0;
        assert_err!(config.validate());

        let mut config = ServerConfig::default();
        config.processors.push(ProcessorConfig::new("world", 1, 1, QueuePolicy::Block));
        assert_err!(config.validate());
    }

    #[test]
    fn test_unknown_policy_is_config_error() {
        let raw = r#"
            [[processors]]
            name = "server"
            policy = "sometimes"
        "#;
        assert!(matches!(ServerConfig::from_toml(raw), Err(ServerError::Config(_))));
    }
}
