use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::network::codec::MAX_MESSAGE_SIZE;
use crate::util::errors::{RaftError, Result};

/// Which reactor drives socket readiness for the TCP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PollerType {
    /// `Multi` when more than one CPU is available, `Single` otherwise.
    #[default]
    Auto,
    /// One reactor thread polling every registered socket.
    Single,
    /// Work-stealing reactor spread over all CPUs.
    Multi,
}

impl PollerType {
    pub fn resolve(self) -> PollerType {
        match self {
            PollerType::Auto => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                if cpus > 1 {
                    PollerType::Multi
                } else {
                    PollerType::Single
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encrypt every frame with a key derived from this password
    pub password: Option<String>,

    /// Tick from a background thread; disable to call `tick()` manually
    pub auto_tick: bool,
    pub auto_tick_period_ms: u64,

    /// Capacity of the command queue between submitters and the tick
    pub commands_queue_size: usize,

    /// Larger commands are rejected at submission
    pub max_command_size: usize,

    /// Election timeout is drawn uniformly from [min, max]
    pub raft_min_timeout_ms: u64,
    pub raft_max_timeout_ms: u64,

    /// Interval between AppendEntries (heartbeat) rounds
    pub append_entries_period_ms: u64,

    /// A connection without data for this long is considered dead
    pub connection_timeout_ms: u64,

    /// Interval between connection attempts to offline peers
    pub connection_retry_time_ms: u64,

    /// Pack several entries into one AppendEntries message
    pub append_entries_use_batch: bool,
    pub append_entries_batch_size_bytes: usize,

    pub send_buffer_size: u32,
    pub recv_buffer_size: u32,

    pub dns_cache_time_ms: u64,
    pub dns_fail_cache_time_ms: u64,

    /// Compaction starts once the log holds more than this many entries
    /// and at least `log_compaction_min_time_ms` passed since the last one
    pub log_compaction_min_entries: usize,
    pub log_compaction_min_time_ms: u64,

    /// Each member compacts in its own time window
    pub log_compaction_split: bool,

    /// Max bytes per snapshot chunk sent to a lagging follower
    pub log_compaction_batch_size: usize,

    /// Hold commands until a leader is known instead of failing them
    pub commands_wait_leader: bool,

    pub full_dump_file: Option<PathBuf>,
    pub journal_file: Option<PathBuf>,

    pub bind_retry_time_ms: u64,

    pub dynamic_membership_change: bool,

    pub poller_type: PollerType,

    /// Write full dumps from a background thread instead of the tick
    pub background_serialization: bool,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            RaftError::InvalidConfig(format!("Failed to read config file: {}", e))
        })?;

        let config: Config = toml::from_str(&contents).map_err(|e| {
            RaftError::InvalidConfig(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn auto_tick_period(&self) -> Duration {
        Duration::from_millis(self.auto_tick_period_ms)
    }

    pub fn raft_min_timeout(&self) -> Duration {
        Duration::from_millis(self.raft_min_timeout_ms)
    }

    pub fn raft_max_timeout(&self) -> Duration {
        Duration::from_millis(self.raft_max_timeout_ms)
    }

    pub fn append_entries_period(&self) -> Duration {
        Duration::from_millis(self.append_entries_period_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn connection_retry_time(&self) -> Duration {
        Duration::from_millis(self.connection_retry_time_ms)
    }

    pub fn dns_cache_time(&self) -> Duration {
        Duration::from_millis(self.dns_cache_time_ms)
    }

    pub fn dns_fail_cache_time(&self) -> Duration {
        Duration::from_millis(self.dns_fail_cache_time_ms)
    }

    pub fn log_compaction_min_time(&self) -> Duration {
        Duration::from_millis(self.log_compaction_min_time_ms)
    }

    pub fn bind_retry_time(&self) -> Duration {
        Duration::from_millis(self.bind_retry_time_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(RaftError::InvalidConfig(msg.to_string()));

        if self.auto_tick_period_ms == 0 {
            return invalid("auto_tick_period must be greater than 0");
        }

        if self.append_entries_period_ms == 0 {
            return invalid("append_entries_period must be greater than 0");
        }

        if self.raft_min_timeout_ms <= self.append_entries_period_ms.saturating_mul(3) {
            return invalid("raft_min_timeout must exceed 3 x append_entries_period");
        }

        if self.raft_max_timeout_ms <= self.raft_min_timeout_ms {
            return invalid("raft_max_timeout must be greater than raft_min_timeout");
        }

        if self.connection_timeout_ms < self.raft_max_timeout_ms {
            return invalid("connection_timeout must be at least raft_max_timeout");
        }

        if self.max_command_size == 0 {
            return invalid("max_command_size must be greater than 0");
        }

        // Leaves room for framing so a single entry always fits one message
        if self.max_command_size > MAX_MESSAGE_SIZE / 2 {
            return invalid("max_command_size must fit in a network message");
        }

        if self.append_entries_batch_size_bytes == 0 {
            return invalid("append_entries_batch_size_bytes must be greater than 0");
        }

        if self.send_buffer_size == 0 || self.recv_buffer_size == 0 {
            return invalid("socket buffer sizes must be greater than 0");
        }

        if self.log_compaction_min_entries < 2 {
            return invalid("log_compaction_min_entries must be at least 2");
        }

        if self.log_compaction_min_time_ms == 0 {
            return invalid("log_compaction_min_time must be greater than 0");
        }

        if self.log_compaction_batch_size == 0 {
            return invalid("log_compaction_batch_size must be greater than 0");
        }

        if self.bind_retry_time_ms == 0 {
            return invalid("bind_retry_time must be greater than 0");
        }

        if self.journal_file.is_some() && self.full_dump_file.is_none() {
            return invalid("journal_file requires full_dump_file");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            password: None,
            auto_tick: true,
            auto_tick_period_ms: 50,
            commands_queue_size: 100_000,
            max_command_size: 50_000,
            raft_min_timeout_ms: 400,
            raft_max_timeout_ms: 1400,
            append_entries_period_ms: 100,
            connection_timeout_ms: 3500,
            connection_retry_time_ms: 5000,
            append_entries_use_batch: true,
            append_entries_batch_size_bytes: 1 << 16,
            send_buffer_size: 1 << 16,
            recv_buffer_size: 1 << 16,
            dns_cache_time_ms: 600_000,
            dns_fail_cache_time_ms: 30_000,
            log_compaction_min_entries: 5000,
            log_compaction_min_time_ms: 300_000,
            log_compaction_split: false,
            log_compaction_batch_size: 1 << 16,
            commands_wait_leader: true,
            full_dump_file: None,
            journal_file: None,
            bind_retry_time_ms: 1000,
            dynamic_membership_change: false,
            poller_type: PollerType::Auto,
            background_serialization: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_min_timeout_must_fit_three_heartbeats() {
        let config = Config {
            append_entries_period_ms: 100,
            raft_min_timeout_ms: 300,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn test_huge_heartbeat_period_is_rejected() {
        let config = Config {
            append_entries_period_ms: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn test_max_command_size_bounds() {
        let config = Config {
            max_command_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_command_size: MAX_MESSAGE_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_timeout_must_exceed_min() {
        let config = Config {
            raft_min_timeout_ms: 500,
            raft_max_timeout_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_timeout_covers_election() {
        let config = Config {
            connection_timeout_ms: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compaction_thresholds() {
        let config = Config {
            log_compaction_min_entries: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            log_compaction_min_time_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_size_is_allowed() {
        let config = Config {
            commands_queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_journal_requires_dump_file() {
        let config = Config {
            journal_file: Some(PathBuf::from("journal.bin")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
auto_tick = false
raft_min_timeout_ms = 150
raft_max_timeout_ms = 300
append_entries_period_ms = 40
connection_timeout_ms = 600
poller_type = "single"
journal_file = "data/journal.bin"
full_dump_file = "data/dump.bin"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(!config.auto_tick);
        assert_eq!(config.raft_min_timeout(), Duration::from_millis(150));
        assert_eq!(config.poller_type, PollerType::Single);
        assert_eq!(config.commands_queue_size, 100_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auto_poller_resolves_to_concrete_kind() {
        assert_ne!(PollerType::Auto.resolve(), PollerType::Auto);
        assert_eq!(PollerType::Single.resolve(), PollerType::Single);
    }
}
