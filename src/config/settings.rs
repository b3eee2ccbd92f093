// Runtime configuration structs
//
// Process-level knobs (paths, timeouts, log filter). Per-provider settings
// live in the settings store, not here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the settings repository keeps its JSON file
    pub settings_path: PathBuf,

    /// `tracing` filter used when RUST_LOG is unset
    pub log_filter: String,

    /// TCP connect timeout for provider requests
    pub connect_timeout_secs: u64,

    /// Longest gap between stream chunks before giving up
    pub stream_idle_timeout_secs: u64,

    /// Lifetime of a resolved credential in the auth cache
    pub auth_cache_ttl_secs: u64,

    /// Persistence attempts per settings mutation
    pub persist_attempts: u32,

    /// Base delay between persistence attempts (doubles each retry)
    pub persist_base_delay_ms: u64,

    /// Timeout for a single persistence attempt
    pub persist_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_path: default_state_dir().join("settings.json"),
            log_filter: "info".to_string(),
            connect_timeout_secs: 30,
            stream_idle_timeout_secs: 120,
            auth_cache_ttl_secs: 60,
            persist_attempts: 3,
            persist_base_delay_ms: 100,
            persist_timeout_ms: 5_000,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn auth_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_cache_ttl_secs)
    }
}

/// `~/.switchboard`, or the working directory when there is no home
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}
