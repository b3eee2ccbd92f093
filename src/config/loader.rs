// Configuration loader
// Layers defaults, ~/.switchboard/runtime.toml and SWITCHBOARD_* variables

use anyhow::{Context, Result};
use std::path::Path;

use super::settings::{default_state_dir, Config};

const ENV_PREFIX: &str = "SWITCHBOARD";

/// Load runtime configuration from the default location
pub fn load_config() -> Result<Config> {
    load_config_from(&default_state_dir().join("runtime.toml"))
}

/// Load runtime configuration, reading `path` if it exists
pub fn load_config_from(path: &Path) -> Result<Config> {
    let defaults = Config::default();

    let layered = ::config::Config::builder()
        .set_default(
            "settings_path",
            defaults.settings_path.to_string_lossy().into_owned(),
        )?
        .set_default("log_filter", defaults.log_filter.clone())?
        .set_default("connect_timeout_secs", defaults.connect_timeout_secs)?
        .set_default("stream_idle_timeout_secs", defaults.stream_idle_timeout_secs)?
        .set_default("auth_cache_ttl_secs", defaults.auth_cache_ttl_secs)?
        .set_default("persist_attempts", u64::from(defaults.persist_attempts))?
        .set_default("persist_base_delay_ms", defaults.persist_base_delay_ms)?
        .set_default("persist_timeout_ms", defaults.persist_timeout_ms)?
        .add_source(::config::File::from(path).required(false))
        .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()
        .with_context(|| format!("Failed to read runtime config {}", path.display()))?;

    let config: Config = layered
        .try_deserialize()
        .context("Runtime config has invalid values")?;

    tracing::debug!(settings = %config.settings_path.display(), "runtime config loaded");
    Ok(config)
}
