// Runtime context
//
// Everything a provider needs, passed explicitly: runtime config, the settings
// store, the credential resolver and a shared HTTP client.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::auth::AuthPrecedenceResolver;
use crate::config::Config;
use crate::settings::{
    FileSettingsRepository, MemorySettingsRepository, PersistPolicy, SettingsRepository,
    SettingsStore,
};

#[derive(Clone)]
pub struct RuntimeContext {
    pub config: Arc<Config>,
    pub settings: Arc<SettingsStore>,
    pub auth: Arc<AuthPrecedenceResolver>,
    pub http: reqwest::Client,
}

impl RuntimeContext {
    /// Settings from the JSON file named in `config`
    pub async fn initialize(config: Config) -> Result<Self> {
        let repository: Arc<dyn SettingsRepository> =
            Arc::new(FileSettingsRepository::new(config.settings_path.clone()));
        let settings = SettingsStore::load(repository, PersistPolicy::from_config(&config))
            .await
            .with_context(|| {
                format!("Failed to load settings from {}", config.settings_path.display())
            })?;
        let settings = Arc::new(settings);

        let auth = Arc::new(AuthPrecedenceResolver::new(
            Arc::clone(&settings),
            config.auth_cache_ttl(),
        ));

        tracing::debug!(path = %config.settings_path.display(), "runtime initialized");
        Self::from_parts(config, settings, auth)
    }

    /// Assemble from pre-built parts, e.g. a resolver with an OAuth manager
    pub fn from_parts(
        config: Config,
        settings: Arc<SettingsStore>,
        auth: Arc<AuthPrecedenceResolver>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            settings,
            auth,
            http,
        })
    }

    /// Default config with settings held in memory only
    pub async fn in_memory() -> Result<Self> {
        let config = Config::default();
        let settings = Arc::new(SettingsStore::with_state(
            Arc::new(MemorySettingsRepository::new()),
            PersistPolicy::from_config(&config),
            Default::default(),
        ));
        let auth = Arc::new(AuthPrecedenceResolver::new(
            Arc::clone(&settings),
            config.auth_cache_ttl(),
        ));
        Self::from_parts(config, settings, auth)
    }
}
