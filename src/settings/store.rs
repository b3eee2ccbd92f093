// Transactional settings store
//
// Every mutation runs the same pipeline under one async mutex:
// merge -> validate -> snapshot -> apply -> persist -> notify, with the
// snapshot restored if apply or persist fails. Reads take the state lock only
// long enough to clone.

use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::repository::{SettingsRepository, WatchHandle};
use super::validation::{validate_global, validate_provider, Validation};
use super::{merge_patch, GlobalSettings, ProviderSettings};
use crate::config::{BackendKind, Config};
use crate::errors::{SettingsError, ValidationIssue};

const EVENT_CAPACITY: usize = 64;

/// How hard to try when writing settings through the repository
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

impl PersistPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.persist_attempts.max(1),
            base_delay: Duration::from_millis(config.persist_base_delay_ms),
            timeout: Duration::from_millis(config.persist_timeout_ms),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Opaque sections passed through to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Ui,
    Telemetry,
    Advanced,
}

impl Section {
    pub fn key(&self) -> &'static str {
        match self {
            Section::Ui => "ui",
            Section::Telemetry => "telemetry",
            Section::Advanced => "advanced",
        }
    }

    fn slot<'a>(&self, settings: &'a mut GlobalSettings) -> &'a mut Option<Value> {
        match self {
            Section::Ui => &mut settings.ui,
            Section::Telemetry => &mut settings.telemetry,
            Section::Advanced => &mut settings.advanced,
        }
    }
}

/// Notifications published by the store
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEvent {
    /// A mutation was committed; `scope` is the provider name, `defaultProvider`,
    /// a section key, or `reload`
    Changed { scope: String },
    /// A mutation failed after validation and was rolled back
    Error { operation: String, message: String },
}

pub struct SettingsStore {
    state: RwLock<GlobalSettings>,
    queue: Mutex<()>,
    repository: Arc<dyn SettingsRepository>,
    events: broadcast::Sender<SettingsEvent>,
    persist: PersistPolicy,
}

impl SettingsStore {
    /// Create a store from whatever the repository currently holds
    pub async fn load(
        repository: Arc<dyn SettingsRepository>,
        persist: PersistPolicy,
    ) -> Result<Self, SettingsError> {
        let initial = repository.load().await?.unwrap_or_default();

        // Invalid persisted values are kept so they can be fixed through the store
        if let Validation::Invalid(issues) = validate_global(&initial) {
            for issue in &issues {
                tracing::warn!("persisted settings issue: {}", issue);
            }
        }

        Ok(Self::with_state(repository, persist, initial))
    }

    pub fn with_state(
        repository: Arc<dyn SettingsRepository>,
        persist: PersistPolicy,
        initial: GlobalSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(initial),
            queue: Mutex::new(()),
            repository,
            events,
            persist,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsEvent> {
        self.events.subscribe()
    }

    /// Copy of the whole settings tree
    pub async fn snapshot(&self) -> GlobalSettings {
        self.state.read().await.clone()
    }

    /// Value at a dotted path, e.g. `providers.openai.model`
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.read().await.get(key)
    }

    /// Settings for one backend, defaulted when nothing is stored yet
    pub async fn provider(&self, kind: BackendKind) -> ProviderSettings {
        self.state
            .read()
            .await
            .providers
            .get(kind.name())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn default_provider(&self) -> Option<BackendKind> {
        self.state
            .read()
            .await
            .default_provider
            .as_deref()
            .and_then(BackendKind::from_name)
    }

    /// Merge `patch` into one provider's settings
    ///
    /// `null` values in the patch remove keys. The merged settings must pass
    /// structural and backend validation before anything changes.
    pub async fn update_settings(&self, provider: &str, patch: Value) -> Result<(), SettingsError> {
        let kind = parse_provider(provider)?;
        let _guard = self.queue.lock().await;

        let current = self.state.read().await.clone();
        let existing = current
            .providers
            .get(kind.name())
            .cloned()
            .unwrap_or_default();
        let merged = merge_provider(kind, &existing, &patch)?;

        if let Validation::Invalid(issues) = validate_provider(kind.name(), &merged) {
            return Err(SettingsError::validation(kind.name(), issues));
        }

        let mut candidate = current;
        candidate.providers.insert(kind.name().to_string(), merged);
        self.commit("update_settings", kind.name(), candidate).await
    }

    /// Set a single provider field
    pub async fn set(&self, provider: &str, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut patch = Map::new();
        patch.insert(key.to_string(), value);
        self.update_settings(provider, Value::Object(patch)).await
    }

    /// Make `name` the default provider
    ///
    /// The target is enabled as part of the switch and must validate in that
    /// state, otherwise nothing changes.
    pub async fn switch_provider(&self, name: &str) -> Result<(), SettingsError> {
        let kind = parse_provider(name)?;
        let _guard = self.queue.lock().await;

        let mut candidate = self.state.read().await.clone();
        let target = candidate
            .providers
            .entry(kind.name().to_string())
            .or_default();
        target.enabled = true;

        if let Validation::Invalid(issues) = validate_provider(kind.name(), target) {
            return Err(SettingsError::validation(kind.name(), issues));
        }

        candidate.default_provider = Some(kind.name().to_string());
        self.commit("switch_provider", "defaultProvider", candidate)
            .await?;
        tracing::info!(provider = kind.name(), "switched default provider");
        Ok(())
    }

    /// Replace an opaque section; `Value::Null` removes it
    pub async fn update_section(&self, section: Section, value: Value) -> Result<(), SettingsError> {
        let _guard = self.queue.lock().await;

        let mut candidate = self.state.read().await.clone();
        *section.slot(&mut candidate) = if value.is_null() { None } else { Some(value) };
        self.commit("update_section", section.key(), candidate).await
    }

    /// Re-read the repository, replacing in-memory state if it validates
    pub async fn reload(&self) -> Result<(), SettingsError> {
        let _guard = self.queue.lock().await;

        let loaded = match self.repository.load().await {
            Ok(loaded) => loaded.unwrap_or_default(),
            Err(e) => {
                self.emit_error("reload", &e.to_string());
                return Err(e.into());
            }
        };

        if let Validation::Invalid(issues) = validate_global(&loaded) {
            return Err(SettingsError::validation("reload", issues));
        }

        {
            let mut state = self.state.write().await;
            if *state == loaded {
                return Ok(());
            }
            *state = loaded;
        }

        tracing::info!("settings reloaded from repository");
        let _ = self.events.send(SettingsEvent::Changed {
            scope: "reload".to_string(),
        });
        Ok(())
    }

    /// Reload whenever the repository reports an external change
    ///
    /// Must be called from within a tokio runtime. The returned handle keeps
    /// the watch alive.
    pub fn watch_external(self: &Arc<Self>) -> Result<WatchHandle, SettingsError> {
        let runtime = tokio::runtime::Handle::current();
        let store: Weak<SettingsStore> = Arc::downgrade(self);

        let handle = self.repository.watch(Arc::new(move || {
            let Some(store) = store.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = store.reload().await {
                    tracing::warn!("ignoring external settings change: {}", e);
                }
            });
        }))?;
        Ok(handle)
    }

    /// Apply, persist and notify; restores the previous state on failure
    ///
    /// Caller must hold the queue lock and have validated `candidate`.
    async fn commit(
        &self,
        operation: &str,
        scope: &str,
        candidate: GlobalSettings,
    ) -> Result<(), SettingsError> {
        let snapshot = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, candidate.clone())
        };

        if let Err(e) = self.persist_with_retry(&candidate).await {
            *self.state.write().await = snapshot;
            tracing::error!(operation, "settings change rolled back: {}", e);
            self.emit_error(operation, &e.to_string());
            return Err(e);
        }

        tracing::debug!(operation, scope, "settings committed");
        let _ = self.events.send(SettingsEvent::Changed {
            scope: scope.to_string(),
        });
        Ok(())
    }

    async fn persist_with_retry(&self, settings: &GlobalSettings) -> Result<(), SettingsError> {
        let attempts = self.persist.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.persist.timeout, self.repository.save(settings)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("save timed out after {:?}", self.persist.timeout)
                }
            }

            if attempt < attempts {
                let delay = self.persist.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    "settings save failed, retrying in {:?}: {}",
                    delay,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(SettingsError::Persistence {
            attempts,
            message: last_error,
        })
    }

    fn emit_error(&self, operation: &str, message: &str) {
        let _ = self.events.send(SettingsEvent::Error {
            operation: operation.to_string(),
            message: message.to_string(),
        });
    }
}

fn parse_provider(name: &str) -> Result<BackendKind, SettingsError> {
    BackendKind::from_name(name).ok_or_else(|| SettingsError::UnknownProvider(name.to_string()))
}

fn merge_provider(
    kind: BackendKind,
    existing: &ProviderSettings,
    patch: &Value,
) -> Result<ProviderSettings, SettingsError> {
    if !patch.is_object() {
        return Err(SettingsError::validation(
            kind.name(),
            vec![ValidationIssue::new("patch", "must be a JSON object")],
        ));
    }

    let mut merged = serde_json::to_value(existing).map_err(|e| {
        SettingsError::validation(kind.name(), vec![ValidationIssue::new("provider", e.to_string())])
    })?;
    merge_patch(&mut merged, patch);

    serde_json::from_value(merged).map_err(|e| {
        SettingsError::validation(kind.name(), vec![ValidationIssue::new("provider", e.to_string())])
    })
}
