// Provider settings
//
// `GlobalSettings` is the persisted shape: a default provider, one
// `ProviderSettings` per backend, and three opaque sections owned by the UI.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

mod repository;
mod store;
pub mod validation;

pub use repository::{FileSettingsRepository, MemorySettingsRepository, SettingsRepository, WatchHandle};
pub use store::{PersistPolicy, Section, SettingsEvent, SettingsStore};
pub use validation::{validate_global, validate_provider, Validation};

/// Settings for a single backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_keyfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_format: Option<String>,
    /// Skip key/keyfile/env and always use OAuth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_enabled: Option<bool>,
    /// Total attempts per request (first try included)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_wait_ms: Option<u64>,
    /// Free-form passthrough fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProviderSettings {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn is_auth_only(&self) -> bool {
        self.auth_only.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced: Option<Value>,
}

impl GlobalSettings {
    /// Look up a value by dotted path, e.g. `providers.openai.model`
    pub fn get(&self, key: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        key.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(&root, |node, segment| node.get(segment))
            .cloned()
    }
}

/// RFC 7396 style merge: objects merge recursively, `null` deletes
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(
                            target_map.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_shape_on_disk() {
        let mut settings = GlobalSettings {
            default_provider: Some("openai".to_string()),
            ..GlobalSettings::default()
        };
        let mut openai = ProviderSettings::enabled();
        openai.model = Some("gpt-4o".to_string());
        openai.extra.insert("organization".to_string(), json!("org-1"));
        settings.providers.insert("openai".to_string(), openai);

        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["defaultProvider"], "openai");
        assert_eq!(value["providers"]["openai"]["model"], "gpt-4o");
        assert_eq!(value["providers"]["openai"]["organization"], "org-1");
        assert!(value["providers"]["openai"].get("apiKey").is_none());

        let back: GlobalSettings = serde_json::from_value(value).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_dotted_get() {
        let mut settings = GlobalSettings::default();
        settings.providers.insert(
            "local".to_string(),
            ProviderSettings {
                base_url: Some("http://127.0.0.1:8080/v1".to_string()),
                ..ProviderSettings::default()
            },
        );
        assert_eq!(
            settings.get("providers.local.baseUrl"),
            Some(json!("http://127.0.0.1:8080/v1"))
        );
        assert_eq!(settings.get("providers.local.model"), None);
        assert_eq!(settings.get("defaultProvider"), None);
    }

    #[test]
    fn test_merge_patch_null_removes() {
        let mut target = json!({"model": "a", "apiKey": "k", "nested": {"x": 1}});
        merge_patch(&mut target, &json!({"apiKey": null, "nested": {"y": 2}}));
        assert_eq!(target, json!({"model": "a", "nested": {"x": 1, "y": 2}}));
    }
}
