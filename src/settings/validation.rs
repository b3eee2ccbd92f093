// Typed settings validation
//
// Validators return a `Validation` value instead of erroring so callers can
// collect every issue at once.

use reqwest::Url;

use super::{GlobalSettings, ProviderSettings};
use crate::config::BackendKind;
use crate::errors::ValidationIssue;
use crate::providers::tool_format::ToolFormat;

const MAX_RETRIES: u32 = 10;

/// Outcome of validating one settings category
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(Vec<ValidationIssue>),
}

impl Validation {
    fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        if issues.is_empty() {
            Validation::Valid
        } else {
            Validation::Invalid(issues)
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Validation::Valid => &[],
            Validation::Invalid(issues) => issues,
        }
    }
}

/// Validate one provider's settings, structural and backend-specific rules
pub fn validate_provider(name: &str, settings: &ProviderSettings) -> Validation {
    let mut issues = Vec::new();

    let Some(kind) = BackendKind::from_name(name) else {
        return Validation::Invalid(vec![ValidationIssue::new(
            "provider",
            format!("'{}' is not a known provider", name),
        )]);
    };

    if let Some(temperature) = settings.temperature {
        if !(0.0..=2.0).contains(&temperature) || temperature.is_nan() {
            issues.push(ValidationIssue::new(
                "temperature",
                "must be between 0 and 2",
            ));
        }
    }

    if settings.max_tokens == Some(0) {
        issues.push(ValidationIssue::new("maxTokens", "must be greater than 0"));
    }

    if let Some(retries) = settings.retries {
        if retries == 0 || retries > MAX_RETRIES {
            issues.push(ValidationIssue::new(
                "retries",
                format!("must be between 1 and {}", MAX_RETRIES),
            ));
        }
    }

    if let Some(key) = &settings.api_key {
        if key.trim().is_empty() {
            issues.push(ValidationIssue::new("apiKey", "must not be blank"));
        }
    }

    if let Some(keyfile) = &settings.api_keyfile {
        if keyfile.trim().is_empty() {
            issues.push(ValidationIssue::new("apiKeyfile", "must not be blank"));
        }
    }

    if let Some(base_url) = &settings.base_url {
        match Url::parse(base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => issues.push(ValidationIssue::new(
                "baseUrl",
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => issues.push(ValidationIssue::new(
                "baseUrl",
                format!("not a valid URL: {}", e),
            )),
        }
    }

    if let Some(format) = &settings.tool_format {
        if ToolFormat::parse(format).is_none() {
            issues.push(ValidationIssue::new(
                "toolFormat",
                format!("unknown tool format '{}'", format),
            ));
        }
    }

    if settings.is_auth_only() && !kind.supports_oauth() {
        issues.push(ValidationIssue::new(
            "authOnly",
            format!("{} does not support OAuth", kind.display_name()),
        ));
    }

    if kind.requires_endpoint() && settings.enabled {
        if settings.base_url.as_deref().map_or(true, |url| url.trim().is_empty()) {
            issues.push(ValidationIssue::new("baseUrl", "required when enabled"));
        }
        if settings.model.as_deref().map_or(true, |model| model.trim().is_empty()) {
            issues.push(ValidationIssue::new("model", "required when enabled"));
        }
    }

    Validation::from_issues(issues)
}

/// Validate the whole settings tree
pub fn validate_global(settings: &GlobalSettings) -> Validation {
    let mut issues = Vec::new();

    if let Some(default) = &settings.default_provider {
        if BackendKind::from_name(default).is_none() {
            issues.push(ValidationIssue::new(
                "defaultProvider",
                format!("'{}' is not a known provider", default),
            ));
        }
    }

    for (name, provider) in &settings.providers {
        for issue in validate_provider(name, provider).issues() {
            issues.push(ValidationIssue::new(
                format!("providers.{}.{}", name, issue.field),
                issue.message.clone(),
            ));
        }
    }

    Validation::from_issues(issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        for kind in [BackendKind::OpenAI, BackendKind::Anthropic, BackendKind::Gemini] {
            assert!(validate_provider(kind.name(), &ProviderSettings::enabled()).is_valid());
        }
    }

    #[test]
    fn test_local_requires_endpoint_when_enabled() {
        let disabled = ProviderSettings::default();
        assert!(validate_provider("local", &disabled).is_valid());

        let result = validate_provider("local", &ProviderSettings::enabled());
        let fields: Vec<_> = result.issues().iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["baseUrl", "model"]);

        let configured = ProviderSettings {
            enabled: true,
            base_url: Some("http://localhost:8080/v1".to_string()),
            model: Some("qwen2.5-coder".to_string()),
            ..ProviderSettings::default()
        };
        assert!(validate_provider("local", &configured).is_valid());
    }

    #[test]
    fn test_range_checks() {
        let settings = ProviderSettings {
            temperature: Some(3.5),
            max_tokens: Some(0),
            retries: Some(0),
            ..ProviderSettings::default()
        };
        let result = validate_provider("openai", &settings);
        assert_eq!(result.issues().len(), 3);
    }

    #[test]
    fn test_base_url_and_tool_format() {
        let settings = ProviderSettings {
            base_url: Some("ftp://example.com".to_string()),
            tool_format: Some("smoke-signals".to_string()),
            ..ProviderSettings::default()
        };
        let result = validate_provider("openai", &settings);
        let fields: Vec<_> = result.issues().iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["baseUrl", "toolFormat"]);
    }

    #[test]
    fn test_auth_only_needs_oauth_support() {
        let settings = ProviderSettings {
            auth_only: Some(true),
            ..ProviderSettings::default()
        };
        assert!(!validate_provider("openai", &settings).is_valid());
        assert!(validate_provider("qwen", &settings).is_valid());
    }

    #[test]
    fn test_global_unknown_names() {
        let mut settings = GlobalSettings {
            default_provider: Some("nope".to_string()),
            ..GlobalSettings::default()
        };
        settings
            .providers
            .insert("mystery".to_string(), ProviderSettings::default());
        let result = validate_global(&settings);
        let fields: Vec<_> = result.issues().iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["defaultProvider", "providers.mystery.provider"]);
    }
}
