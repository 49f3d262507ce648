//! Agent configuration
//!
//! Pods reference a ConfigMap whose `config.yaml` key describes how the
//! injected agent authenticates and which templates it renders. The document
//! is parsed into [`AgentConfigMap`]; the untyped auth parameter map is
//! converted into [`AuthMethod`] once, at validation time, and never leaves
//! this module in its raw form.

pub mod agent;
pub mod source;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use agent::AgentConfig;
pub use source::{ConfigMapSource, ConfigSource};

#[cfg(test)]
pub use source::MockConfigSource;

/// ConfigMap data key holding the configuration document
pub const CONFIG_MAP_KEY: &str = "config.yaml";

/// Backend address used when the document leaves it empty
pub const DEFAULT_ADDRESS: &str = "https://app.infisical.com";

/// Parsed `config.yaml`
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfigMap {
    /// Backend and authentication settings
    #[serde(default)]
    pub infisical: InfisicalSection,
    /// Templates rendered by the agent, in order
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Optional cache descriptor passed through to the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

/// The `infisical` section of the document
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InfisicalSection {
    /// Backend address
    #[serde(default)]
    pub address: String,
    /// Revoke the access token when the sidecar shuts down
    #[serde(default)]
    pub revoke_credentials_on_shutdown: bool,
    /// Authentication descriptor
    #[serde(default)]
    pub auth: RawAuth,
    /// Client retry tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
}

/// Authentication descriptor as written by the user
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RawAuth {
    /// `kubernetes` or `ldap-auth`
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Parameters whose required keys depend on `kind`
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,
}

/// One template the agent renders into a file
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Template {
    /// Template file path inside the agent container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_path: String,
    /// Inline template
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_content: String,
    /// Inline template, base64 encoded
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base64_template_content: String,
    /// File the rendered secret is written to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_path: String,
    /// Rendering options
    #[serde(default, skip_serializing_if = "TemplateOptions::is_empty")]
    pub config: TemplateOptions,
}

/// Per-template rendering options
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TemplateOptions {
    /// How often the agent re-renders the template
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub polling_interval: String,
}

impl TemplateOptions {
    fn is_empty(&self) -> bool {
        self.polling_interval.is_empty()
    }
}

/// Client retry tuning; delays are Go-style duration strings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryStrategy {
    /// Maximum number of retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Initial backoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<String>,
    /// Backoff ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<String>,
}

impl RetryStrategy {
    /// Check both delays parse as durations
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("base-delay", &self.base_delay), ("max-delay", &self.max_delay)] {
            if let Some(value) = value {
                if parse_duration(value).is_none() {
                    return Err(Error::validation(format!(
                        "retry {field} '{value}' is not a valid duration (e.g. 200ms, 5s, 1m30s)"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Agent cache descriptor
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Persistent cache backed by a file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<PersistentCache>,
}

/// Persistent cache settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PersistentCache {
    /// Cache backend type
    #[serde(rename = "type")]
    pub kind: String,
    /// Token used to derive the cache encryption key
    pub service_account_token_path: String,
    /// Cache file location
    pub path: String,
}

/// Authentication method with its required parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// Kubernetes service-account auth
    Kubernetes {
        /// Machine identity ID
        identity_id: String,
    },
    /// LDAP auth
    Ldap {
        /// Machine identity ID
        identity_id: String,
        /// LDAP username
        username: String,
        /// LDAP password
        password: String,
    },
}

impl AuthMethod {
    /// Parse the raw descriptor, rejecting unknown types and missing keys
    pub fn parse(raw: &RawAuth) -> Result<Self> {
        match raw.kind.as_str() {
            "" => Err(Error::validation("auth type is required")),
            "kubernetes" => Ok(Self::Kubernetes {
                identity_id: required_param(raw, "identity-id")?,
            }),
            "ldap-auth" | "ldap" => Ok(Self::Ldap {
                identity_id: required_param(raw, "identity-id")?,
                username: required_param(raw, "username")?,
                password: required_param(raw, "password")?,
            }),
            other => Err(Error::validation(format!(
                "auth type {other} not supported. please use kubernetes or ldap-auth"
            ))),
        }
    }

    /// Type name understood by the agent
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Kubernetes { .. } => "kubernetes",
            Self::Ldap { .. } => "ldap-auth",
        }
    }

    /// Secret values the bootstrap script writes to files, keyed by file name
    pub fn secret_files(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::Kubernetes { identity_id } => vec![("identity-id", identity_id.as_str())],
            Self::Ldap {
                identity_id,
                username,
                password,
            } => vec![
                ("identity-id", identity_id.as_str()),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ],
        }
    }
}

fn required_param(raw: &RawAuth, key: &str) -> Result<String> {
    let value = match raw.config.get(key) {
        Some(serde_yaml::Value::String(s)) => s.trim().to_string(),
        Some(serde_yaml::Value::Number(n)) => n.to_string(),
        Some(serde_yaml::Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    };

    if value.is_empty() {
        return Err(Error::validation(format!(
            "auth config {key} is required for {} auth",
            raw.kind
        )));
    }
    Ok(value)
}

/// Parse the configuration document
pub fn parse_config(yaml: &str) -> Result<AgentConfigMap> {
    serde_yaml::from_str(yaml)
        .map_err(|e| Error::config(format!("failed to parse ConfigMap data: {e}")))
}

/// Parse a Go-style duration string (`300ms`, `1.5h`, `2h45m`).
///
/// A bare `0` is accepted; any other value needs a unit on every component.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s == "0" {
        return Some(Duration::ZERO);
    }
    if s.is_empty() {
        return None;
    }

    let mut rest = s;
    let mut total = 0f64;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    Some(Duration::from_secs_f64(total))
}
