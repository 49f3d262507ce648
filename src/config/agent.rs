//! The configuration file handed to the agent binary
//!
//! Secrets never appear in this document: auth parameters point at files the
//! bootstrap script writes next to it.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{AuthMethod, CacheConfig, RetryStrategy, Template};
use crate::platform::Platform;
use crate::Result;

/// File name of the serialized agent config inside the config directory
pub const AGENT_CONFIG_FILE: &str = "agent-config.yaml";

/// File the agent writes its access token to
pub const ACCESS_TOKEN_SINK_FILE: &str = "identity-access-token";

/// Configuration after defaults, annotation overrides and validation
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfig {
    /// Backend address
    pub address: String,
    /// Parsed auth method
    pub auth: AuthMethod,
    /// Templates, every one with a destination path
    pub templates: Vec<Template>,
    /// Client retry tuning
    pub retry_strategy: Option<RetryStrategy>,
    /// Cache descriptor
    pub cache: Option<CacheConfig>,
    /// Revoke the token when the sidecar stops
    pub revoke_credentials_on_shutdown: bool,
}

/// Agent configuration document
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentConfig {
    /// Backend settings
    pub infisical: AgentSettings,
    /// Auth type and file-backed parameters
    pub auth: AgentAuth,
    /// Token sinks
    pub sinks: Vec<Sink>,
    /// Templates to render
    pub templates: Vec<Template>,
    /// Cache descriptor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

/// Backend settings
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentSettings {
    /// Backend address
    pub address: String,
    /// Exit after the first successful render (init containers)
    pub exit_after_auth: bool,
    /// Revoke the token on shutdown
    pub revoke_credentials_on_shutdown: bool,
    /// Client retry tuning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
}

/// Auth section
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentAuth {
    /// Auth type
    #[serde(rename = "type")]
    pub kind: String,
    /// Parameter name to file path
    pub config: BTreeMap<String, String>,
}

/// Token sink
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sink {
    /// Sink type
    #[serde(rename = "type")]
    pub kind: String,
    /// Sink settings
    pub config: SinkConfig,
}

/// File sink settings
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SinkConfig {
    /// Destination file
    pub path: String,
}

impl AgentConfig {
    /// Build the document one generated container runs with.
    ///
    /// `service_account_token` is the projected token file, required by
    /// Kubernetes auth.
    pub fn new(
        resolved: &ResolvedConfig,
        exit_after_auth: bool,
        config_dir: &str,
        service_account_token: Option<&str>,
        platform: Platform,
    ) -> Self {
        let mut auth_config: BTreeMap<String, String> = resolved
            .auth
            .secret_files()
            .into_iter()
            .map(|(file, _)| (file.to_string(), platform.join(config_dir, file)))
            .collect();

        if let (AuthMethod::Kubernetes { .. }, Some(token)) =
            (&resolved.auth, service_account_token)
        {
            auth_config.insert("service-account-token".to_string(), token.to_string());
        }

        Self {
            infisical: AgentSettings {
                address: resolved.address.clone(),
                exit_after_auth,
                revoke_credentials_on_shutdown: resolved.revoke_credentials_on_shutdown,
                retry_strategy: resolved.retry_strategy.clone(),
            },
            auth: AgentAuth {
                kind: resolved.auth.type_name().to_string(),
                config: auth_config,
            },
            sinks: vec![Sink {
                kind: "file".to_string(),
                config: SinkConfig {
                    path: platform.join(config_dir, ACCESS_TOKEN_SINK_FILE),
                },
            }],
            templates: resolved.templates.clone(),
            cache: resolved.cache.clone(),
        }
    }

    /// Serialize to the YAML the agent reads
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
