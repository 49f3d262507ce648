//! Fetching the referenced configuration object

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use super::{parse_config, AgentConfigMap, CONFIG_MAP_KEY};
use crate::{Error, Result};

/// Source of agent configuration documents.
///
/// Abstracts the ConfigMap read so admission handling can be tested without
/// an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load and parse the named configuration object from a namespace
    async fn fetch(&self, namespace: &str, name: &str) -> Result<AgentConfigMap>;
}

/// Reads configuration from a ConfigMap's `config.yaml` key
pub struct ConfigMapSource {
    client: Client,
}

impl ConfigMapSource {
    /// Create a source backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigSource for ConfigMapSource {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<AgentConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        let config_map = api.get(name).await.map_err(|e| {
            Error::config(format!(
                "failed to get ConfigMap {name} in namespace {namespace}: {e}"
            ))
        })?;

        let document = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(CONFIG_MAP_KEY))
            .ok_or_else(|| {
                Error::config(format!(
                    "ConfigMap {name} in namespace {namespace} has no {CONFIG_MAP_KEY} key"
                ))
            })?;

        debug!(config_map = %name, namespace = %namespace, "Loaded agent configuration");
        parse_config(document)
    }
}
