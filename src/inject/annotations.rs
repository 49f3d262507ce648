//! Pod annotations read and written by the injector

use std::collections::BTreeMap;

/// Opt-in flag; injection only happens when the value is `"true"`
pub const INJECT: &str = "org.infisical.com/inject";
/// `init`, `sidecar` or `sidecar-init`
pub const INJECT_MODE: &str = "org.infisical.com/inject-mode";
/// Name of the ConfigMap holding the agent configuration
pub const AGENT_CONFIG_MAP: &str = "org.infisical.com/agent-config-map";
/// Written by the injector once a pod has been mutated
pub const AGENT_STATUS: &str = "org.infisical.com/agent-status";
/// Enables the agent's persistent cache
pub const CACHE_ENABLED: &str = "org.infisical.com/agent-cache-enabled";
/// Revoke the access token when the sidecar stops
pub const REVOKE_ON_SHUTDOWN: &str = "org.infisical.com/agent-revoke-on-shutdown";

/// Client retry count override
pub const CLIENT_MAX_RETRIES: &str = "org.infisical.com/agent-client-max-retries";
/// Client initial backoff override
pub const CLIENT_BASE_DELAY: &str = "org.infisical.com/agent-client-base-delay";
/// Client backoff ceiling override
pub const CLIENT_MAX_DELAY: &str = "org.infisical.com/agent-client-max-delay";

/// CPU limit override
pub const LIMITS_CPU: &str = "org.infisical.com/agent-limits-cpu";
/// Memory limit override
pub const LIMITS_MEMORY: &str = "org.infisical.com/agent-limits-memory";
/// Ephemeral storage limit; unset means no limit is emitted
pub const LIMITS_EPHEMERAL: &str = "org.infisical.com/agent-limits-ephemeral";
/// CPU request override
pub const REQUESTS_CPU: &str = "org.infisical.com/agent-requests-cpu";
/// Memory request override
pub const REQUESTS_MEMORY: &str = "org.infisical.com/agent-requests-memory";
/// Ephemeral storage request; unset means no request is emitted
pub const REQUESTS_EPHEMERAL: &str = "org.infisical.com/agent-requests-ephemeral";

/// Value written to [`AGENT_STATUS`]
pub const STATUS_INJECTED: &str = "injected";

/// Read-only view over a pod's annotation map
#[derive(Clone, Copy, Debug, Default)]
pub struct PodAnnotations<'a>(Option<&'a BTreeMap<String, String>>);

impl<'a> PodAnnotations<'a> {
    /// Wrap an optional annotation map
    pub fn new(annotations: Option<&'a BTreeMap<String, String>>) -> Self {
        Self(annotations)
    }

    /// Value of `key`, treating an empty string as absent
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.0
            .and_then(|m| m.get(key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Whether `key` is set to `"true"`
    pub fn is_true(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    /// Whether the pod opted into injection
    pub fn wants_injection(&self) -> bool {
        self.is_true(INJECT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_count_as_absent() {
        let map = BTreeMap::from([
            (INJECT.to_string(), "true".to_string()),
            (INJECT_MODE.to_string(), "  ".to_string()),
        ]);
        let annotations = PodAnnotations::new(Some(&map));

        assert!(annotations.wants_injection());
        assert_eq!(annotations.get(INJECT_MODE), None);
        assert!(!PodAnnotations::new(None).wants_injection());
    }

    #[test]
    fn opt_in_requires_literal_true() {
        let map = BTreeMap::from([(INJECT.to_string(), "yes".to_string())]);
        assert!(!PodAnnotations::new(Some(&map)).wants_injection());
    }
}
