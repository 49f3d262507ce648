//! CA bundle registration
//!
//! The serving certificate is self-signed, so the API server only trusts it
//! once its PEM is written into the `caBundle` of the injector's
//! MutatingWebhookConfiguration. Registration runs in the background after
//! startup and never blocks serving: exhausting its retries is logged and
//! the webhook keeps running with whatever bundle is already registered.
//!
//! # Flow
//!
//! 1. `main` generates the certificate and writes it for the listener
//! 2. `spawn_registration` base64-encodes the PEM and starts a task
//! 3. The task patches every webhook entry, retrying 5 times 2s apart

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation};
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::retry::{retry_with_delay, RetryConfig};
use crate::{Error, Result};

/// Attempts made to register the CA bundle
pub const REGISTRATION_ATTEMPTS: u32 = 5;
/// Fixed delay between registration attempts
pub const REGISTRATION_DELAY: Duration = Duration::from_secs(2);

/// Writes a CA bundle into the cluster's webhook registration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaBundleRegistrar: Send + Sync {
    /// Store `ca_bundle` (base64 of the PEM) on every webhook entry
    async fn register(&self, ca_bundle: &str) -> Result<()>;
}

/// Registrar backed by a MutatingWebhookConfiguration
pub struct WebhookConfigRegistrar {
    client: Client,
    name: String,
}

impl WebhookConfigRegistrar {
    /// Create a registrar for the named configuration
    pub fn new(client: Client, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

#[async_trait]
impl CaBundleRegistrar for WebhookConfigRegistrar {
    async fn register(&self, ca_bundle: &str) -> Result<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());

        let config = api.get(&self.name).await?;
        let count = config.webhooks.as_ref().map_or(0, Vec::len);
        if count == 0 {
            return Err(Error::config(format!(
                "MutatingWebhookConfiguration {} has no webhooks",
                self.name
            )));
        }

        let patch = ca_bundle_patch(count, ca_bundle);
        api.patch(&self.name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;

        info!(config = %self.name, webhooks = count, "Registered CA bundle");
        Ok(())
    }
}

/// JSON Patch setting `clientConfig.caBundle` on the first `count` webhooks
pub fn ca_bundle_patch(count: usize, ca_bundle: &str) -> json_patch::Patch {
    let ops = (0..count)
        .map(|i| {
            let index = i.to_string();
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens([
                    "webhooks",
                    index.as_str(),
                    "clientConfig",
                    "caBundle",
                ]),
                value: serde_json::Value::String(ca_bundle.to_string()),
            })
        })
        .collect();
    json_patch::Patch(ops)
}

/// Register `cert_pem` as the webhook CA bundle, retrying per `retry`
///
/// Returns whether registration succeeded; failure is logged, not raised.
pub async fn register_ca_bundle(
    registrar: &dyn CaBundleRegistrar,
    cert_pem: &str,
    retry: &RetryConfig,
) -> bool {
    let bundle = STANDARD.encode(cert_pem);

    match retry_with_delay(retry, "register_ca_bundle", || registrar.register(&bundle)).await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                error = %e,
                attempts = retry.max_attempts,
                "Giving up on CA bundle registration; API server may not trust the webhook"
            );
            false
        }
    }
}

/// Start background registration with the fixed startup policy
pub fn spawn_registration(
    registrar: Arc<dyn CaBundleRegistrar>,
    cert_pem: String,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let retry = RetryConfig::fixed(REGISTRATION_ATTEMPTS, REGISTRATION_DELAY);
        register_ca_bundle(registrar.as_ref(), &cert_pem, &retry).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn quick_retry() -> RetryConfig {
        RetryConfig::fixed(REGISTRATION_ATTEMPTS, Duration::from_millis(1))
    }

    // ==========================================================================
    // Story Tests: registration is best effort
    // ==========================================================================

    /// Story: the API server accepts the bundle on the first try
    #[tokio::test]
    async fn story_bundle_is_base64_of_the_pem() {
        let mut registrar = MockCaBundleRegistrar::new();
        let expected = STANDARD.encode(PEM);
        registrar
            .expect_register()
            .withf(move |bundle| bundle == expected)
            .times(1)
            .returning(|_| Ok(()));

        assert!(register_ca_bundle(&registrar, PEM, &quick_retry()).await);
    }

    /// Story: the configuration is applied by the chart after the pod starts
    #[tokio::test]
    async fn story_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let mut registrar = MockCaBundleRegistrar::new();
        registrar.expect_register().times(3).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::config("not found"))
            } else {
                Ok(())
            }
        });

        assert!(register_ca_bundle(&registrar, PEM, &quick_retry()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Story: a cluster without the configuration still gets a serving webhook
    #[tokio::test]
    async fn story_exhausted_retries_do_not_fail() {
        let mut registrar = MockCaBundleRegistrar::new();
        registrar
            .expect_register()
            .times(REGISTRATION_ATTEMPTS as usize)
            .returning(|_| Err(Error::config("forbidden")));

        assert!(!register_ca_bundle(&registrar, PEM, &quick_retry()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_registration_uses_fixed_delay() {
        let mut registrar = MockCaBundleRegistrar::new();
        registrar
            .expect_register()
            .times(REGISTRATION_ATTEMPTS as usize)
            .returning(|_| Err(Error::config("forbidden")));

        let started = tokio::time::Instant::now();
        let succeeded = spawn_registration(Arc::new(registrar), PEM.to_string())
            .await
            .unwrap();

        assert!(!succeeded);
        assert!(started.elapsed() >= REGISTRATION_DELAY * (REGISTRATION_ATTEMPTS - 1));
    }

    // ==========================================================================
    // Story Tests: every webhook entry trusts the certificate
    // ==========================================================================

    #[test]
    fn patch_targets_each_webhook() {
        let patch = ca_bundle_patch(2, "Y2E=");
        let value = serde_json::to_value(&patch).unwrap();

        assert_eq!(
            value,
            serde_json::json!([
                {"op": "add", "path": "/webhooks/0/clientConfig/caBundle", "value": "Y2E="},
                {"op": "add", "path": "/webhooks/1/clientConfig/caBundle", "value": "Y2E="},
            ])
        );
    }
}
