//! Infisical agent injector - mutating admission webhook for Pods
//!
//! Pods that opt in through annotations get the Infisical agent added as an
//! init container, a sidecar, or both. The agent authenticates against
//! Infisical and renders secrets into shared in-memory volumes the
//! application containers mount.
//!
//! # Request flow
//!
//! Each admission review is handled independently:
//! webhook → config → inject (planning) → script → patch → webhook.
//! Every failure after decoding is fail-open: the pod is admitted unchanged
//! and the reason is returned in the response status.
//!
//! # Modules
//!
//! - [`platform`] - Linux/Windows detection and path semantics
//! - [`config`] - Agent ConfigMap schema, typed auth, and the agent's own config file
//! - [`inject`] - Annotation reading, validation, and the injection plan
//! - [`script`] - Bootstrap scripts run by the agent containers
//! - [`patch`] - JSON Patch generation against the admitted pod
//! - [`webhook`] - HTTP surface (`/mutate`, `/health/ready`)
//! - [`pki`] - Self-signed serving certificate
//! - [`bootstrap`] - CA bundle registration on the webhook configuration
//! - [`retry`] - Bounded retry with a fixed delay
//! - [`error`] - Error types for the injector

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod inject;
pub mod patch;
pub mod pki;
pub mod platform;
pub mod retry;
pub mod script;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default HTTPS port for the webhook listener
pub const DEFAULT_PORT: u16 = 8585;

/// Agent image for Linux pods
pub const LINUX_AGENT_IMAGE: &str = "infisical/cli:0.43.32";

/// Agent image for Windows pods; only amd64 is published
pub const WINDOWS_AGENT_IMAGE: &str = "infisical/cli:0.43.32-windows-amd64";

/// Name of the injected init container
pub const INIT_CONTAINER_NAME: &str = "infisical-agent-init";

/// Name of the injected sidecar container
pub const SIDECAR_CONTAINER_NAME: &str = "infisical-agent";
