//! Mutation planning
//!
//! Turns a pod plus its agent configuration into an [`InjectionPlan`]: the
//! volumes, mounts and containers the pod must end up with. Everything here is
//! pure; comparing the plan against what the pod already has is the job of
//! [`crate::patch`].

pub mod annotations;
pub mod container;
pub mod resources;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};

use crate::config::agent::ResolvedConfig;
use crate::config::{
    AgentConfigMap, AuthMethod, CacheConfig, PersistentCache, RetryStrategy, DEFAULT_ADDRESS,
};
use crate::platform::Platform;
use crate::{Error, Result};

use annotations::PodAnnotations;
use container::{AgentRole, ContainerFactory};

/// In-memory volume shared by the agent containers for config and cache
pub const WORK_DIR_VOLUME: &str = "infisical-work-dir";

/// Name prefix of the volumes holding rendered secrets
pub const SECRETS_VOLUME: &str = "infisical-secrets";

/// Wall-clock limit for the init container's agent run
pub const INIT_TIMEOUT: Duration = Duration::from_secs(180);

const SERVICE_ACCOUNT_MARKER: &str = "serviceaccount";
const SERVICE_ACCOUNT_TOKEN_FILE: &str = "token";

/// Which agent containers are added to the pod
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InjectMode {
    /// One-shot init container
    #[default]
    Init,
    /// Long-lived sidecar
    Sidecar,
    /// Init container followed by a sidecar
    SidecarInit,
}

impl InjectMode {
    /// Read the mode annotation; absent means [`InjectMode::Init`]
    pub fn from_annotations(annotations: &PodAnnotations<'_>) -> Result<Self> {
        annotations
            .get(annotations::INJECT_MODE)
            .map_or(Ok(Self::Init), str::parse)
    }

    /// Whether an init container is injected
    pub fn includes_init(self) -> bool {
        matches!(self, Self::Init | Self::SidecarInit)
    }

    /// Whether a sidecar is injected
    pub fn includes_sidecar(self) -> bool {
        matches!(self, Self::Sidecar | Self::SidecarInit)
    }

    /// Annotation value for this mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Sidecar => "sidecar",
            Self::SidecarInit => "sidecar-init",
        }
    }
}

impl FromStr for InjectMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(Self::Init),
            "sidecar" => Ok(Self::Sidecar),
            "sidecar-init" => Ok(Self::SidecarInit),
            other => Err(Error::validation(format!(
                "invalid inject mode {other}. supported modes are init, sidecar and sidecar-init"
            ))),
        }
    }
}

impl fmt::Display for InjectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Projected service-account token found on an application container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAccountToken {
    /// Volume backing the mount
    pub volume_name: String,
    /// Directory the token is projected into
    pub mount_path: String,
    /// Token file name inside the mount
    pub token_path: String,
}

impl ServiceAccountToken {
    /// First application container mount that looks like a service-account
    /// projection
    pub fn discover(spec: &PodSpec) -> Option<Self> {
        spec.containers
            .iter()
            .flat_map(|c| c.volume_mounts.iter().flatten())
            .find(|m| m.mount_path.contains(SERVICE_ACCOUNT_MARKER))
            .map(|m| Self {
                volume_name: m.name.clone(),
                mount_path: m.mount_path.clone(),
                token_path: SERVICE_ACCOUNT_TOKEN_FILE.to_string(),
            })
    }

    /// Full path of the token file
    pub fn token_file(&self, platform: Platform) -> String {
        platform.join(&self.mount_path, &self.token_path)
    }

    /// Read-only mount of the token volume for agent containers
    pub fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume_name.clone(),
            mount_path: self.mount_path.clone(),
            read_only: Some(true),
            ..Default::default()
        }
    }

    fn check(&self) -> Result<()> {
        let missing = [
            ("name", &self.volume_name),
            ("mount path", &self.mount_path),
            ("token path", &self.token_path),
        ]
        .into_iter()
        .find(|(_, v)| v.is_empty());

        match missing {
            Some((field, _)) => Err(Error::validation(format!(
                "service account token volume {field} is required"
            ))),
            None => Ok(()),
        }
    }
}

/// Target state for one admission
#[derive(Clone, Debug)]
pub struct InjectionPlan {
    /// Detected platform
    pub platform: Platform,
    /// Requested inject mode
    pub mode: InjectMode,
    /// Validated configuration
    pub config: ResolvedConfig,
    /// Volumes the pod must have: work dir first, then one per template
    pub volumes: Vec<Volume>,
    /// Mounts every container gets, before de-duplication by path
    pub shared_mounts: Vec<VolumeMount>,
    /// Generated init container, present in `init` and `sidecar-init` modes
    pub init_container: Option<Container>,
    /// Generated sidecar, present in `sidecar` and `sidecar-init` modes
    pub sidecar: Option<Container>,
    /// Annotations to set on the pod
    pub annotations: BTreeMap<String, String>,
}

/// Validates a pod and its configuration and computes the [`InjectionPlan`]
pub struct MutationPlanner<'a> {
    spec: Option<&'a PodSpec>,
    annotations: PodAnnotations<'a>,
    platform: Platform,
    mode: InjectMode,
    service_account: Option<ServiceAccountToken>,
}

impl<'a> MutationPlanner<'a> {
    /// Read everything the plan depends on from the pod. Fails on an
    /// unsupported inject mode.
    pub fn new(pod: &'a Pod) -> Result<Self> {
        let spec = pod.spec.as_ref();
        let annotations = PodAnnotations::new(pod.metadata.annotations.as_ref());

        Ok(Self {
            spec,
            annotations,
            platform: Platform::detect(spec),
            mode: InjectMode::from_annotations(&annotations)?,
            service_account: spec.and_then(ServiceAccountToken::discover),
        })
    }

    /// Detected platform
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Requested inject mode
    pub fn mode(&self) -> InjectMode {
        self.mode
    }

    /// Validate the configuration against the pod and apply defaults and
    /// annotation overrides.
    pub fn resolve(&self, config: AgentConfigMap) -> Result<ResolvedConfig> {
        let AgentConfigMap {
            infisical,
            mut templates,
            cache,
        } = config;

        let auth = AuthMethod::parse(&infisical.auth)?;

        if matches!(auth, AuthMethod::Kubernetes { .. }) {
            self.require_service_account("kubernetes auth")?.check()?;
        }

        if templates.is_empty() {
            return Err(Error::validation("no templates found in config map"));
        }

        let count = templates.len();
        for (i, template) in templates.iter_mut().enumerate() {
            if template.destination_path.is_empty() {
                template.destination_path = numbered(self.platform.default_destination(), i, count);
            }
            self.platform.validate_destination(&template.destination_path)?;
        }

        self.platform.check_architecture(self.spec)?;

        let revoke_credentials_on_shutdown = infisical.revoke_credentials_on_shutdown
            || self.annotations.is_true(annotations::REVOKE_ON_SHUTDOWN);
        if revoke_credentials_on_shutdown && !self.mode.includes_sidecar() {
            return Err(Error::validation(format!(
                "revoke-credentials-on-shutdown requires a sidecar, inject mode is {}",
                self.mode
            )));
        }

        let retry_strategy = self.retry_strategy(infisical.retry_strategy)?;

        let cache = if self.annotations.is_true(annotations::CACHE_ENABLED) {
            let token = self.require_service_account("agent caching")?;
            Some(CacheConfig {
                persistent: Some(PersistentCache {
                    kind: "kubernetes".to_string(),
                    service_account_token_path: token.token_file(self.platform),
                    path: self.platform.join(self.platform.work_dir_mount_path(), "cache"),
                }),
            })
        } else {
            cache
        };

        let address = match infisical.address.trim() {
            "" => DEFAULT_ADDRESS.to_string(),
            address => address.to_string(),
        };

        Ok(ResolvedConfig {
            address,
            auth,
            templates,
            retry_strategy,
            cache,
            revoke_credentials_on_shutdown,
        })
    }

    /// Resolve the configuration and compute the full target state
    pub fn plan(&self, config: AgentConfigMap) -> Result<InjectionPlan> {
        let config = self.resolve(config)?;

        let count = config.templates.len();
        let mut volumes = vec![Volume {
            name: WORK_DIR_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut shared_mounts = vec![VolumeMount {
            name: WORK_DIR_VOLUME.to_string(),
            mount_path: self.platform.work_dir_mount_path().to_string(),
            ..Default::default()
        }];

        for (i, template) in config.templates.iter().enumerate() {
            let name = numbered(SECRETS_VOLUME, i, count);
            volumes.push(Volume {
                name: name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            shared_mounts.push(VolumeMount {
                name,
                mount_path: self.platform.parent_dir(&template.destination_path),
                ..Default::default()
            });
        }

        let factory = ContainerFactory {
            platform: self.platform,
            config: &config,
            service_account: self.service_account.as_ref(),
            shared_mounts: &shared_mounts,
            resources: resources::resource_requirements(self.platform, &self.annotations)?,
        };

        let init_container = self
            .mode
            .includes_init()
            .then(|| factory.build(AgentRole::Init))
            .transpose()?;
        let sidecar = self
            .mode
            .includes_sidecar()
            .then(|| factory.build(AgentRole::Sidecar))
            .transpose()?;

        Ok(InjectionPlan {
            platform: self.platform,
            mode: self.mode,
            config,
            volumes,
            shared_mounts,
            init_container,
            sidecar,
            annotations: BTreeMap::from([(
                annotations::AGENT_STATUS.to_string(),
                annotations::STATUS_INJECTED.to_string(),
            )]),
        })
    }

    fn require_service_account(&self, feature: &str) -> Result<&ServiceAccountToken> {
        self.service_account.as_ref().ok_or_else(|| {
            Error::validation(format!(
                "service account token volume is required for {feature}"
            ))
        })
    }

    fn retry_strategy(&self, base: Option<RetryStrategy>) -> Result<Option<RetryStrategy>> {
        let max_retries = self.annotations.get(annotations::CLIENT_MAX_RETRIES);
        let base_delay = self.annotations.get(annotations::CLIENT_BASE_DELAY);
        let max_delay = self.annotations.get(annotations::CLIENT_MAX_DELAY);

        if base.is_none() && max_retries.is_none() && base_delay.is_none() && max_delay.is_none()
        {
            return Ok(None);
        }

        let mut strategy = base.unwrap_or_default();

        if let Some(value) = max_retries {
            let parsed = value.parse::<u32>().map_err(|_| {
                Error::validation(format!(
                    "annotation {} must be a non-negative integer, got '{value}'",
                    annotations::CLIENT_MAX_RETRIES
                ))
            })?;
            strategy.max_retries = Some(parsed);
        }
        if let Some(value) = base_delay {
            strategy.base_delay = Some(value.to_string());
        }
        if let Some(value) = max_delay {
            strategy.max_delay = Some(value.to_string());
        }

        strategy.validate()?;
        Ok(Some(strategy))
    }
}

/// `base` for a single item, `base-<n>` (1-based) when there are several
fn numbered(base: &str, index: usize, count: usize) -> String {
    if count > 1 {
        format!("{base}-{}", index + 1)
    } else {
        base.to_string()
    }
}
