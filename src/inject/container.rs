//! Generated agent containers

use k8s_openapi::api::core::v1::{Container, EnvVar, ResourceRequirements, VolumeMount};

use super::{ServiceAccountToken, INIT_TIMEOUT};
use crate::config::agent::{AgentConfig, ResolvedConfig, AGENT_CONFIG_FILE};
use crate::patch::missing_mounts;
use crate::platform::Platform;
use crate::script::BootstrapScript;
use crate::Result;

/// Environment variable pointing the agent at its config directory
pub const CONFIG_DIR_ENV: &str = "INFISICAL_AGENT_CONFIG_DIR";

/// The two ways the agent runs inside a pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentRole {
    /// Renders secrets once before the application starts
    Init,
    /// Keeps secrets fresh for the lifetime of the pod
    Sidecar,
}

impl AgentRole {
    /// Container name
    pub fn container_name(self) -> &'static str {
        match self {
            Self::Init => crate::INIT_CONTAINER_NAME,
            Self::Sidecar => crate::SIDECAR_CONTAINER_NAME,
        }
    }

    fn exit_after_auth(self) -> bool {
        self == Self::Init
    }

    fn timeout(self) -> Option<std::time::Duration> {
        match self {
            Self::Init => Some(INIT_TIMEOUT),
            Self::Sidecar => None,
        }
    }
}

/// Builds agent containers sharing one resolved configuration
pub(crate) struct ContainerFactory<'a> {
    pub(crate) platform: Platform,
    pub(crate) config: &'a ResolvedConfig,
    pub(crate) service_account: Option<&'a ServiceAccountToken>,
    pub(crate) shared_mounts: &'a [VolumeMount],
    pub(crate) resources: ResourceRequirements,
}

impl ContainerFactory<'_> {
    /// Assemble the container for `role`
    pub(crate) fn build(&self, role: AgentRole) -> Result<Container> {
        let platform = self.platform;
        let config_dir = platform.join(platform.work_dir_mount_path(), "config");
        let config_file = platform.join(&config_dir, AGENT_CONFIG_FILE);

        let token_file = self.service_account.map(|sa| sa.token_file(platform));
        let agent_config = AgentConfig::new(
            self.config,
            role.exit_after_auth(),
            &config_dir,
            token_file.as_deref(),
            platform,
        );
        let config_yaml = agent_config.to_yaml()?;

        let secret_files = self.config.auth.secret_files();
        let script = BootstrapScript {
            platform,
            config_dir: &config_dir,
            config_yaml: &config_yaml,
            secret_files: &secret_files,
            timeout: role.timeout(),
        }
        .render(&config_file)?;

        let mut volume_mounts: Vec<VolumeMount> =
            self.service_account.map(|sa| sa.volume_mount()).into_iter().collect();
        let own = missing_mounts(&volume_mounts, self.shared_mounts);
        volume_mounts.extend(own);

        Ok(Container {
            name: role.container_name().to_string(),
            image: Some(platform.agent_image().to_string()),
            command: Some(platform.shell_command()),
            args: Some(vec![script]),
            env: Some(vec![EnvVar {
                name: CONFIG_DIR_ENV.to_string(),
                value: Some(config_dir),
                ..Default::default()
            }]),
            resources: Some(self.resources.clone()),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, Template};
    use crate::inject::annotations::PodAnnotations;
    use crate::inject::resources::resource_requirements;

    fn resolved() -> ResolvedConfig {
        ResolvedConfig {
            address: "https://app.infisical.com".to_string(),
            auth: AuthMethod::Kubernetes {
                identity_id: "abc".to_string(),
            },
            templates: vec![Template {
                destination_path: "/shared/infisical-secrets".to_string(),
                template_content: "{{ .KEY }}".to_string(),
                ..Default::default()
            }],
            retry_strategy: None,
            cache: None,
            revoke_credentials_on_shutdown: false,
        }
    }

    fn mount(name: &str, path: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        }
    }

    fn service_account() -> ServiceAccountToken {
        ServiceAccountToken {
            volume_name: "kube-api-access".to_string(),
            mount_path: "/var/run/secrets/kubernetes.io/serviceaccount".to_string(),
            token_path: "token".to_string(),
        }
    }

    #[test]
    fn init_container_runs_script_through_shell() {
        let config = resolved();
        let sa = service_account();
        let shared = vec![
            mount("infisical-work-dir", "/home/.infisical-workdir"),
            mount("infisical-secrets", "/shared"),
        ];
        let factory = ContainerFactory {
            platform: Platform::Linux,
            config: &config,
            service_account: Some(&sa),
            shared_mounts: &shared,
            resources: resource_requirements(Platform::Linux, &PodAnnotations::default())
                .unwrap(),
        };

        let container = factory.build(AgentRole::Init).unwrap();

        assert_eq!(container.name, crate::INIT_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some(crate::LINUX_AGENT_IMAGE));
        assert_eq!(
            container.command,
            Some(vec!["/bin/sh".to_string(), "-ec".to_string()])
        );

        let args = container.args.unwrap();
        assert_eq!(args.len(), 1);
        assert!(args[0].contains("timeout 180s"));
        assert!(args[0].contains("exit-after-auth: true"));

        let env = container.env.unwrap();
        assert_eq!(env[0].name, CONFIG_DIR_ENV);
        assert_eq!(env[0].value.as_deref(), Some("/home/.infisical-workdir/config"));

        let mounts = container.volume_mounts.unwrap();
        let paths: Vec<_> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/var/run/secrets/kubernetes.io/serviceaccount",
                "/home/.infisical-workdir",
                "/shared"
            ]
        );
        assert_eq!(mounts[0].read_only, Some(true));
    }

    #[test]
    fn sidecar_keeps_running_and_dedupes_shared_parents() {
        let config = resolved();
        let shared = vec![
            mount("infisical-work-dir", "/home/.infisical-workdir"),
            mount("infisical-secrets-1", "/shared"),
            mount("infisical-secrets-2", "/shared"),
        ];
        let factory = ContainerFactory {
            platform: Platform::Linux,
            config: &config,
            service_account: None,
            shared_mounts: &shared,
            resources: ResourceRequirements::default(),
        };

        let container = factory.build(AgentRole::Sidecar).unwrap();

        assert_eq!(container.name, crate::SIDECAR_CONTAINER_NAME);
        let script = &container.args.unwrap()[0];
        assert!(script.contains("exec infisical agent"));
        assert!(script.contains("exit-after-auth: false"));
        assert_eq!(container.volume_mounts.unwrap().len(), 2);
    }
}
