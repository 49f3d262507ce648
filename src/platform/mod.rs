//! Target platform of a pod
//!
//! Every Linux/Windows difference (path rules, image, shell, resource
//! baseline) is answered by [`Platform`]; nothing else in the crate branches
//! on the operating system directly.

pub mod path;

use k8s_openapi::api::core::v1::PodSpec;

use crate::{Error, Result};

/// Well-known node label carrying the node operating system
pub const NODE_OS_LABEL: &str = "kubernetes.io/os";

/// Well-known node label carrying the node CPU architecture
pub const NODE_ARCH_LABEL: &str = "kubernetes.io/arch";

/// Operating system the pod will be scheduled on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Platform {
    /// POSIX shell, `/` separators
    #[default]
    Linux,
    /// PowerShell, `\` separators, drive-letter and UNC paths
    Windows,
}

/// Baseline resources for generated containers before annotation overrides
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceDefaults {
    /// CPU limit
    pub cpu_limit: &'static str,
    /// CPU request
    pub cpu_request: &'static str,
    /// Memory limit
    pub memory_limit: &'static str,
    /// Memory request
    pub memory_request: &'static str,
}

impl Platform {
    /// Classify a pod from its explicit OS field, node selector and required
    /// node affinity. Any one signal pointing at Windows is enough.
    pub fn detect(spec: Option<&PodSpec>) -> Self {
        let Some(spec) = spec else {
            return Self::Linux;
        };

        let os_field = spec
            .os
            .as_ref()
            .is_some_and(|os| is_windows(&os.name));

        let node_selector = spec
            .node_selector
            .as_ref()
            .and_then(|s| s.get(NODE_OS_LABEL))
            .is_some_and(|v| is_windows(v));

        let affinity = spec
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
            .is_some_and(|selector| {
                selector.node_selector_terms.iter().any(|term| {
                    term.match_expressions.iter().flatten().any(|expr| {
                        expr.key == NODE_OS_LABEL
                            && expr.operator == "In"
                            && expr.values.iter().flatten().any(|v| is_windows(v))
                    })
                })
            });

        if os_field || node_selector || affinity {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    /// Path separator
    pub fn separator(self) -> char {
        match self {
            Self::Linux => '/',
            Self::Windows => '\\',
        }
    }

    /// Example destination path used in validation messages
    pub fn example_destination(self) -> &'static str {
        match self {
            Self::Linux => "/path/to/destination/secret-file",
            Self::Windows => r"C:\path\to\destination\secret-file",
        }
    }

    /// Destination assigned to templates that leave it empty
    pub fn default_destination(self) -> &'static str {
        match self {
            Self::Linux => "/shared/infisical-secrets",
            Self::Windows => r"C:\shared\infisical-secrets",
        }
    }

    /// Where the shared work-dir volume is mounted
    pub fn work_dir_mount_path(self) -> &'static str {
        match self {
            Self::Linux => "/home/.infisical-workdir",
            Self::Windows => r"C:\.infisical-workdir",
        }
    }

    /// Agent image for this platform
    pub fn agent_image(self) -> &'static str {
        match self {
            Self::Linux => crate::LINUX_AGENT_IMAGE,
            Self::Windows => crate::WINDOWS_AGENT_IMAGE,
        }
    }

    /// Interpreter invocation; the rendered script is passed as the sole argument
    pub fn shell_command(self) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Linux => &["/bin/sh", "-ec"],
            Self::Windows => &["powershell.exe", "-NoProfile", "-NonInteractive", "-Command"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Name of the bootstrap script template
    pub fn script_template(self) -> &'static str {
        match self {
            Self::Linux => "posix.sh.j2",
            Self::Windows => "powershell.ps1.j2",
        }
    }

    /// Resource baseline. Windows containers carry a heavier runtime and are
    /// OOM-killed with the Linux memory defaults.
    pub fn default_resources(self) -> ResourceDefaults {
        match self {
            Self::Linux => ResourceDefaults {
                cpu_limit: "500m",
                cpu_request: "100m",
                memory_limit: "128Mi",
                memory_request: "64Mi",
            },
            Self::Windows => ResourceDefaults {
                cpu_limit: "500m",
                cpu_request: "100m",
                memory_limit: "512Mi",
                memory_request: "256Mi",
            },
        }
    }

    /// Join a directory and a leaf name
    pub fn join(self, base: &str, leaf: &str) -> String {
        path::join(base, leaf, self)
    }

    /// Parent directory of a path
    pub fn parent_dir(self, p: &str) -> String {
        path::parent_dir(p, self)
    }

    /// Check a template destination: absolute, and at least two named
    /// segments deep so the parent is never a filesystem root.
    pub fn validate_destination(self, destination: &str) -> Result<()> {
        let example = self.example_destination();

        if destination.is_empty() {
            return Err(Error::validation("template destination path is required"));
        }

        if !path::is_absolute(destination, self) {
            return Err(Error::validation(format!(
                "template destination path must be an absolute path (e.g. {example})"
            )));
        }

        if path::depth(destination, self) < 2 {
            return Err(Error::validation(format!(
                "template destination path must be a folder (e.g. {example})"
            )));
        }

        Ok(())
    }

    /// Reject Windows pods pinned to an architecture without an agent image
    pub fn check_architecture(self, spec: Option<&PodSpec>) -> Result<()> {
        if self != Self::Windows {
            return Ok(());
        }

        let arch = spec
            .and_then(|s| s.node_selector.as_ref())
            .and_then(|s| s.get(NODE_ARCH_LABEL));

        match arch {
            Some(arch) if arch != "amd64" => Err(Error::validation(format!(
                "windows pods are only supported on amd64 nodes, got {arch}"
            ))),
            _ => Ok(()),
        }
    }
}

fn is_windows(value: &str) -> bool {
    value.eq_ignore_ascii_case("windows")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodOS,
    };
    use std::collections::BTreeMap;

    fn selector(key: &str, value: &str) -> Option<BTreeMap<String, String>> {
        Some(BTreeMap::from([(key.to_string(), value.to_string())]))
    }

    fn affinity(operator: &str, values: &[&str]) -> Option<Affinity> {
        Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: NODE_OS_LABEL.to_string(),
                            operator: operator.to_string(),
                            values: Some(values.iter().map(|v| v.to_string()).collect()),
                        }]),
                        match_fields: None,
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    // ==========================================================================
    // Story: platform detection
    // ==========================================================================

    #[test]
    fn pod_without_hints_is_linux() {
        assert_eq!(Platform::detect(None), Platform::Linux);
        assert_eq!(Platform::detect(Some(&PodSpec::default())), Platform::Linux);
    }

    #[test]
    fn explicit_os_field_selects_windows() {
        let spec = PodSpec {
            os: Some(PodOS {
                name: "windows".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(Platform::detect(Some(&spec)), Platform::Windows);
    }

    #[test]
    fn node_selector_alone_selects_windows() {
        let spec = PodSpec {
            node_selector: selector(NODE_OS_LABEL, "windows"),
            ..Default::default()
        };
        assert_eq!(Platform::detect(Some(&spec)), Platform::Windows);

        let spec = PodSpec {
            node_selector: selector(NODE_OS_LABEL, "linux"),
            ..Default::default()
        };
        assert_eq!(Platform::detect(Some(&spec)), Platform::Linux);
    }

    #[test]
    fn required_affinity_selects_windows_only_with_in_operator() {
        let spec = PodSpec {
            affinity: affinity("In", &["linux", "windows"]),
            ..Default::default()
        };
        assert_eq!(Platform::detect(Some(&spec)), Platform::Windows);

        let spec = PodSpec {
            affinity: affinity("NotIn", &["windows"]),
            ..Default::default()
        };
        assert_eq!(Platform::detect(Some(&spec)), Platform::Linux);
    }

    // ==========================================================================
    // Story: destination validation
    // ==========================================================================

    #[test]
    fn linux_destination_must_be_two_levels_deep() {
        let err = Platform::Linux.validate_destination("/secrets").unwrap_err();
        assert!(err.to_string().contains("must be a folder"));
        assert!(err.to_string().contains("/path/to/destination/secret-file"));

        for root_child in ["/secrets/", "//secrets", "/secrets//"] {
            let err = Platform::Linux.validate_destination(root_child).unwrap_err();
            assert!(err.to_string().contains("must be a folder"), "{root_child}");
        }

        assert!(Platform::Linux
            .validate_destination("/shared/infisical-secrets")
            .is_ok());
    }

    #[test]
    fn linux_destination_must_be_absolute() {
        let err = Platform::Linux
            .validate_destination("shared/infisical-secrets")
            .unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn windows_destination_uses_backslash_rules() {
        let err = Platform::Windows.validate_destination(r"C:\secrets").unwrap_err();
        assert!(err.to_string().contains(r"C:\path\to\destination\secret-file"));

        for root_child in [r"C:\secrets\", r"C:\\secrets", r"\\server\share\secrets"] {
            let err = Platform::Windows.validate_destination(root_child).unwrap_err();
            assert!(err.to_string().contains("must be a folder"), "{root_child}");
        }

        assert!(Platform::Windows
            .validate_destination(r"C:\shared\infisical-secrets")
            .is_ok());
        assert!(Platform::Windows
            .validate_destination("/shared/infisical-secrets")
            .is_err());
    }

    #[test]
    fn empty_destination_is_rejected() {
        let err = Platform::Linux.validate_destination("").unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    // ==========================================================================
    // Story: platform-specific defaults
    // ==========================================================================

    #[test]
    fn windows_gets_more_memory_than_linux() {
        let linux = Platform::Linux.default_resources();
        let windows = Platform::Windows.default_resources();
        assert_eq!(linux.memory_limit, "128Mi");
        assert_eq!(windows.memory_limit, "512Mi");
        assert_eq!(linux.cpu_limit, windows.cpu_limit);
    }

    #[test]
    fn windows_arm_nodes_are_rejected() {
        let spec = PodSpec {
            node_selector: Some(BTreeMap::from([
                (NODE_OS_LABEL.to_string(), "windows".to_string()),
                (NODE_ARCH_LABEL.to_string(), "arm64".to_string()),
            ])),
            ..Default::default()
        };
        assert!(Platform::Windows.check_architecture(Some(&spec)).is_err());
        assert!(Platform::Linux.check_architecture(Some(&spec)).is_ok());
        assert!(Platform::Windows.check_architecture(None).is_ok());
    }
}
