//! JSON Patch generation
//!
//! Compares an [`InjectionPlan`] against the pod as admitted and emits only
//! the operations needed to reach the planned state. Anything already present
//! (a volume with the same name, a mount at the same path, the generated
//! containers, the status annotation) is skipped, so admitting an
//! already-mutated pod produces no patch at all.
//!
//! Arrays that are absent or empty are written with a single `add` of the whole
//! array; otherwise each new item is appended with `add .../-`.

use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation, RemoveOperation};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, VolumeMount};
use serde::Serialize;
use tracing::debug;

use crate::inject::InjectionPlan;
use crate::Result;

/// Mounts from `candidates` whose path is neither in `existing` nor claimed by
/// an earlier candidate
pub fn missing_mounts(existing: &[VolumeMount], candidates: &[VolumeMount]) -> Vec<VolumeMount> {
    let mut staged: Vec<VolumeMount> = Vec::new();

    for mount in candidates {
        let taken = existing
            .iter()
            .chain(staged.iter())
            .any(|m| m.mount_path == mount.mount_path);

        if taken {
            debug!(
                volume = %mount.name,
                path = %mount.mount_path,
                "Volume mount path already in use, skipping"
            );
            continue;
        }
        staged.push(mount.clone());
    }

    staged
}

/// Builds the patch for one pod
pub struct PatchBuilder<'a> {
    pod: &'a Pod,
    spec: Option<&'a PodSpec>,
}

impl<'a> PatchBuilder<'a> {
    /// Builder against the pod as admitted
    pub fn new(pod: &'a Pod) -> Self {
        Self {
            pod,
            spec: pod.spec.as_ref(),
        }
    }

    /// All operations for `plan`, or `None` when the pod already matches it.
    ///
    /// Order: application container mounts, volumes, init containers,
    /// sidecar, annotations.
    pub fn build(&self, plan: &InjectionPlan) -> Result<Option<Patch>> {
        let mut ops = self.container_mounts(plan)?;
        ops.extend(self.volumes(plan)?);
        ops.extend(self.init_containers(plan)?);
        ops.extend(self.sidecar(plan)?);
        ops.extend(self.annotations(plan)?);

        Ok((!ops.is_empty()).then_some(Patch(ops)))
    }

    /// Shared mounts for every existing application container
    pub fn container_mounts(&self, plan: &InjectionPlan) -> Result<Vec<PatchOperation>> {
        let mut ops = Vec::new();

        for (i, container) in self.containers().iter().enumerate() {
            let existing = container.volume_mounts.as_deref().unwrap_or_default();
            let missing = missing_mounts(existing, &plan.shared_mounts);
            let index = i.to_string();

            ops.extend(add_items(
                existing.len(),
                &missing,
                &["spec", "containers", &index, "volumeMounts"],
            )?);
        }

        Ok(ops)
    }

    /// Planned volumes not yet present by name
    pub fn volumes(&self, plan: &InjectionPlan) -> Result<Vec<PatchOperation>> {
        let existing = self
            .spec
            .and_then(|s| s.volumes.as_deref())
            .unwrap_or_default();

        let missing: Vec<_> = plan
            .volumes
            .iter()
            .filter(|v| {
                let present = existing.iter().any(|e| e.name == v.name);
                if present {
                    debug!(volume = %v.name, "Volume already present, skipping");
                }
                !present
            })
            .collect();

        add_items(existing.len(), &missing, &["spec", "volumes"])
    }

    /// Regenerate the init container list with the agent first.
    ///
    /// Skipped when the agent already leads the list. Otherwise the existing
    /// list is removed and re-added as `[agent] + originals`, with any stale
    /// agent copy dropped and the shared mounts added to each original.
    pub fn init_containers(&self, plan: &InjectionPlan) -> Result<Vec<PatchOperation>> {
        let Some(agent) = &plan.init_container else {
            return Ok(Vec::new());
        };

        let existing = self
            .spec
            .and_then(|s| s.init_containers.as_deref())
            .unwrap_or_default();

        if existing.first().is_some_and(|c| c.name == agent.name) {
            debug!(container = %agent.name, "Init container already first, skipping");
            return Ok(Vec::new());
        }

        let mut ops = Vec::new();
        if !existing.is_empty() {
            ops.push(PatchOperation::Remove(RemoveOperation {
                path: PointerBuf::from_tokens(["spec", "initContainers"]),
            }));
        }

        let mut containers = vec![agent.clone()];
        for original in existing.iter().filter(|c| c.name != agent.name) {
            let mut original = original.clone();
            let mounts = original.volume_mounts.get_or_insert_with(Vec::new);
            let missing = missing_mounts(mounts, &plan.shared_mounts);
            mounts.extend(missing);
            containers.push(original);
        }

        ops.extend(add_items(0, &containers, &["spec", "initContainers"])?);
        Ok(ops)
    }

    /// Append the sidecar unless one with the same name exists
    pub fn sidecar(&self, plan: &InjectionPlan) -> Result<Vec<PatchOperation>> {
        let Some(sidecar) = &plan.sidecar else {
            return Ok(Vec::new());
        };

        let existing = self.containers();
        if existing.iter().any(|c| c.name == sidecar.name) {
            debug!(container = %sidecar.name, "Sidecar already present, skipping");
            return Ok(Vec::new());
        }

        add_items(
            existing.len(),
            std::slice::from_ref(sidecar),
            &["spec", "containers"],
        )
    }

    /// Set planned annotations whose value differs from the pod's
    pub fn annotations(&self, plan: &InjectionPlan) -> Result<Vec<PatchOperation>> {
        let existing = self.pod.metadata.annotations.as_ref();

        let changed: BTreeMap<&String, &String> = plan
            .annotations
            .iter()
            .filter(|(k, v)| existing.and_then(|a| a.get(*k)) != Some(*v))
            .collect();

        if changed.is_empty() {
            return Ok(Vec::new());
        }

        if existing.map_or(true, BTreeMap::is_empty) {
            return Ok(vec![PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "annotations"]),
                value: serde_json::to_value(&changed)?,
            })]);
        }

        changed
            .into_iter()
            .map(|(key, value)| {
                Ok(PatchOperation::Add(AddOperation {
                    path: PointerBuf::from_tokens(["metadata", "annotations", key.as_str()]),
                    value: serde_json::Value::String(value.clone()),
                }))
            })
            .collect()
    }

    fn containers(&self) -> &'a [Container] {
        self.spec.map(|s| s.containers.as_slice()).unwrap_or_default()
    }
}

/// One bulk `add` when the target array is empty, otherwise one append per item
fn add_items<T: Serialize>(
    existing_len: usize,
    items: &[T],
    base: &[&str],
) -> Result<Vec<PatchOperation>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    if existing_len == 0 {
        return Ok(vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(base.iter().copied()),
            value: serde_json::to_value(items)?,
        })]);
    }

    items
        .iter()
        .map(|item| {
            Ok(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(base.iter().copied().chain(["-"])),
                value: serde_json::to_value(item)?,
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::inject::{annotations, MutationPlanner};
    use k8s_openapi::api::core::v1::Volume;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const CONFIG: &str = r#"
infisical:
  auth: { type: kubernetes, config: { identity-id: abc } }
templates:
  - destination-path: /shared/one/secret
  - destination-path: /shared/two/secret
"#;

    fn mount(name: &str, path: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        }
    }

    fn pod(mode: &str, volumes: Option<Vec<Volume>>, init: Option<Vec<Container>>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([
                    (annotations::INJECT.to_string(), "true".to_string()),
                    (annotations::INJECT_MODE.to_string(), mode.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    volume_mounts: Some(vec![mount(
                        "kube-api-access",
                        "/var/run/secrets/kubernetes.io/serviceaccount",
                    )]),
                    ..Default::default()
                }],
                volumes,
                init_containers: init,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn plan_for(pod: &Pod) -> InjectionPlan {
        MutationPlanner::new(pod)
            .unwrap()
            .plan(parse_config(CONFIG).unwrap())
            .unwrap()
    }

    fn paths(ops: &[PatchOperation]) -> Vec<String> {
        ops.iter()
            .map(|op| match op {
                PatchOperation::Add(a) => format!("add {}", a.path),
                PatchOperation::Remove(r) => format!("remove {}", r.path),
                other => format!("{other:?}"),
            })
            .collect()
    }

    // ==========================================================================
    // Story: mount de-duplication
    // ==========================================================================

    #[test]
    fn mounts_are_deduplicated_against_existing_and_staged() {
        let existing = vec![mount("data", "/data")];
        let candidates = vec![
            mount("a", "/data"),
            mount("b", "/shared"),
            mount("c", "/shared"),
            mount("d", "/other"),
        ];

        let missing = missing_mounts(&existing, &candidates);
        let names: Vec<_> = missing.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["b", "d"]);
    }

    // ==========================================================================
    // Story: bulk vs incremental adds
    // ==========================================================================

    #[test]
    fn empty_volume_list_gets_one_bulk_add() {
        let pod = pod("init", None, None);
        let plan = plan_for(&pod);
        let ops = PatchBuilder::new(&pod).volumes(&plan).unwrap();

        assert_eq!(ops.len(), 1);
        let PatchOperation::Add(add) = &ops[0] else {
            panic!("expected add");
        };
        assert_eq!(add.path.to_string(), "/spec/volumes");
        assert_eq!(add.value.as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn existing_volume_list_gets_appends() {
        let pod = pod(
            "init",
            Some(vec![Volume {
                name: "kube-api-access".to_string(),
                ..Default::default()
            }]),
            None,
        );
        let plan = plan_for(&pod);
        let ops = PatchBuilder::new(&pod).volumes(&plan).unwrap();

        assert_eq!(
            paths(&ops),
            vec![
                "add /spec/volumes/-",
                "add /spec/volumes/-",
                "add /spec/volumes/-"
            ]
        );
    }

    #[test]
    fn app_container_mounts_are_appended() {
        let pod = pod("init", None, None);
        let plan = plan_for(&pod);
        let ops = PatchBuilder::new(&pod).container_mounts(&plan).unwrap();

        assert_eq!(ops.len(), 3);
        assert!(paths(&ops)
            .iter()
            .all(|p| p == "add /spec/containers/0/volumeMounts/-"));
    }

    // ==========================================================================
    // Story: init container ordering
    // ==========================================================================

    #[test]
    fn init_container_is_added_first_when_list_is_absent() {
        let pod = pod("init", None, None);
        let plan = plan_for(&pod);
        let ops = PatchBuilder::new(&pod).init_containers(&plan).unwrap();

        assert_eq!(paths(&ops), vec!["add /spec/initContainers"]);
    }

    #[test]
    fn existing_init_containers_are_removed_then_readded_behind_agent() {
        let originals = vec![
            Container {
                name: "migrate".to_string(),
                ..Default::default()
            },
            Container {
                name: "warmup".to_string(),
                ..Default::default()
            },
        ];
        let pod = pod("init", None, Some(originals));
        let plan = plan_for(&pod);
        let ops = PatchBuilder::new(&pod).init_containers(&plan).unwrap();

        assert_eq!(
            paths(&ops),
            vec!["remove /spec/initContainers", "add /spec/initContainers"]
        );

        let PatchOperation::Add(add) = &ops[1] else {
            panic!("expected add");
        };
        let names: Vec<_> = add
            .value
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec![crate::INIT_CONTAINER_NAME, "migrate", "warmup"]);
        assert_eq!(add.value[1]["volumeMounts"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn agent_already_first_is_left_alone() {
        let agent = Container {
            name: crate::INIT_CONTAINER_NAME.to_string(),
            ..Default::default()
        };
        let pod = pod("init", None, Some(vec![agent]));
        let plan = plan_for(&pod);

        assert!(PatchBuilder::new(&pod).init_containers(&plan).unwrap().is_empty());
    }

    #[test]
    fn sidecar_mode_appends_to_containers() {
        let pod = pod("sidecar", None, None);
        let plan = plan_for(&pod);
        let builder = PatchBuilder::new(&pod);

        assert!(builder.init_containers(&plan).unwrap().is_empty());
        assert_eq!(paths(&builder.sidecar(&plan).unwrap()), vec!["add /spec/containers/-"]);
    }

    // ==========================================================================
    // Story: annotations
    // ==========================================================================

    #[test]
    fn annotations_are_added_per_key_with_escaping() {
        let pod = pod("init", None, None);
        let plan = plan_for(&pod);
        let ops = PatchBuilder::new(&pod).annotations(&plan).unwrap();

        assert_eq!(
            paths(&ops),
            vec!["add /metadata/annotations/org.infisical.com~1agent-status"]
        );
    }

    #[test]
    fn missing_annotation_map_is_added_whole() {
        let mut pod = pod("init", None, None);
        let plan = plan_for(&pod);
        pod.metadata.annotations = None;

        let ops = PatchBuilder::new(&pod).annotations(&plan).unwrap();
        let PatchOperation::Add(add) = &ops[0] else {
            panic!("expected add");
        };
        assert_eq!(add.path.to_string(), "/metadata/annotations");
        assert_eq!(add.value[annotations::AGENT_STATUS], "injected");
    }

    #[test]
    fn annotation_keys_with_slash_and_tilde_stay_one_segment() {
        let pod = pod("init", None, None);
        let mut plan = plan_for(&pod);
        plan.annotations.insert("example.com/a~b".to_string(), "x".to_string());

        let ops = PatchBuilder::new(&pod).annotations(&plan).unwrap();
        let added: Vec<_> = ops
            .iter()
            .map(|op| match op {
                PatchOperation::Add(add) => add,
                other => panic!("expected add, got {other:?}"),
            })
            .collect();

        let custom = added
            .iter()
            .find(|add| add.value == "x")
            .expect("custom annotation op");
        assert_eq!(custom.path.to_string(), "/metadata/annotations/example.com~1a~0b");
        assert_eq!(custom.path.count(), 3);
        assert_eq!(
            custom.path.last().map(|t| t.decoded().into_owned()).as_deref(),
            Some("example.com/a~b")
        );
    }
}
