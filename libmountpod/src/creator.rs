//! Mount pod spec factory.
//!
//! Pure construction: given a workload pod and its bound volume, build the
//! pod specification the reconciler submits to the control plane. No state
//! beyond configuration, no I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::credentials::AuthenticationSource;
use crate::labels::{self, LABEL_CSI_DRIVER_VERSION, LABEL_MOUNTPOINT_VERSION};
use crate::types::{
    Container, NodeAffinity, Pod, PodVolume, PodVolumeSource, PullPolicy, RestartPolicy,
    SecurityContext, Toleration, TolerationOperator, Volume, VolumeMount,
};

/// Volume attribute overriding the service account mount pods run under.
pub const VOLUME_ATTRIBUTE_MOUNT_POD_SERVICE_ACCOUNT: &str = "mountPodServiceAccountName";

/// Configuration for the container running inside spawned mount pods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub command: String,
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: PullPolicy,
}

/// Configuration for spawned mount pods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountPodConfig {
    /// Namespace all mount pods live in. Pods in this namespace are treated
    /// as mount pods by the reconciler.
    pub namespace: String,
    /// Version of the FUSE mount binary in the image, stamped as a label.
    pub mountpoint_version: String,
    /// Version of this driver, stamped as a label.
    pub csi_driver_version: String,
    #[serde(default)]
    pub priority_class_name: String,
    pub container: ContainerConfig,
    /// Non-root UID the mount process runs as.
    pub run_as_user: i64,
}

/// Builds mount pod specifications.
#[derive(Debug, Clone)]
pub struct MountPodFactory {
    config: MountPodConfig,
}

impl MountPodFactory {
    pub fn new(config: MountPodConfig) -> Self {
        Self { config }
    }

    /// Namespace spawned mount pods are placed in.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Build the mount pod spec for `workload` and its bound `volume`.
    ///
    /// The pod is named deterministically from (node, volume) via
    /// [`labels::mount_pod_name`], pinned to the workload's node, and set to
    /// tolerate every taint: wherever the workload could be scheduled, the
    /// mount pod must follow.
    pub fn build(&self, workload: &Pod, volume: &Volume) -> Pod {
        let attrs = volume.attributes();
        let auth_source = AuthenticationSource::from_volume_attributes(attrs);
        let node = workload.node_name.clone();

        let mut pod_labels = labels::selector_for_mount(
            &volume.name,
            auth_source,
            &workload.fs_group_label(),
            &workload.namespace,
            &workload.service_account_name,
        )
        .into_labels();
        pod_labels.insert(
            LABEL_MOUNTPOINT_VERSION.to_owned(),
            self.config.mountpoint_version.clone(),
        );
        pod_labels.insert(
            LABEL_CSI_DRIVER_VERSION.to_owned(),
            self.config.csi_driver_version.clone(),
        );

        let service_account_name = service_account_override(attrs).unwrap_or_default();

        Pod {
            namespace: self.config.namespace.clone(),
            name: labels::mount_pod_name(&node, &volume.name),
            labels: pod_labels,
            node_name: node.clone(),
            service_account_name,
            // The mount process exits zero on a clean unmount; OnFailure
            // keeps the pod from restarting after that.
            restart_policy: RestartPolicy::OnFailure,
            containers: vec![Container {
                name: "mountpoint".to_owned(),
                image: self.config.container.image.clone(),
                image_pull_policy: self.config.container.image_pull_policy,
                command: vec![self.config.container.command.clone()],
                security_context: Some(SecurityContext {
                    run_as_user: Some(self.config.run_as_user),
                    run_as_non_root: true,
                    allow_privilege_escalation: false,
                    drop_all_capabilities: true,
                }),
                volume_mounts: vec![VolumeMount {
                    name: crate::comm::COMMUNICATION_DIR_NAME.to_owned(),
                    mount_path: format!("/{}", crate::comm::COMMUNICATION_DIR_NAME),
                }],
            }],
            node_affinity: Some(NodeAffinity {
                required_node_name: node,
            }),
            tolerations: vec![Toleration {
                key: None,
                operator: TolerationOperator::Exists,
            }],
            volumes: vec![PodVolume {
                name: crate::comm::COMMUNICATION_DIR_NAME.to_owned(),
                source: PodVolumeSource::EmptyDir,
            }],
            priority_class_name: self.config.priority_class_name.clone(),
            ..Default::default()
        }
    }
}

fn service_account_override(attrs: &HashMap<String, String>) -> Option<String> {
    attrs
        .get(VOLUME_ATTRIBUTE_MOUNT_POD_SERVICE_ACCOUNT)
        .filter(|sa| !sa.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::VOLUME_ATTRIBUTE_AUTHENTICATION_SOURCE;
    use crate::labels::{
        LABEL_AUTHENTICATION_SOURCE, LABEL_VOLUME_NAME, LABEL_WORKLOAD_FS_GROUP,
        LABEL_WORKLOAD_NAMESPACE, LABEL_WORKLOAD_SERVICE_ACCOUNT,
    };
    use crate::types::CsiVolumeSource;

    fn factory() -> MountPodFactory {
        MountPodFactory::new(MountPodConfig {
            namespace: "mount-system".into(),
            mountpoint_version: "1.12.0".into(),
            csi_driver_version: "0.1.0".into(),
            priority_class_name: "mount-critical".into(),
            container: ContainerConfig {
                command: "/bin/mount-helper".into(),
                image: "registry.local/mountpoint:1.12.0".into(),
                image_pull_policy: PullPolicy::IfNotPresent,
            },
            run_as_user: 1000,
        })
    }

    fn workload(node: &str) -> Pod {
        Pod {
            namespace: "default".into(),
            name: "web-0".into(),
            node_name: node.into(),
            service_account_name: "web".into(),
            ..Default::default()
        }
    }

    fn volume(name: &str, attrs: &[(&str, &str)]) -> Volume {
        Volume {
            name: name.into(),
            csi: Some(CsiVolumeSource {
                driver: labels::CSI_DRIVER_NAME.into(),
                volume_attributes: attrs
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            }),
            claim_ref: None,
        }
    }

    #[test]
    fn builds_driver_scoped_pod() {
        let pod = factory().build(&workload("node-a"), &volume("pv-123", &[]));

        assert_eq!(pod.namespace, "mount-system");
        assert_eq!(pod.name, labels::mount_pod_name("node-a", "pv-123"));
        assert_eq!(pod.labels.get(LABEL_VOLUME_NAME).unwrap(), "pv-123");
        assert_eq!(pod.labels.get(LABEL_AUTHENTICATION_SOURCE).unwrap(), "driver");
        assert_eq!(pod.labels.get(LABEL_WORKLOAD_FS_GROUP).unwrap(), "");
        assert!(!pod.labels.contains_key(LABEL_WORKLOAD_NAMESPACE));
        assert_eq!(pod.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(
            pod.node_affinity.as_ref().unwrap().required_node_name,
            "node-a"
        );
        assert_eq!(pod.tolerations.len(), 1);
        assert_eq!(pod.tolerations[0].operator, TolerationOperator::Exists);
        assert_eq!(pod.priority_class_name, "mount-critical");
        // No override: the namespace default applies.
        assert_eq!(pod.service_account_name, "");
    }

    #[test]
    fn security_context_is_locked_down() {
        let pod = factory().build(&workload("node-a"), &volume("pv-123", &[]));
        let ctx = pod.containers[0].security_context.as_ref().unwrap();
        assert_eq!(ctx.run_as_user, Some(1000));
        assert!(ctx.run_as_non_root);
        assert!(!ctx.allow_privilege_escalation);
        assert!(ctx.drop_all_capabilities);
    }

    #[test]
    fn communication_volume_is_wired() {
        let pod = factory().build(&workload("node-a"), &volume("pv-123", &[]));
        assert_eq!(pod.volumes.len(), 1);
        assert_eq!(pod.volumes[0].source, PodVolumeSource::EmptyDir);
        assert_eq!(pod.containers[0].volume_mounts[0].mount_path, "/comm");
        assert_eq!(pod.volumes[0].name, pod.containers[0].volume_mounts[0].name);
    }

    #[test]
    fn pod_scoped_identity_adds_workload_labels() {
        let mut wl = workload("node-a");
        wl.fs_group = Some(2000);
        let vol = volume(
            "pv-123",
            &[(VOLUME_ATTRIBUTE_AUTHENTICATION_SOURCE, "pod")],
        );
        let pod = factory().build(&wl, &vol);

        assert_eq!(pod.labels.get(LABEL_AUTHENTICATION_SOURCE).unwrap(), "pod");
        assert_eq!(pod.labels.get(LABEL_WORKLOAD_NAMESPACE).unwrap(), "default");
        assert_eq!(
            pod.labels.get(LABEL_WORKLOAD_SERVICE_ACCOUNT).unwrap(),
            "web"
        );
        assert_eq!(pod.labels.get(LABEL_WORKLOAD_FS_GROUP).unwrap(), "2000");
    }

    #[test]
    fn service_account_override_applies() {
        let vol = volume(
            "pv-123",
            &[(VOLUME_ATTRIBUTE_MOUNT_POD_SERVICE_ACCOUNT, "mounter-sa")],
        );
        let pod = factory().build(&workload("node-a"), &vol);
        assert_eq!(pod.service_account_name, "mounter-sa");
    }

    #[test]
    fn version_labels_are_stamped() {
        let pod = factory().build(&workload("node-a"), &volume("pv-123", &[]));
        assert_eq!(pod.labels.get(LABEL_MOUNTPOINT_VERSION).unwrap(), "1.12.0");
        assert_eq!(pod.labels.get(LABEL_CSI_DRIVER_VERSION).unwrap(), "0.1.0");
    }
}
