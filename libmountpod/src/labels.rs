//! Labels as a coordination protocol.
//!
//! Mount pod selection between the reconciler, the readiness watcher, and
//! the spec factory is entirely by exact-match label equality. The label set
//! and its matching semantics (a missing label equals the empty string) are
//! an interop contract: every component derives the selector through
//! [`selector_for_mount`] so they cannot diverge.

use sha2::{Digest, Sha224};
use std::collections::BTreeMap;

use crate::credentials::AuthenticationSource;
use crate::types::Pod;

/// The CSI driver identifier volumes must name to be handled by this system.
pub const CSI_DRIVER_NAME: &str = "bucket.csi.rstor.io";

/// Version of the FUSE mount binary baked into the mount pod image.
pub const LABEL_MOUNTPOINT_VERSION: &str = "bucket.csi.rstor.io/mountpoint-version";
/// Version of the driver that spawned the mount pod.
pub const LABEL_CSI_DRIVER_VERSION: &str = "bucket.csi.rstor.io/mounted-by-csi-driver-version";
/// The volume a mount pod serves.
pub const LABEL_VOLUME_NAME: &str = "bucket.csi.rstor.io/volume-name";
/// Credential-resolution strategy of the mount ("driver" or "pod").
pub const LABEL_AUTHENTICATION_SOURCE: &str = "bucket.csi.rstor.io/authentication-source";
/// The requesting workload's `fsGroup` (empty string when unset).
pub const LABEL_WORKLOAD_FS_GROUP: &str = "bucket.csi.rstor.io/workload-pod-fsgroup";
/// Workload namespace; present only for pod-scoped identity.
pub const LABEL_WORKLOAD_NAMESPACE: &str = "bucket.csi.rstor.io/workload-pod-namespace";
/// Workload service account; present only for pod-scoped identity.
pub const LABEL_WORKLOAD_SERVICE_ACCOUNT: &str =
    "bucket.csi.rstor.io/workload-pod-service-account-name";

/// Consistent, unique mount pod name for a (node, volume) pair.
///
/// The derivation is a compatibility contract: two implementations producing
/// different names for the same inputs would spawn duplicate mount pods in a
/// mixed cluster. SHA-224 over the concatenated node and volume names,
/// hex-encoded with an `mp-` prefix.
pub fn mount_pod_name(node_name: &str, volume_name: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(node_name.as_bytes());
    hasher.update(volume_name.as_bytes());
    format!("mp-{}", hex::encode(hasher.finalize()))
}

/// Exact-match label selector identifying one mount pod on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLabelSelector {
    labels: BTreeMap<String, String>,
}

impl PodLabelSelector {
    /// Whether `pod`'s labels satisfy every entry of this selector.
    /// A label missing on the pod matches the empty string, not "unset".
    pub fn matches(&self, pod: &Pod) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| pod.labels.get(k).map(String::as_str).unwrap_or("") == v)
    }

    /// Derive the expectation key for this selector on the given node.
    ///
    /// Format: node name followed by sorted `label=value;` pairs. Stable as
    /// long as the label set is, since the backing map is ordered.
    pub fn expectation_key(&self, node_name: &str) -> String {
        let mut key = String::from(node_name);
        for (k, v) in &self.labels {
            key.push_str(k);
            key.push('=');
            key.push_str(v);
            key.push(';');
        }
        key
    }

    /// The selector's label set, for stamping onto a created mount pod.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn into_labels(self) -> BTreeMap<String, String> {
        self.labels
    }
}

/// Build the identity selector for a mount pod.
///
/// The workload namespace and service account become part of the identity
/// only for pod-scoped credentials, because different service accounts then
/// require separate mount pods with separate tokens.
pub fn selector_for_mount(
    volume_name: &str,
    auth_source: AuthenticationSource,
    fs_group: &str,
    workload_namespace: &str,
    workload_service_account: &str,
) -> PodLabelSelector {
    let mut labels = BTreeMap::from([
        (LABEL_VOLUME_NAME.to_owned(), volume_name.to_owned()),
        (
            LABEL_AUTHENTICATION_SOURCE.to_owned(),
            auth_source.as_label_value().to_owned(),
        ),
        (LABEL_WORKLOAD_FS_GROUP.to_owned(), fs_group.to_owned()),
    ]);

    if auth_source == AuthenticationSource::Pod {
        labels.insert(
            LABEL_WORKLOAD_NAMESPACE.to_owned(),
            workload_namespace.to_owned(),
        );
        labels.insert(
            LABEL_WORKLOAD_SERVICE_ACCOUNT.to_owned(),
            workload_service_account.to_owned(),
        );
    }

    PodLabelSelector { labels }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_selector(volume: &str, fs_group: &str) -> PodLabelSelector {
        selector_for_mount(volume, AuthenticationSource::Driver, fs_group, "", "")
    }

    #[test]
    fn mount_pod_name_is_deterministic() {
        let a = mount_pod_name("node-a", "pv-123");
        let b = mount_pod_name("node-a", "pv-123");
        assert_eq!(a, b);
        assert!(a.starts_with("mp-"));
        // SHA-224 hex digest is 56 chars.
        assert_eq!(a.len(), 3 + 56);
    }

    #[test]
    fn mount_pod_name_differs_per_input() {
        assert_ne!(
            mount_pod_name("node-a", "pv-123"),
            mount_pod_name("node-b", "pv-123")
        );
        assert_ne!(
            mount_pod_name("node-a", "pv-123"),
            mount_pod_name("node-a", "pv-124")
        );
    }

    #[test]
    fn missing_label_matches_empty_string() {
        let selector = driver_selector("pv-1", "");
        let pod = Pod {
            labels: BTreeMap::from([
                (LABEL_VOLUME_NAME.to_owned(), "pv-1".to_owned()),
                (LABEL_AUTHENTICATION_SOURCE.to_owned(), "driver".to_owned()),
                // fsgroup label intentionally absent
            ]),
            ..Default::default()
        };
        assert!(selector.matches(&pod));
    }

    #[test]
    fn selector_rejects_wrong_value() {
        let selector = driver_selector("pv-1", "1000");
        let pod = Pod {
            labels: BTreeMap::from([
                (LABEL_VOLUME_NAME.to_owned(), "pv-1".to_owned()),
                (LABEL_AUTHENTICATION_SOURCE.to_owned(), "driver".to_owned()),
                (LABEL_WORKLOAD_FS_GROUP.to_owned(), "2000".to_owned()),
            ]),
            ..Default::default()
        };
        assert!(!selector.matches(&pod));
    }

    #[test]
    fn pod_scoped_selector_carries_workload_identity() {
        let selector = selector_for_mount(
            "pv-1",
            AuthenticationSource::Pod,
            "",
            "team-ns",
            "uploader",
        );
        assert_eq!(
            selector.labels().get(LABEL_WORKLOAD_NAMESPACE).unwrap(),
            "team-ns"
        );
        assert_eq!(
            selector
                .labels()
                .get(LABEL_WORKLOAD_SERVICE_ACCOUNT)
                .unwrap(),
            "uploader"
        );

        let driver = driver_selector("pv-1", "");
        assert!(!driver.labels().contains_key(LABEL_WORKLOAD_NAMESPACE));
    }

    #[test]
    fn expectation_key_is_sorted_and_stable() {
        let selector = driver_selector("pv-1", "1000");
        let key = selector.expectation_key("node-a");
        assert_eq!(
            key,
            format!(
                "node-a{LABEL_AUTHENTICATION_SOURCE}=driver;\
                 {LABEL_VOLUME_NAME}=pv-1;{LABEL_WORKLOAD_FS_GROUP}=1000;"
            )
        );
        assert_eq!(key, driver_selector("pv-1", "1000").expectation_key("node-a"));
    }
}
