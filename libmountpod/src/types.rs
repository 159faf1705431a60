//! Cluster data model: pods, volume claims, volumes, and provisioning
//! parameters.
//!
//! These types mirror the subset of the orchestration platform's API objects
//! that the reconciler, watcher, and mounter need.  They are all
//! [`Serialize`]/[`Deserialize`] so they can travel through whatever cluster
//! transport feeds the [`crate::cluster::ClusterClient`] implementation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// Pod identity
// ---------------------------------------------------------------------------

/// Namespaced identity of a pod, the unit a reconciliation request refers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Pod> for PodRef {
    fn from(pod: &Pod) -> Self {
        Self::new(pod.namespace.clone(), pod.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Pod lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Restart policy for a pod's containers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Always,
    /// Restart only on non-zero exit codes.
    OnFailure,
    Never,
}

/// Image pull policy for a container.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PullPolicy {
    #[default]
    IfNotPresent,
    Always,
    Never,
}

// ---------------------------------------------------------------------------
// Pod spec pieces
// ---------------------------------------------------------------------------

/// A single container in a pod spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: PullPolicy,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub security_context: Option<SecurityContext>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Container-level security settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityContext {
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_non_root: bool,
    #[serde(default)]
    pub allow_privilege_escalation: bool,
    #[serde(default)]
    pub drop_all_capabilities: bool,
}

/// Mount of a pod volume into a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// A volume declared in a pod spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodVolume {
    pub name: String,
    pub source: PodVolumeSource,
}

/// Backing source of a [`PodVolume`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodVolumeSource {
    /// A node-local scratch directory shared between the pod and the node
    /// agent.
    EmptyDir,
    /// A reference to a [`VolumeClaim`] in the pod's namespace.
    Claim { claim_name: String },
}

/// Hard scheduling constraint pinning a pod to one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAffinity {
    pub required_node_name: String,
}

/// Taint toleration carried by a pod spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Toleration {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: TolerationOperator,
}

/// Operator used when matching a [`Toleration`] against taints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TolerationOperator {
    #[default]
    Equal,
    /// Matches any taint; with an empty key it tolerates everything.
    Exists,
}

// ---------------------------------------------------------------------------
// Pod
// ---------------------------------------------------------------------------

/// A pod as observed (or created) through the cluster API.
///
/// Both workload pods and mount pods use this one type; which role a pod
/// plays is decided by its namespace, the same way the reconciler decides it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    /// Unique identifier assigned by the control plane at creation time.
    /// Empty on a pod spec that has not been submitted yet.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Node this pod is scheduled to; empty while unscheduled.
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub service_account_name: String,
    /// The pod-level `fsGroup` from the workload's security context.
    #[serde(default)]
    pub fs_group: Option<i64>,
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub priority_class_name: String,
    #[serde(default)]
    pub phase: PodPhase,
    /// Set once the control plane has scheduled the pod for termination.
    #[serde(default)]
    pub deletion_requested: bool,
    /// Free-form status detail, populated for `Failed` pods.
    #[serde(default)]
    pub status_reason: String,
}

impl Pod {
    /// Whether this pod is still active: not terminated and not scheduled
    /// for termination.
    pub fn is_active(&self) -> bool {
        self.phase != PodPhase::Succeeded
            && self.phase != PodPhase::Failed
            && !self.deletion_requested
    }

    /// The `fsGroup` rendered the way it appears in mount pod labels:
    /// the decimal value, or the empty string when unset.
    pub fn fs_group_label(&self) -> String {
        self.fs_group.map(|g| g.to_string()).unwrap_or_default()
    }

    pub fn pod_ref(&self) -> PodRef {
        PodRef::from(self)
    }
}

// ---------------------------------------------------------------------------
// Volume claims and volumes
// ---------------------------------------------------------------------------

/// Binding phase of a [`VolumeClaim`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

/// A workload's claim on a volume. A claim is usable only once it is `Bound`
/// and names a volume whose own `claim_ref` points back at it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub phase: ClaimPhase,
    /// The bound volume's name; empty until binding completes.
    #[serde(default)]
    pub volume_name: String,
}

/// Back-reference from a [`Volume`] to the claim it is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
}

/// CSI-backed source of a [`Volume`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsiVolumeSource {
    /// Driver identifier; only volumes naming this system's driver are ours.
    pub driver: String,
    #[serde(default)]
    pub volume_attributes: HashMap<String, String>,
}

/// A provisioned volume object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub csi: Option<CsiVolumeSource>,
    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,
}

impl Volume {
    /// Volume attributes of the CSI source. Always returns a map, even when
    /// the volume has no CSI source at all.
    pub fn attributes(&self) -> &HashMap<String, String> {
        static EMPTY: std::sync::OnceLock<HashMap<String, String>> = std::sync::OnceLock::new();
        match &self.csi {
            Some(csi) => &csi.volume_attributes,
            None => EMPTY.get_or_init(HashMap::new),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning parameters (storage-class boundary)
// ---------------------------------------------------------------------------

/// Storage-class parameter: whether the provisioner should create a bucket.
pub const PARAM_CREATE_BUCKET: &str = "createBucket";
/// Storage-class parameter: one bucket per volume, or a shared bucket.
pub const PARAM_UNIQUE_BUCKET_PER_VOLUME: &str = "uniqueBucketPerVolume";
/// Storage-class parameter: prefix prepended to generated bucket names.
pub const PARAM_BUCKET_NAME_PREFIX: &str = "bucketNamePrefix";
/// Storage-class parameter: prefix paths with claim namespace/name for
/// isolation inside a shared bucket.
pub const PARAM_ENABLE_CLAIM_PATH_ISOLATION: &str = "enableClaimPathIsolation";
/// Storage-class parameter: the bucket resource template passed through to
/// the bucket provisioner.
pub const PARAM_BUCKET_DEFINITION: &str = "bucketDefinition";

/// Validated storage-class parameters consumed at provisioning time.
///
/// The bucket provisioner itself is an external collaborator; this type only
/// validates and carries the parameters across that boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisioningParameters {
    pub create_bucket: bool,
    pub unique_bucket_per_volume: bool,
    pub bucket_name_prefix: Option<String>,
    pub enable_claim_path_isolation: bool,
    pub bucket_definition: Option<String>,
}

impl Default for ProvisioningParameters {
    fn default() -> Self {
        Self {
            create_bucket: true,
            unique_bucket_per_volume: true,
            bucket_name_prefix: None,
            enable_claim_path_isolation: false,
            bucket_definition: None,
        }
    }
}

impl ProvisioningParameters {
    /// Parse and validate raw storage-class parameters.
    pub fn parse(params: &HashMap<String, String>) -> Result<Self, crate::error::Error> {
        let mut out = Self::default();
        if let Some(v) = params.get(PARAM_CREATE_BUCKET) {
            out.create_bucket = parse_bool(PARAM_CREATE_BUCKET, v)?;
        }
        if let Some(v) = params.get(PARAM_UNIQUE_BUCKET_PER_VOLUME) {
            out.unique_bucket_per_volume = parse_bool(PARAM_UNIQUE_BUCKET_PER_VOLUME, v)?;
        }
        if let Some(v) = params.get(PARAM_ENABLE_CLAIM_PATH_ISOLATION) {
            out.enable_claim_path_isolation = parse_bool(PARAM_ENABLE_CLAIM_PATH_ISOLATION, v)?;
        }
        if let Some(v) = params.get(PARAM_BUCKET_NAME_PREFIX)
            && !v.is_empty()
        {
            out.bucket_name_prefix = Some(v.clone());
        }
        if let Some(v) = params.get(PARAM_BUCKET_DEFINITION)
            && !v.is_empty()
        {
            out.bucket_definition = Some(v.clone());
        }
        Ok(out)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, crate::error::Error> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(crate::error::Error::InvalidArgument(format!(
            "parameter {key} must be \"true\" or \"false\", got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_ref_display() {
        let r = PodRef::new("default", "web-0");
        assert_eq!(r.to_string(), "default/web-0");
    }

    #[test]
    fn pod_activity() {
        let mut pod = Pod::default();
        assert!(pod.is_active());

        pod.deletion_requested = true;
        assert!(!pod.is_active());

        pod.deletion_requested = false;
        pod.phase = PodPhase::Succeeded;
        assert!(!pod.is_active());

        pod.phase = PodPhase::Failed;
        assert!(!pod.is_active());
    }

    #[test]
    fn fs_group_label_rendering() {
        let mut pod = Pod::default();
        assert_eq!(pod.fs_group_label(), "");

        pod.fs_group = Some(2000);
        assert_eq!(pod.fs_group_label(), "2000");
    }

    #[test]
    fn volume_attributes_never_nil() {
        let vol = Volume::default();
        assert!(vol.attributes().is_empty());

        let vol = Volume {
            name: "pv-1".into(),
            csi: Some(CsiVolumeSource {
                driver: "x".into(),
                volume_attributes: HashMap::from([("a".into(), "b".into())]),
            }),
            claim_ref: None,
        };
        assert_eq!(vol.attributes().get("a").map(String::as_str), Some("b"));
    }

    #[test]
    fn pod_serde_roundtrip() {
        let pod = Pod {
            namespace: "default".into(),
            name: "web-0".into(),
            uid: "abc".into(),
            node_name: "node-a".into(),
            fs_group: Some(1000),
            volumes: vec![PodVolume {
                name: "data".into(),
                source: PodVolumeSource::Claim {
                    claim_name: "data-claim".into(),
                },
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&pod).expect("serialize");
        let de: Pod = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.name, pod.name);
        assert_eq!(de.fs_group, Some(1000));
        assert_eq!(de.volumes.len(), 1);
    }

    #[test]
    fn provisioning_parameters_defaults() {
        let params = ProvisioningParameters::parse(&HashMap::new()).unwrap();
        assert_eq!(params, ProvisioningParameters::default());
        assert!(params.create_bucket);
        assert!(params.unique_bucket_per_volume);
        assert!(!params.enable_claim_path_isolation);
    }

    #[test]
    fn provisioning_parameters_parse() {
        let raw = HashMap::from([
            (PARAM_CREATE_BUCKET.to_owned(), "false".to_owned()),
            (PARAM_BUCKET_NAME_PREFIX.to_owned(), "team-a".to_owned()),
        ]);
        let params = ProvisioningParameters::parse(&raw).unwrap();
        assert!(!params.create_bucket);
        assert_eq!(params.bucket_name_prefix.as_deref(), Some("team-a"));
    }

    #[test]
    fn provisioning_parameters_reject_bad_bool() {
        let raw = HashMap::from([(PARAM_CREATE_BUCKET.to_owned(), "yes".to_owned())]);
        assert!(ProvisioningParameters::parse(&raw).is_err());
    }
}
