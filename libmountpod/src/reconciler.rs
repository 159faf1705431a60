//! Pod lifecycle reconciler.
//!
//! One [`Reconciler::reconcile`] call handles one pod reference, in either
//! of two roles:
//!
//!   * a pod in the mount namespace is a mount pod: delete it once its
//!     mount process has exited cleanly;
//!   * any other pod is a workload: make sure every volume it claims from
//!     this driver has a mount pod on its node, spawning one when missing.
//!
//! Creations are tracked through [`Expectations`] so that a spawned pod the
//! informer cache has not caught up with yet is not spawned twice.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::cluster::ClusterClient;
use crate::creator::MountPodFactory;
use crate::credentials::AuthenticationSource;
use crate::error::Error;
use crate::expectations::Expectations;
use crate::labels::{self, CSI_DRIVER_NAME};
use crate::types::{ClaimPhase, Pod, PodPhase, PodRef, PodVolumeSource, Volume, VolumeClaim};

/// What the caller's work queue should do with the pod after a
/// reconciliation pass.
///
/// A pass that hits per-volume failures still processes the remaining
/// volumes, so the requeue decision and the joined failures are reported
/// together rather than one eclipsing the other.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Revisit this pod later: something it needs is not settled yet.
    pub requeue: bool,
    /// Failures collected while walking the pod's volumes, joined into one.
    pub error: Option<Error>,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Self::default()
        }
    }
}

/// Drives mount pods toward the state workload pods require.
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    factory: MountPodFactory,
    expectations: Expectations,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ClusterClient>, factory: MountPodFactory) -> Self {
        Self {
            client,
            factory,
            expectations: Expectations::new(),
        }
    }

    /// In-flight creation markers, exposed for wiring and inspection.
    pub fn expectations(&self) -> &Expectations {
        &self.expectations
    }

    /// Reconcile one pod. A pod that no longer exists is finished work.
    ///
    /// `Err` means the pod itself could not be handled; failures scoped to
    /// individual volumes land in [`ReconcileOutcome::error`] instead.
    #[instrument(skip(self), fields(namespace = %pod_ref.namespace, pod = %pod_ref.name))]
    pub async fn reconcile(&self, pod_ref: &PodRef) -> Result<ReconcileOutcome, Error> {
        let Some(pod) = self.client.get_pod(&pod_ref.namespace, &pod_ref.name).await? else {
            return Ok(ReconcileOutcome::done());
        };

        if pod.namespace == self.factory.namespace() {
            self.reconcile_mount_pod(&pod).await
        } else {
            self.reconcile_workload_pod(&pod).await
        }
    }

    /// Mount pods delete themselves, in effect: a `Succeeded` phase means
    /// the mount process exited cleanly after the last unmount, and the pod
    /// object is garbage from then on.
    async fn reconcile_mount_pod(&self, pod: &Pod) -> Result<ReconcileOutcome, Error> {
        match pod.phase {
            PodPhase::Succeeded => {
                debug!(pod = %pod.name, "deleting completed mount pod");
                match self.client.delete_pod(&pod.namespace, &pod.name).await {
                    Ok(()) | Err(Error::PodNotFound(_)) => Ok(ReconcileOutcome::done()),
                    Err(e) => Err(e),
                }
            }
            PodPhase::Failed => {
                // Left in place so its logs stay available for debugging.
                warn!(pod = %pod.name, reason = %pod.status_reason, "mount pod failed");
                Ok(ReconcileOutcome::done())
            }
            _ => {
                debug!(pod = %pod.name, phase = ?pod.phase, "mount pod not terminated yet");
                Ok(ReconcileOutcome::done())
            }
        }
    }

    /// Walk a workload's claim-backed volumes and make sure each volume of
    /// ours has a mount pod on the workload's node.
    async fn reconcile_workload_pod(&self, pod: &Pod) -> Result<ReconcileOutcome, Error> {
        if pod.node_name.is_empty() || pod.volumes.is_empty() {
            return Ok(ReconcileOutcome::done());
        }

        let mut requeue = false;
        let mut errors = Vec::new();

        for pod_volume in &pod.volumes {
            let PodVolumeSource::Claim { claim_name } = &pod_volume.source else {
                continue;
            };

            let volume = match self.bound_volume_for_claim(&pod.namespace, claim_name).await {
                Ok(Some(volume)) => volume,
                Ok(None) => continue,
                Err(Error::ClaimNotBound(_)) => {
                    // Binding is in progress; check again later.
                    debug!(claim = %claim_name, "claim not bound yet");
                    requeue = true;
                    continue;
                }
                Err(e) => {
                    error!(claim = %claim_name, error = %e, "failed to resolve claim");
                    errors.push(e);
                    continue;
                }
            };

            match self.spawn_mount_pod_if_needed(pod, &volume).await {
                Ok(true) => requeue = true,
                Ok(false) => {}
                Err(e) => {
                    error!(volume = %volume.name, error = %e, "failed to ensure mount pod");
                    errors.push(e);
                }
            }
        }

        Ok(ReconcileOutcome {
            requeue,
            error: Error::join(errors),
        })
    }

    /// Resolve a claim to the volume it is bound to.
    ///
    /// `Ok(None)` means the volume exists but belongs to another driver.
    /// [`Error::ClaimNotBound`] means binding has not completed and the
    /// caller should retry rather than fail.
    async fn bound_volume_for_claim(
        &self,
        namespace: &str,
        claim_name: &str,
    ) -> Result<Option<Volume>, Error> {
        let claim = self
            .client
            .get_claim(namespace, claim_name)
            .await?
            .ok_or_else(|| Error::api(format!("claim {namespace}/{claim_name} not found")))?;

        if !claim_is_bound(&claim) {
            return Err(Error::ClaimNotBound(format!("{namespace}/{claim_name}")));
        }

        let volume = self
            .client
            .get_volume(&claim.volume_name)
            .await?
            .ok_or_else(|| Error::api(format!("volume {} not found", claim.volume_name)))?;

        let points_back = volume
            .claim_ref
            .as_ref()
            .is_some_and(|r| r.namespace == claim.namespace && r.name == claim.name);
        if !points_back {
            return Err(Error::VolumeClaimMismatch {
                volume: volume.name.clone(),
                claim: format!("{}/{}", claim.namespace, claim.name),
            });
        }

        let ours = volume
            .csi
            .as_ref()
            .is_some_and(|csi| csi.driver == CSI_DRIVER_NAME);
        Ok(ours.then_some(volume))
    }

    /// Ensure a mount pod exists for (`workload`'s node, `volume`,
    /// identity). Returns whether the caller should requeue.
    ///
    /// Exactly one matching pod is the settled state. Zero matching pods
    /// means we spawn one, unless a creation is already in flight, and
    /// requeue either way so the new pod's arrival is confirmed. More than
    /// one matching pod is a correctness violation and fails loudly.
    async fn spawn_mount_pod_if_needed(&self, workload: &Pod, volume: &Volume) -> Result<bool, Error> {
        if !workload.is_active() {
            return Ok(false);
        }

        let auth_source = AuthenticationSource::from_volume_attributes(volume.attributes());
        let selector = labels::selector_for_mount(
            &volume.name,
            auth_source,
            &workload.fs_group_label(),
            &workload.namespace,
            &workload.service_account_name,
        );
        let expectation_key = selector.expectation_key(&workload.node_name);

        let existing = self
            .client
            .list_pods(self.factory.namespace(), &selector, Some(&workload.node_name))
            .await?;

        match existing.len() {
            0 => {
                if self.expectations.is_pending(&expectation_key) {
                    debug!(volume = %volume.name, "creation already in flight");
                    return Ok(true);
                }

                let spec = self.factory.build(workload, volume);
                let created = self.client.create_pod(spec).await?;
                self.expectations.set_pending(&expectation_key);
                debug!(pod = %created.name, volume = %volume.name, "spawned mount pod");
                Ok(true)
            }
            1 => {
                if self.expectations.is_pending(&expectation_key) {
                    self.expectations.clear(&expectation_key);
                }
                Ok(false)
            }
            count => Err(Error::DuplicateMountPods {
                count,
                node: workload.node_name.clone(),
            }),
        }
    }
}

fn claim_is_bound(claim: &VolumeClaim) -> bool {
    claim.phase == ClaimPhase::Bound && !claim.volume_name.is_empty()
}
