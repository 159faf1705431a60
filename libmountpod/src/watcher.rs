//! Mount pod readiness watcher.
//!
//! The mounter cannot hand mount options to a mount pod until that pod is
//! scheduled and `Running`. [`MountPodWatcher::wait`] finds the mount pod
//! serving a given volume and identity on this node and blocks until it is
//! ready or the deadline passes.
//!
//! The wait subscribes to the event stream *before* listing, so a pod that
//! becomes ready between the list and the first received event is still
//! observed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument, warn};

use crate::cluster::{ClusterClient, PodEvent};
use crate::credentials::ProvideContext;
use crate::error::Error;
use crate::labels::{self, PodLabelSelector};
use crate::types::{Pod, PodPhase};

/// Watches the mount pod namespace for the pod serving a particular
/// volume and identity on one node.
pub struct MountPodWatcher {
    client: Arc<dyn ClusterClient>,
    /// Namespace mount pods live in.
    namespace: String,
    /// Node this watcher serves; pods on other nodes are ignored.
    node_name: String,
}

impl MountPodWatcher {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            node_name: node_name.into(),
        }
    }

    /// Wait until the mount pod for `volume_name` under the identity in
    /// `ctx` is `Running` on this node, up to `deadline`.
    ///
    /// Returns [`Error::PodNotReady`] when a matching pod was seen but never
    /// became ready, and [`Error::PodNotFound`] when no matching pod showed
    /// up at all. Finding more than one matching pod on the node is a
    /// non-retryable [`Error::DuplicateMountPods`].
    #[instrument(skip(self, ctx), fields(volume = volume_name, node = %self.node_name))]
    pub async fn wait(
        &self,
        volume_name: &str,
        ctx: &ProvideContext,
        deadline: Duration,
    ) -> Result<Pod, Error> {
        let selector = labels::selector_for_mount(
            volume_name,
            ctx.authentication_source,
            &ctx.fs_group,
            &ctx.workload_namespace,
            &ctx.workload_service_account,
        );

        // Subscribe before the list so a pod turning Running in between is
        // delivered as an event rather than lost.
        let mut events = self.client.subscribe();

        let mut seen_pod = false;
        if let Some(pod) = self.check_listing(&selector, &mut seen_pod).await? {
            return Ok(pod);
        }

        let timeout = tokio::time::sleep(deadline);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    return Err(if seen_pod {
                        warn!("mount pod never became ready");
                        Error::PodNotReady(volume_name.to_owned())
                    } else {
                        warn!("no mount pod appeared");
                        Error::PodNotFound(volume_name.to_owned())
                    });
                }
                event = events.recv() => match event {
                    Ok(PodEvent::Added(pod)) | Ok(PodEvent::Updated(pod)) => {
                        if pod.node_name != self.node_name
                            || pod.namespace != self.namespace
                            || !selector.matches(&pod)
                        {
                            continue;
                        }
                        seen_pod = true;
                        if pod.phase == PodPhase::Running {
                            debug!(pod = %pod.name, "mount pod ready");
                            return Ok(pod);
                        }
                    }
                    Ok(PodEvent::Deleted(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        // Dropped events may include the readiness update;
                        // fall back to a fresh list.
                        debug!(skipped, "event stream lagged, re-listing");
                        if let Some(pod) = self.check_listing(&selector, &mut seen_pod).await? {
                            return Ok(pod);
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::api("pod event stream closed"));
                    }
                },
            }
        }
    }

    /// List matching pods on this node and return the ready one, if any.
    async fn check_listing(
        &self,
        selector: &PodLabelSelector,
        seen_pod: &mut bool,
    ) -> Result<Option<Pod>, Error> {
        let pods = self
            .client
            .list_pods(&self.namespace, selector, Some(&self.node_name))
            .await?;

        if pods.len() > 1 {
            return Err(Error::DuplicateMountPods {
                count: pods.len(),
                node: self.node_name.clone(),
            });
        }

        match pods.into_iter().next() {
            Some(pod) => {
                *seen_pod = true;
                if pod.phase == PodPhase::Running {
                    debug!(pod = %pod.name, "mount pod already ready");
                    Ok(Some(pod))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mem::MemCluster;
    use crate::credentials::AuthenticationSource;
    use crate::labels::{
        LABEL_AUTHENTICATION_SOURCE, LABEL_VOLUME_NAME, LABEL_WORKLOAD_FS_GROUP,
    };
    use std::collections::BTreeMap;

    const MOUNT_NAMESPACE: &str = "mount-system";
    const NODE: &str = "node-a";

    fn mount_pod(name: &str, volume: &str, phase: PodPhase) -> Pod {
        Pod {
            namespace: MOUNT_NAMESPACE.to_owned(),
            name: name.to_owned(),
            uid: format!("uid-{name}"),
            labels: BTreeMap::from([
                (LABEL_VOLUME_NAME.to_owned(), volume.to_owned()),
                (LABEL_AUTHENTICATION_SOURCE.to_owned(), "driver".to_owned()),
                (LABEL_WORKLOAD_FS_GROUP.to_owned(), String::new()),
            ]),
            node_name: NODE.to_owned(),
            phase,
            ..Pod::default()
        }
    }

    fn driver_ctx() -> ProvideContext {
        ProvideContext {
            authentication_source: AuthenticationSource::Driver,
            ..ProvideContext::default()
        }
    }

    fn watcher(cluster: &Arc<MemCluster>) -> MountPodWatcher {
        MountPodWatcher::new(cluster.clone() as Arc<dyn ClusterClient>, MOUNT_NAMESPACE, NODE)
    }

    #[tokio::test]
    async fn returns_running_pod_from_initial_listing() {
        let cluster = Arc::new(MemCluster::new());
        cluster.add_pod(mount_pod("mp-1", "pv-1", PodPhase::Running));

        let pod = watcher(&cluster)
            .wait("pv-1", &driver_ctx(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pod.name, "mp-1");
    }

    #[tokio::test]
    async fn not_found_when_no_pod_appears() {
        let cluster = Arc::new(MemCluster::new());

        let err = watcher(&cluster)
            .wait("pv-1", &driver_ctx(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PodNotFound(_)));
    }

    #[tokio::test]
    async fn not_ready_when_pod_stays_pending() {
        let cluster = Arc::new(MemCluster::new());
        cluster.add_pod(mount_pod("mp-1", "pv-1", PodPhase::Pending));

        let err = watcher(&cluster)
            .wait("pv-1", &driver_ctx(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PodNotReady(_)));
    }

    #[tokio::test]
    async fn wakes_on_readiness_event() {
        let cluster = Arc::new(MemCluster::new());
        cluster.add_pod(mount_pod("mp-1", "pv-1", PodPhase::Pending));

        let waker = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.set_pod_phase(MOUNT_NAMESPACE, "mp-1", PodPhase::Running);
        });

        let pod = watcher(&cluster)
            .wait("pv-1", &driver_ctx(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pod.phase, PodPhase::Running);
    }

    #[tokio::test]
    async fn duplicate_pods_on_node_is_fatal() {
        let cluster = Arc::new(MemCluster::new());
        cluster.add_pod(mount_pod("mp-1", "pv-1", PodPhase::Running));
        cluster.add_pod(mount_pod("mp-2", "pv-1", PodPhase::Running));

        let err = watcher(&cluster)
            .wait("pv-1", &driver_ctx(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMountPods { count: 2, .. }));
    }

    #[tokio::test]
    async fn ignores_pods_for_other_volumes() {
        let cluster = Arc::new(MemCluster::new());
        cluster.add_pod(mount_pod("mp-other", "pv-other", PodPhase::Running));

        let err = watcher(&cluster)
            .wait("pv-1", &driver_ctx(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PodNotFound(_)));
    }
}
