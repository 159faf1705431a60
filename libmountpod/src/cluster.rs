//! Cluster API boundary.
//!
//! [`ClusterClient`] is the trait seam between this crate and whatever
//! control plane actually stores pods, claims, and volumes. It covers just
//! the operations the reconciler, watcher, and mounter need, plus a
//! broadcast subscription for pod events that backs the readiness watcher's
//! subscribe-then-list protocol.
//!
//! [`mem::MemCluster`] is an in-memory implementation used by tests and
//! local single-process wiring.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Error;
use crate::labels::PodLabelSelector;
use crate::types::{Pod, Volume, VolumeClaim};

/// A pod add/update/delete notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PodEvent {
    Added(Pod),
    Updated(Pod),
    Deleted(Pod),
}

/// Access to the control plane's pod, claim, and volume objects.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a pod; `Ok(None)` when it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// List pods in `namespace` matching `selector`, optionally restricted
    /// to one node.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &PodLabelSelector,
        node_name: Option<&str>,
    ) -> Result<Vec<Pod>, Error>;

    /// Create a pod. The returned pod carries the UID assigned by the
    /// control plane.
    async fn create_pod(&self, pod: Pod) -> Result<Pod, Error>;

    /// Delete a pod. Returns [`Error::PodNotFound`] when it does not exist;
    /// callers that only care about the end state treat that as success.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a volume claim; `Ok(None)` when it does not exist.
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<VolumeClaim>, Error>;

    /// Fetch a volume; `Ok(None)` when it does not exist.
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>, Error>;

    /// Subscribe to pod events. The subscription must be registered before
    /// any listing a caller wants to reconcile against it, so creations
    /// racing the list are not lost.
    fn subscribe(&self) -> broadcast::Receiver<PodEvent>;
}

pub mod mem {
    //! In-memory [`ClusterClient`] for tests and single-process setups.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use dashmap::DashMap;
    use tokio::sync::broadcast;

    use super::*;
    use crate::types::PodPhase;

    const EVENT_CHANNEL_CAPACITY: usize = 64;

    /// A process-local cluster: concurrent maps plus a broadcast channel
    /// standing in for the watch stream.
    pub struct MemCluster {
        pods: DashMap<(String, String), Pod>,
        claims: DashMap<(String, String), VolumeClaim>,
        volumes: DashMap<String, Volume>,
        events: broadcast::Sender<PodEvent>,
        create_calls: AtomicUsize,
    }

    impl MemCluster {
        pub fn new() -> Self {
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            Self {
                pods: DashMap::new(),
                claims: DashMap::new(),
                volumes: DashMap::new(),
                events,
                create_calls: AtomicUsize::new(0),
            }
        }

        /// Seed a pod without going through [`ClusterClient::create_pod`]
        /// (no UID assignment, no create accounting).
        pub fn add_pod(&self, pod: Pod) {
            let key = (pod.namespace.clone(), pod.name.clone());
            self.pods.insert(key, pod.clone());
            let _ = self.events.send(PodEvent::Added(pod));
        }

        pub fn add_claim(&self, claim: VolumeClaim) {
            let key = (claim.namespace.clone(), claim.name.clone());
            self.claims.insert(key, claim);
        }

        pub fn add_volume(&self, volume: Volume) {
            self.volumes.insert(volume.name.clone(), volume);
        }

        /// Update a pod's phase, emitting an update event like a real watch
        /// stream would.
        pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
            let key = (namespace.to_owned(), name.to_owned());
            if let Some(mut pod) = self.pods.get_mut(&key) {
                pod.phase = phase;
                let updated = pod.clone();
                drop(pod);
                let _ = self.events.send(PodEvent::Updated(updated));
            }
        }

        /// How many pods `create_pod` was asked to create.
        pub fn create_count(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
        }

        pub fn pod_count(&self) -> usize {
            self.pods.len()
        }
    }

    impl Default for MemCluster {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ClusterClient for MemCluster {
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
            let key = (namespace.to_owned(), name.to_owned());
            Ok(self.pods.get(&key).map(|p| p.clone()))
        }

        async fn list_pods(
            &self,
            namespace: &str,
            selector: &PodLabelSelector,
            node_name: Option<&str>,
        ) -> Result<Vec<Pod>, Error> {
            Ok(self
                .pods
                .iter()
                .filter(|entry| {
                    let pod = entry.value();
                    pod.namespace == namespace
                        && selector.matches(pod)
                        && node_name.is_none_or(|n| pod.node_name == n)
                })
                .map(|entry| entry.value().clone())
                .collect())
        }

        async fn create_pod(&self, mut pod: Pod) -> Result<Pod, Error> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if pod.uid.is_empty() {
                pod.uid = uuid::Uuid::new_v4().to_string();
            }
            let key = (pod.namespace.clone(), pod.name.clone());
            if self.pods.contains_key(&key) {
                return Err(Error::Api(format!(
                    "pod {}/{} already exists",
                    pod.namespace, pod.name
                )));
            }
            self.pods.insert(key, pod.clone());
            let _ = self.events.send(PodEvent::Added(pod.clone()));
            Ok(pod)
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
            let key = (namespace.to_owned(), name.to_owned());
            match self.pods.remove(&key) {
                Some((_, pod)) => {
                    let _ = self.events.send(PodEvent::Deleted(pod));
                    Ok(())
                }
                None => Err(Error::PodNotFound(format!("{namespace}/{name}"))),
            }
        }

        async fn get_claim(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<VolumeClaim>, Error> {
            let key = (namespace.to_owned(), name.to_owned());
            Ok(self.claims.get(&key).map(|c| c.clone()))
        }

        async fn get_volume(&self, name: &str) -> Result<Option<Volume>, Error> {
            Ok(self.volumes.get(name).map(|v| v.clone()))
        }

        fn subscribe(&self) -> broadcast::Receiver<PodEvent> {
            self.events.subscribe()
        }
    }

}
