//! # libmountpod — mount pod orchestration for a bucket CSI driver
//!
//! `libmountpod` runs FUSE mounts for object-storage volumes inside
//! dedicated per-volume "mount pods" instead of the driver's own process.
//! A controller-side reconciler spawns one mount pod per (node, volume,
//! credential identity); the node-side mounter opens the FUSE device
//! itself, hands the descriptor to the mount pod over a Unix socket, and
//! bind mounts the pod's source mount into each workload target. The crate
//! follows the usual conventions of this codebase (Tokio async runtime,
//! `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: pods, claims, volumes, provisioning parameters. |
//! | [`error`] | [`Error`] enum covering all failure modes. |
//! | [`cluster`] | [`ClusterClient`] trait — the control plane seam, plus an in-memory impl. |
//! | [`labels`] | Mount pod identity: naming, label protocol, selectors. |
//! | [`creator`] | Mount pod spec factory. |
//! | [`expectations`] | In-flight creation markers bridging the informer cache lag. |
//! | [`reconciler`] | [`Reconciler`] — spawns and retires mount pods. |
//! | [`watcher`] | [`MountPodWatcher`] — waits for a mount pod to become ready. |
//! | [`pod_locks`] | Per-pod async locks serializing mount operations. |
//! | [`credentials`] | [`CredentialProvider`] trait and credential contexts. |
//! | [`comm`] | Shared communication directory layout and file signals. |
//! | [`mount_options`] | Mount option handoff with `SCM_RIGHTS` descriptor passing. |
//! | [`mount`] | Mount mechanics: arguments, target paths, syscall boundary. |
//! | [`mounter`] | [`PodMounter`] — the node-side mount orchestrator. |

pub mod cluster;
pub mod comm;
pub mod creator;
pub mod credentials;
pub mod error;
pub mod expectations;
pub mod labels;
pub mod mount;
pub mod mount_options;
pub mod mounter;
pub mod pod_locks;
pub mod reconciler;
pub mod types;
pub mod watcher;

// Re-export the most commonly used items at crate root for convenience.
pub use cluster::ClusterClient;
pub use credentials::CredentialProvider;
pub use error::Error;
pub use mounter::{MounterConfig, PodMounter};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use types::*;
pub use watcher::MountPodWatcher;
