//! Layout of a mount pod's communication directory.
//!
//! Each mount pod carries one shared empty-dir volume used purely as a
//! communication channel with the node agent. Inside it live a handful of
//! well-known entries:
//!
//! | Entry | Meaning |
//! |---|---|
//! | `mount.sock` | Unix socket the node agent sends mount options through. |
//! | `mount.err`  | Present (with a reason) when the mount process failed. |
//! | `mount.exit` | Its mere presence tells the mount process to exit cleanly. |
//! | `credentials/` | Directory the credential provider writes into. |

use std::path::{Path, PathBuf};

/// Name of the shared empty-dir volume and of its mount path inside the pod.
pub const COMMUNICATION_DIR_NAME: &str = "comm";

/// Socket for the one-shot mount-option handoff.
pub const MOUNT_SOCK_NAME: &str = "mount.sock";
/// Failure marker; contents carry the failure reason.
pub const MOUNT_ERROR_NAME: &str = "mount.err";
/// Clean-exit marker; presence alone is the signal.
pub const MOUNT_EXIT_NAME: &str = "mount.exit";
/// Credential material directory.
pub const CREDENTIALS_DIR_NAME: &str = "credentials";

/// Host-side path of the communication directory for a pod whose volumes the
/// node agent can reach under `pod_base`.
pub fn comm_dir_on_host(pod_base: &Path) -> PathBuf {
    pod_base.join("volumes").join(COMMUNICATION_DIR_NAME)
}

/// Host-side path of a well-known entry in a pod's communication directory.
pub fn path_on_host(pod_base: &Path, name: &str) -> PathBuf {
    comm_dir_on_host(pod_base).join(name)
}

/// The same entry as seen from inside the mount pod, where the empty-dir is
/// mounted at `/comm`.
pub fn path_inside_pod(name: &str) -> PathBuf {
    Path::new("/").join(COMMUNICATION_DIR_NAME).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_pod_paths_agree_on_names() {
        let base = Path::new("/var/lib/kubelet/pods/abc");
        assert_eq!(
            path_on_host(base, MOUNT_SOCK_NAME),
            PathBuf::from("/var/lib/kubelet/pods/abc/volumes/comm/mount.sock")
        );
        assert_eq!(
            path_inside_pod(CREDENTIALS_DIR_NAME),
            PathBuf::from("/comm/credentials")
        );
    }
}
