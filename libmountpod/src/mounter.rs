//! Mount orchestration.
//!
//! [`PodMounter::mount`] drives one bind mount target to mounted:
//!
//!   1. resolve the target path to its volume,
//!   2. heal or create the target directory,
//!   3. wait for the mount pod serving this volume and identity,
//!   4. under that pod's lock, materialize credentials,
//!   5. if the pod's source mount does not exist yet, open the FUSE device,
//!      mount it, and hand the descriptor plus options to the mount pod,
//!   6. bind mount the source onto the target.
//!
//! Credentials are refreshed even when the target is already mounted, so
//! every republish keeps tokens current. [`PodMounter::unmount`] removes
//! one bind mount and tears the source mount down only when no other bind
//! mounts reference it, signalling the mount pod to exit cleanly.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::comm;
use crate::credentials::{
    AuthenticationSource, CleanupContext, CredentialProvider, EnvVars, ProvideContext,
    ENV_MAX_ATTEMPTS,
};
use crate::error::Error;
use crate::mount::args::{ARG_AWS_MAX_ATTEMPTS, ARG_USER_AGENT_PREFIX};
use crate::mount::{MountArgs, MountSyscalls, TargetPath, TargetStatus};
use crate::mount_options::{self, MountOptions};
use crate::pod_locks::PodLockRegistry;
use crate::types::Pod;
use crate::watcher::MountPodWatcher;

const MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Node-side mounter configuration.
#[derive(Debug, Clone)]
pub struct MounterConfig {
    /// Directory source mounts live in, one subdirectory per mount pod UID.
    pub source_mount_dir: PathBuf,
    /// Kubelet base directory; mount pod volumes are reachable under
    /// `<kubelet_path>/pods/<uid>/volumes`.
    pub kubelet_path: PathBuf,
    /// Platform version stamped into the user agent.
    pub platform_version: String,
    /// How long to wait for a mount pod to become ready, and for its mount
    /// process to confirm the mount.
    pub pod_ready_timeout: Duration,
}

/// Orchestrates mounts through per-volume mount pods.
pub struct PodMounter {
    watcher: MountPodWatcher,
    credentials: Arc<dyn CredentialProvider>,
    sys: Arc<dyn MountSyscalls>,
    locks: PodLockRegistry,
    config: MounterConfig,
}

impl PodMounter {
    pub fn new(
        watcher: MountPodWatcher,
        credentials: Arc<dyn CredentialProvider>,
        sys: Arc<dyn MountSyscalls>,
        config: MounterConfig,
    ) -> Self {
        Self {
            watcher,
            credentials,
            sys,
            locks: PodLockRegistry::new(),
            config,
        }
    }

    /// Mount `bucket_name` at `target`.
    ///
    /// Safe to call again for an already-mounted target: credentials are
    /// refreshed and the call returns without touching the mounts.
    #[instrument(skip(self, ctx, args), fields(bucket = bucket_name, target = %target.display()))]
    pub async fn mount(
        &self,
        bucket_name: &str,
        target: &Path,
        mut ctx: ProvideContext,
        mut args: MountArgs,
    ) -> Result<(), Error> {
        let parsed = TargetPath::parse(target)?;

        self.prepare_mount_path(target).await?;
        let already_mounted = self.sys.is_mount_point(target)?;

        let pod = self
            .watcher
            .wait(&parsed.volume_name, &ctx, self.config.pod_ready_timeout)
            .await?;

        // Everything from credential writes to the source mount handshake
        // is serialized per mount pod.
        let _guard = self.locks.lock(&pod.uid).await;

        // The source path gets the same treatment as the target: a mount
        // process that died leaves it as a corrupted mount that must be
        // cleared before it can host a fresh one.
        let source = self.config.source_mount_dir.join(&pod.uid);
        self.prepare_mount_path(&source).await?;

        let pod_base = self.pod_base(&pod.uid);
        let creds_dir = comm::path_on_host(&pod_base, comm::CREDENTIALS_DIR_NAME);
        ensure_credentials_dir(&creds_dir).await?;
        ctx.set_write_and_env_path(
            creds_dir,
            comm::path_inside_pod(comm::CREDENTIALS_DIR_NAME),
        );

        let (env, auth_source) = self
            .credentials
            .provide(&ctx)
            .await
            .map_err(|e| Error::credentials(format!("{e}; {}", logs_hint(&pod))))?;

        if already_mounted {
            debug!(pod = %pod.name, "target already mounted, credentials refreshed");
            return Ok(());
        }

        if !self.sys.is_mount_point(&source)? {
            self.start_source_mount(bucket_name, &source, &pod, &mut args, env, auth_source)
                .await?;
        }

        self.sys.bind_mount(&source, target)?;
        debug!(pod = %pod.name, source = %source.display(), "target mounted");
        Ok(())
    }

    /// Unmount the bind mount at `target`. Tears the source mount down when
    /// this was its last bind mount.
    #[instrument(skip(self, ctx), fields(target = %target.display()))]
    pub async fn unmount(&self, target: &Path, mut ctx: CleanupContext) -> Result<(), Error> {
        let Some(source) = self.sys.find_source_mount(target)? else {
            // No source to account against; take the target down and leave
            // it at that.
            warn!("no source mount found for target");
            return self.sys.unmount(target);
        };

        let pod_uid = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::internal(format!("bad source mount path {}", source.display())))?
            .to_owned();

        let _guard = self.locks.lock(&pod_uid).await;

        let pod_base = self.pod_base(&pod_uid);
        ctx.write_path = comm::path_on_host(&pod_base, comm::CREDENTIALS_DIR_NAME);

        self.sys.unmount(target)?;

        if self.sys.bind_mount_count(&source)? > 0 {
            debug!(source = %source.display(), "source mount still referenced");
            return Ok(());
        }

        // Last reference gone. Tell the mount process the coming unmount is
        // deliberate so it exits zero, then take the source down.
        let exit_path = comm::path_on_host(&pod_base, comm::MOUNT_EXIT_NAME);
        tokio::fs::write(&exit_path, b"")
            .await
            .map_err(Error::internal)?;

        self.sys.unmount(&source)?;
        tokio::fs::remove_dir(&source).await.map_err(|e| {
            Error::internal(format!(
                "failed to remove source mount dir {}: {e}",
                source.display()
            ))
        })?;

        self.credentials.cleanup(&ctx).await?;
        debug!(source = %source.display(), "source mount torn down");
        Ok(())
    }

    /// Make sure `path` exists and is not a leftover corrupted mount, so a
    /// fresh mount can land on it.
    async fn prepare_mount_path(&self, path: &Path) -> Result<(), Error> {
        match self.sys.target_status(path)? {
            TargetStatus::Ok => Ok(()),
            TargetStatus::Missing => tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| Error::InvalidTarget {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }),
            TargetStatus::Corrupted(reason) => {
                warn!(path = %path.display(), reason, "unmounting corrupted mount path");
                self.sys.unmount(path)
            }
        }
    }

    /// Mount the FUSE device at `source` and hand the descriptor and mount
    /// options to the mount pod.
    async fn start_source_mount(
        &self,
        bucket_name: &str,
        source: &Path,
        pod: &Pod,
        args: &mut MountArgs,
        mut env: EnvVars,
        auth_source: AuthenticationSource,
    ) -> Result<(), Error> {
        // The retry count is understood via the environment, not the
        // command line.
        if let Some(attempts) = args.remove(ARG_AWS_MAX_ATTEMPTS) {
            env.set(ENV_MAX_ATTEMPTS, attempts);
        }
        args.set(
            ARG_USER_AGENT_PREFIX,
            user_agent(auth_source, &self.config.platform_version),
        );

        let pod_base = self.pod_base(&pod.uid);

        // A leftover error file from a previous attempt would immediately
        // fail the wait below.
        let err_path = comm::path_on_host(&pod_base, comm::MOUNT_ERROR_NAME);
        match tokio::fs::remove_file(&err_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::internal(e)),
        }

        let fd = self.sys.fuse_mount(source, args)?;

        let options = MountOptions {
            bucket_name: bucket_name.to_owned(),
            args: args.sorted(),
            env: env.list(),
        };
        let sock_path = comm::path_on_host(&pod_base, comm::MOUNT_SOCK_NAME);
        let sent = mount_options::send(
            &sock_path,
            fd.as_raw_fd(),
            &options,
            self.config.pod_ready_timeout,
        )
        .await;
        // Our copy of the descriptor is no longer needed; the mount pod
        // holds its own duplicate on success.
        drop(fd);

        let result = match sent {
            Ok(()) => self.wait_for_mount(&pod_base, source).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if let Err(cleanup) = self.sys.unmount(source) {
                warn!(error = %cleanup, "failed to unmount source after mount failure");
            }
            return Err(Error::MountFailed {
                path: source.display().to_string(),
                reason: format!("{e}; {}", logs_hint(pod)),
            });
        }
        Ok(())
    }

    /// Wait until the mount process confirms the source mount, or reports
    /// failure through the error file.
    async fn wait_for_mount(&self, pod_base: &Path, source: &Path) -> Result<(), Error> {
        let (tx, mut rx) = mpsc::channel::<Result<(), Error>>(2);

        let err_path = comm::path_on_host(pod_base, comm::MOUNT_ERROR_NAME);
        let err_tx = tx.clone();
        let source_display = source.display().to_string();
        let error_poller = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MOUNT_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if let Ok(message) = tokio::fs::read_to_string(&err_path).await {
                    let _ = err_tx
                        .send(Err(Error::MountFailed {
                            path: source_display,
                            reason: message.trim().to_owned(),
                        }))
                        .await;
                    return;
                }
            }
        });

        let sys = Arc::clone(&self.sys);
        let source_path = source.to_owned();
        let ready_poller = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MOUNT_POLL_INTERVAL);
            loop {
                interval.tick().await;
                match sys.is_mount_point(&source_path) {
                    Ok(true) => {
                        let _ = tx.send(Ok(())).await;
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        let outcome = tokio::time::timeout(self.config.pod_ready_timeout, rx.recv()).await;
        error_poller.abort();
        ready_poller.abort();

        match outcome {
            Ok(Some(result)) => result,
            Ok(None) => Err(Error::Cancelled(
                "mount confirmation pollers exited without a result".to_owned(),
            )),
            Err(_) => Err(Error::MountFailed {
                path: source.display().to_string(),
                reason: "timed out waiting for mount confirmation".to_owned(),
            }),
        }
    }

    fn pod_base(&self, pod_uid: &str) -> PathBuf {
        self.config.kubelet_path.join("pods").join(pod_uid)
    }
}

/// User agent the mount process presents, identifying the credential source
/// and the platform it runs on.
fn user_agent(auth_source: AuthenticationSource, platform_version: &str) -> String {
    format!(
        "mount-pod-csi-driver credential-source#{} platform/{platform_version}",
        auth_source.as_label_value()
    )
}

fn logs_hint(pod: &Pod) -> String {
    format!(
        "check mount pod {}/{} logs for details",
        pod.namespace, pod.name
    )
}

async fn ensure_credentials_dir(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::create_dir_all(path).await.map_err(Error::internal)?;
    let perms = std::fs::Permissions::from_mode(crate::credentials::CREDENTIAL_DIR_MODE);
    tokio::fs::set_permissions(path, perms)
        .await
        .map_err(Error::internal)
}
