//! Credential model and the credential-provider boundary.
//!
//! Credential acquisition itself lives outside this crate; here we define
//! the authentication-source model shared by the reconciler, watcher, and
//! spec factory, plus the [`CredentialProvider`] trait the mounter delegates
//! to when materializing credentials into a mount pod's communication
//! directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::Error;

/// Volume attribute naming the credential-resolution strategy for a volume.
pub const VOLUME_ATTRIBUTE_AUTHENTICATION_SOURCE: &str = "authenticationSource";

/// Mode for credential directories created under a mount pod.
pub const CREDENTIAL_DIR_MODE: u32 = 0o700;
/// Mode for credential and marker files written under a mount pod.
pub const CREDENTIAL_FILE_MODE: u32 = 0o600;

/// Environment variable receiving a relocated `--aws-max-attempts` argument.
pub const ENV_MAX_ATTEMPTS: &str = "AWS_MAX_ATTEMPTS";

// ---------------------------------------------------------------------------
// Authentication source
// ---------------------------------------------------------------------------

/// Credential-resolution strategy for a mount.
///
/// This is the single place the "unset means driver" fallback lives; every
/// component deriving mount pod identity goes through
/// [`AuthenticationSource::from_volume_attributes`] so the default cannot
/// drift between them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthenticationSource {
    /// Node-wide credentials owned by the driver.
    #[default]
    #[serde(rename = "driver")]
    Driver,
    /// Credentials tied to the workload's namespace and service account.
    #[serde(rename = "pod")]
    Pod,
}

impl AuthenticationSource {
    /// Resolve the authentication source from a volume's attributes,
    /// defaulting to [`AuthenticationSource::Driver`] when unset or unknown.
    pub fn from_volume_attributes(attrs: &HashMap<String, String>) -> Self {
        match attrs
            .get(VOLUME_ATTRIBUTE_AUTHENTICATION_SOURCE)
            .map(String::as_str)
        {
            Some("pod") => Self::Pod,
            _ => Self::Driver,
        }
    }

    /// The value stored in mount pod labels for this source.
    pub fn as_label_value(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Pod => "pod",
        }
    }
}

impl fmt::Display for AuthenticationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label_value())
    }
}

// ---------------------------------------------------------------------------
// Provide / cleanup contexts
// ---------------------------------------------------------------------------

/// Everything the credential provider needs to materialize credentials for
/// one mount, and everything mount pod selection needs to derive the pod's
/// identity.
#[derive(Debug, Clone, Default)]
pub struct ProvideContext {
    pub authentication_source: AuthenticationSource,
    /// Workload `fsGroup` rendered as a label value (empty string if unset).
    pub fs_group: String,
    /// Workload namespace; only meaningful for pod-scoped identity.
    pub workload_namespace: String,
    /// Workload service account; only meaningful for pod-scoped identity.
    pub workload_service_account: String,
    /// Host-side directory credentials are written into.
    pub write_path: PathBuf,
    /// The same directory as seen from inside the mount pod, used when
    /// rendering environment variables that point at credential files.
    pub env_path: PathBuf,
}

impl ProvideContext {
    /// Set the host-side write path and the matching in-pod path.
    pub fn set_write_and_env_path(&mut self, write_path: PathBuf, env_path: PathBuf) {
        self.write_path = write_path;
        self.env_path = env_path;
    }
}

/// Context for removing credential material written for a mount pod.
#[derive(Debug, Clone, Default)]
pub struct CleanupContext {
    /// Host-side directory the credentials were written into.
    pub write_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

/// An ordered set of environment variable assignments handed to the mount
/// process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVars(BTreeMap<String, String>);

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Merge `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: EnvVars) {
        self.0.extend(other.0);
    }

    /// Render as sorted `KEY=value` assignments.
    pub fn list(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Provider boundary
// ---------------------------------------------------------------------------

/// External collaborator that writes credential material for a mount pod
/// and cleans it up on teardown.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Materialize credentials under `ctx.write_path`.
    ///
    /// Returns environment variables to inject into the mount process and
    /// the authentication source that was actually used.
    async fn provide(&self, ctx: &ProvideContext) -> Result<(EnvVars, AuthenticationSource), Error>;

    /// Remove credential material previously written for a mount pod.
    async fn cleanup(&self, ctx: &CleanupContext) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_source_defaults_to_driver() {
        assert_eq!(
            AuthenticationSource::from_volume_attributes(&HashMap::new()),
            AuthenticationSource::Driver
        );

        let attrs = HashMap::from([(
            VOLUME_ATTRIBUTE_AUTHENTICATION_SOURCE.to_owned(),
            "garbage".to_owned(),
        )]);
        assert_eq!(
            AuthenticationSource::from_volume_attributes(&attrs),
            AuthenticationSource::Driver
        );
    }

    #[test]
    fn auth_source_pod_scoped() {
        let attrs = HashMap::from([(
            VOLUME_ATTRIBUTE_AUTHENTICATION_SOURCE.to_owned(),
            "pod".to_owned(),
        )]);
        assert_eq!(
            AuthenticationSource::from_volume_attributes(&attrs),
            AuthenticationSource::Pod
        );
        assert_eq!(AuthenticationSource::Pod.as_label_value(), "pod");
    }

    #[test]
    fn env_vars_sorted_list() {
        let mut env = EnvVars::new();
        env.set("B", "2");
        env.set("A", "1");
        assert_eq!(env.list(), vec!["A=1".to_owned(), "B=2".to_owned()]);
    }

    #[test]
    fn env_vars_merge_overwrites() {
        let mut env = EnvVars::new();
        env.set("A", "1");
        let mut other = EnvVars::new();
        other.set("A", "override");
        other.set("B", "2");
        env.merge(other);
        assert_eq!(env.get("A"), Some("override"));
        assert_eq!(env.get("B"), Some("2"));
    }
}
