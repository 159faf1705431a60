//! Target path parsing.
//!
//! Bind mount targets handed to the driver follow the kubelet layout
//! `<base>/pods/<pod-uid>/volumes/<plugin>/<volume-name>/mount`. The volume
//! name and workload pod UID embedded in that path identify which mount pod
//! serves the target.

use std::path::Path;

use crate::error::Error;

/// The pod UID and volume name extracted from a bind mount target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    pub pod_uid: String,
    pub volume_name: String,
}

impl TargetPath {
    /// Parse a kubelet-layout target path.
    pub fn parse(target: &Path) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidTarget {
            path: target.display().to_string(),
            reason: reason.to_owned(),
        };

        let parts: Vec<&str> = target
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();

        // ... pods/<uid>/volumes/<plugin>/<volume>/mount
        if parts.len() < 6 {
            return Err(invalid("too few path components"));
        }
        let tail = &parts[parts.len() - 6..];

        if tail[0] != "pods" {
            return Err(invalid("missing pods component"));
        }
        if tail[2] != "volumes" {
            return Err(invalid("missing volumes component"));
        }
        if tail[5] != "mount" {
            return Err(invalid("missing mount component"));
        }
        if tail[1].is_empty() || tail[4].is_empty() {
            return Err(invalid("empty pod uid or volume name"));
        }

        Ok(Self {
            pod_uid: tail[1].to_owned(),
            volume_name: tail[4].to_owned(),
        })
    }
}
