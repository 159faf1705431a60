//! Syscall boundary for mount operations.
//!
//! [`MountSyscalls`] is the trait the mounter drives; [`ProcMounts`] is the
//! real implementation backed by the kernel and `/proc/self/mountinfo`.
//! Tests substitute a fake so mount flows run without privileges.

use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use nix::sys::stat::stat;
use tracing::debug;

use super::args::MountArgs;
use crate::error::Error;

/// Condition of a prospective mount target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    /// The path exists and is healthy.
    Ok,
    /// The path does not exist.
    Missing,
    /// The path exists but its mount is broken, typically because the FUSE
    /// process behind an existing mount died.
    Corrupted(String),
}

/// The mount operations the mounter needs from the platform.
pub trait MountSyscalls: Send + Sync {
    /// Open the FUSE device and mount it at `target`, returning the device
    /// descriptor for handoff to the mount process.
    fn fuse_mount(&self, target: &Path, args: &MountArgs) -> Result<OwnedFd, Error>;

    /// Bind mount `source` onto `target`.
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), Error>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> Result<(), Error>;

    /// Whether `path` is currently a mount point.
    fn is_mount_point(&self, path: &Path) -> Result<bool, Error>;

    /// Find the mount the bind mount at `target` was taken from, if any.
    fn find_source_mount(&self, target: &Path) -> Result<Option<PathBuf>, Error>;

    /// How many bind mounts of the mount at `source` exist elsewhere.
    fn bind_mount_count(&self, source: &Path) -> Result<usize, Error>;

    /// Probe `path` for existence and mount health.
    fn target_status(&self, path: &Path) -> Result<TargetStatus, Error>;
}

// ---------------------------------------------------------------------------
// Real implementation
// ---------------------------------------------------------------------------

const FUSE_DEVICE: &str = "/dev/fuse";
const MOUNT_INFO: &str = "/proc/self/mountinfo";

/// [`MountSyscalls`] backed by the kernel.
#[derive(Debug, Clone, Default)]
pub struct ProcMounts;

impl MountSyscalls for ProcMounts {
    fn fuse_mount(&self, target: &Path, args: &MountArgs) -> Result<OwnedFd, Error> {
        let device = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(FUSE_DEVICE)
            .map_err(|e| mount_err(target, e))?;
        let fd = OwnedFd::from(device);

        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if args.has("--read-only") {
            flags |= MsFlags::MS_RDONLY;
        }

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let data = format!(
            "fd={},rootmode=40000,user_id={uid},group_id={gid},default_permissions",
            fd.as_raw_fd()
        );

        mount(
            Some("mountpoint"),
            target,
            Some("fuse"),
            flags,
            Some(data.as_str()),
        )
        .map_err(|e| mount_err(target, e))?;

        debug!(target = %target.display(), "fuse device mounted");
        Ok(fd)
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), Error> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| mount_err(target, e))
    }

    fn unmount(&self, target: &Path) -> Result<(), Error> {
        umount(target).map_err(|e| Error::UnmountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn is_mount_point(&self, path: &Path) -> Result<bool, Error> {
        let entries = self.entries()?;
        Ok(entries.iter().any(|e| e.mount_point == path))
    }

    fn find_source_mount(&self, target: &Path) -> Result<Option<PathBuf>, Error> {
        let entries = self.entries()?;
        let Some(bind) = entries.iter().find(|e| e.mount_point == target) else {
            return Ok(None);
        };

        // The source is the mount of the same device whose root is the
        // filesystem root, at a different mount point.
        Ok(entries
            .iter()
            .find(|e| e.device == bind.device && e.root == "/" && e.mount_point != target)
            .map(|e| e.mount_point.clone()))
    }

    fn bind_mount_count(&self, source: &Path) -> Result<usize, Error> {
        let entries = self.entries()?;
        let Some(src) = entries.iter().find(|e| e.mount_point == source) else {
            return Ok(0);
        };
        Ok(entries
            .iter()
            .filter(|e| e.device == src.device && e.mount_point != source)
            .count())
    }

    fn target_status(&self, path: &Path) -> Result<TargetStatus, Error> {
        use nix::errno::Errno;

        match stat(path) {
            Ok(_) => Ok(TargetStatus::Ok),
            Err(Errno::ENOENT) => Ok(TargetStatus::Missing),
            Err(e @ (Errno::ENOTCONN | Errno::ESTALE | Errno::EIO | Errno::EWOULDBLOCK)) => {
                Ok(TargetStatus::Corrupted(e.to_string()))
            }
            Err(e) => Err(Error::internal(format!(
                "stat {} failed: {e}",
                path.display()
            ))),
        }
    }
}

impl ProcMounts {
    fn entries(&self) -> Result<Vec<MountInfoEntry>, Error> {
        let content = fs::read_to_string(MOUNT_INFO).map_err(Error::internal)?;
        Ok(parse_mount_info(&content))
    }
}

fn mount_err(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::MountFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// mountinfo parsing
// ---------------------------------------------------------------------------

/// One line of `/proc/self/mountinfo`, reduced to the fields we use.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountInfoEntry {
    /// `major:minor` of the backing device.
    device: String,
    /// Root of the mount within its filesystem.
    root: String,
    mount_point: PathBuf,
    fs_type: String,
}

/// Parse mountinfo content. Lines that do not match the documented shape
/// are skipped rather than failing the whole read.
fn parse_mount_info(content: &str) -> Vec<MountInfoEntry> {
    content
        .lines()
        .filter_map(|line| {
            let (mount_fields, fs_fields) = line.split_once(" - ")?;
            let mount_fields: Vec<&str> = mount_fields.split_whitespace().collect();
            let fs_type = fs_fields.split_whitespace().next()?;
            if mount_fields.len() < 5 {
                return None;
            }
            Some(MountInfoEntry {
                device: mount_fields[2].to_owned(),
                root: unescape_mount_path(mount_fields[3]),
                mount_point: PathBuf::from(unescape_mount_path(mount_fields[4])),
                fs_type: fs_type.to_owned(),
            })
        })
        .collect()
}

/// Mountinfo escapes space, tab, newline, and backslash as octal sequences.
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let mut code = 0u32;
        let mut digits = 0;
        while digits < 3 {
            match chars.peek().and_then(|d| d.to_digit(8)) {
                Some(d) => {
                    code = code * 8 + d;
                    chars.next();
                    digits += 1;
                }
                None => break,
            }
        }
        if digits == 3 {
            if let Some(decoded) = char::from_u32(code) {
                out.push(decoded);
                continue;
            }
        }
        out.push('\\');
    }
    out
}
