//! Mount mechanics: argument handling, target path parsing, and the
//! syscall boundary the mounter drives.

pub mod args;
pub mod sys;
pub mod target_path;

pub use args::MountArgs;
pub use sys::{MountSyscalls, ProcMounts, TargetStatus};
pub use target_path::TargetPath;
