//! Provides platform-specific functionality.
//!
//! This module answers "is this device mounted, and where?" by reading the
//! operating system's mount table. The record and trait types are shared; the
//! table reader is chosen with conditional compilation (`#[cfg]`).

use std::io;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
compile_error!("opticheck reads the Linux mount table and only supports Linux targets");

/// One line of the mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    /// The mounted device or source (e.g., `/dev/sr0`).
    pub device: PathBuf,
    /// Where the device is attached.
    pub mount_point: PathBuf,
    /// Filesystem type (e.g., `iso9660`).
    pub fs_type: String,
    /// Mount options, split on commas.
    pub options: Vec<String>,
}

/// Outcome of checking whether one device is mounted.
#[derive(Debug)]
pub enum MountStatus {
    NotMounted,
    Mounted(MountEntry),
    /// The mount table itself could not be read.
    CheckFailed(io::Error),
}

impl MountStatus {
    pub fn is_mounted(&self) -> bool {
        matches!(self, MountStatus::Mounted(_))
    }
}

/// A queryable view of the system mount table.
pub trait MountTable {
    /// Looks up `device` by exact (canonical) path.
    fn status(&self, device: &Path) -> MountStatus;
}
