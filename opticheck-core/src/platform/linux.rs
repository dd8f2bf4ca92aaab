use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::{MountEntry, MountStatus, MountTable};

/// The per-process view of mounted filesystems.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Reads the mount table from procfs on every query.
#[derive(Clone, Debug)]
pub struct ProcMounts {
    path: PathBuf,
}

impl ProcMounts {
    pub fn new() -> Self {
        Self::from_path(PROC_MOUNTS)
    }

    /// Reads a mount table in `/proc/mounts` format from another file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable for ProcMounts {
    fn status(&self, device: &Path) -> MountStatus {
        match fs::read_to_string(&self.path) {
            Ok(text) => match find_device(&parse_mounts(&text), device) {
                Some(entry) => MountStatus::Mounted(entry),
                None => MountStatus::NotMounted,
            },
            Err(err) => MountStatus::CheckFailed(err),
        }
    }
}

/// Parses `/proc/mounts` text into records, skipping malformed lines.
///
/// Fields are whitespace separated; spaces, tabs, newlines and backslashes
/// inside a field are written by the kernel as three-digit octal escapes.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                device: PathBuf::from(unescape(device)),
                mount_point: PathBuf::from(unescape(mount_point)),
                fs_type: fs_type.to_string(),
                options: options
                    .split(',')
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

/// Finds the entry for exactly `device`.
///
/// Entries are compared by path first, then by their canonical form, so an
/// entry listed under a symlink such as `/dev/cdrom` still matches `/dev/sr0`.
/// Substring matches (e.g. `/dev/sr0` vs `/dev/sr01`) never match.
pub fn find_device(entries: &[MountEntry], device: &Path) -> Option<MountEntry> {
    let found = entries
        .iter()
        .find(|e| e.device == device)
        .or_else(|| {
            entries.iter().find(|e| {
                e.device.is_absolute()
                    && fs::canonicalize(&e.device).is_ok_and(|resolved| resolved == device)
            })
        })
        .cloned();
    trace!(device = %device.display(), found = found.is_some(), "mount table lookup");
    found
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|b| (b'0'..=b'7').contains(b)) && digits[0] <= b'3'
}
