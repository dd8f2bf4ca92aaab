//! Run configuration and defaults.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DEVICE: &str = "/dev/sr0";
pub const DEFAULT_MEDIA_TYPE: &str = "cd";
pub const DEFAULT_WORK_DIR: &str = "/tmp/optical-test";
pub const DEFAULT_SAMPLE_SOURCE: &str = "/usr/share/example-content/";
pub const DEFAULT_SAMPLE_NAME: &str = "Ubuntu_Free_Culture_Showcase";
pub const DEFAULT_MANIFEST_NAME: &str = "optical_test.md5";
pub const DEFAULT_IMAGE_NAME: &str = "optical-test.iso";

/// Pause before burning so a freshly loaded drive can spin up.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(10);
/// How often the mount table is checked while waiting for the disc.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Upper bound on the wait for the reloaded disc to be mounted.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the run works and what sample data it uses.
///
/// Built once at start-up and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Temporary directory holding the staged sample, manifest and image.
    pub work_dir: PathBuf,
    /// Directory containing the sample tree.
    pub sample_source: PathBuf,
    /// Name of the sample tree inside `sample_source`.
    pub sample_name: String,
    /// File name of the checksum manifest inside `work_dir`.
    pub manifest_name: String,
    /// File name of the built image inside `work_dir`.
    pub image_name: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            sample_source: PathBuf::from(DEFAULT_SAMPLE_SOURCE),
            sample_name: DEFAULT_SAMPLE_NAME.to_string(),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
        }
    }
}

/// Delays used by the burn and mount-wait stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub mount_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
        }
    }
}
