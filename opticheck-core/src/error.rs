//! Error types for the write-and-verify pipeline.
//!
//! Every stage wraps the failure of its underlying tool or filesystem call in a
//! variant that names what was being done, so the orchestrator can report the
//! first failure verbatim.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::checksum::VerificationReport;
use crate::command::ToolError;
use crate::device::MediaType;

/// Result alias used throughout the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error used where a failure can originate from several layers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The pipeline stages, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    Stage,
    Checksum,
    Image,
    Burn,
    MountWait,
    Verify,
}

impl Stage {
    /// Every stage in the order the pipeline runs them.
    pub const ALL: [Stage; 7] = [
        Stage::Prepare,
        Stage::Stage,
        Stage::Checksum,
        Stage::Image,
        Stage::Burn,
        Stage::MountWait,
        Stage::Verify,
    ];

    /// A short, human-readable label for progress output.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Prepare => "Workspace",
            Stage::Stage => "Staging",
            Stage::Checksum => "Checksums",
            Stage::Image => "Image",
            Stage::Burn => "Burn",
            Stage::MountWait => "Mount",
            Stage::Verify => "Verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors produced by the pipeline and its components.
#[derive(Debug, Error)]
pub enum Error {
    /// The working directory could not be created or is not writable.
    #[error("failed to {operation} workspace {}", .path.display())]
    Workspace {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Copying the sample tree into the workspace failed.
    #[error("failed to stage sample data from {}", .path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading, hashing or persisting a manifest failed.
    #[error("failed to {operation} {}", .path.display())]
    Manifest {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// One or more files did not match their recorded checksum.
    #[error("checksum mismatch: {report}")]
    ChecksumMismatch { report: VerificationReport },

    /// The image tool exited unsuccessfully.
    #[error("failed to build image {}", .image.display())]
    ImageBuild {
        image: PathBuf,
        #[source]
        source: ToolError,
    },

    /// The requested media type is not one of `cd`, `dvd` or `bd`.
    #[error("invalid media type '{value}' (expected cd, dvd or bd)")]
    InvalidMediaType { value: String },

    /// The burn tool exited unsuccessfully.
    #[error("failed to burn {media} image to {}", .device.display())]
    Burn {
        media: MediaType,
        device: PathBuf,
        #[source]
        source: ToolError,
    },

    /// The device was not observed as mounted before the ceiling elapsed.
    ///
    /// This is informational: it triggers the self-mount fallback.
    #[error("{} was not mounted within {}s", .device.display(), .waited.as_secs())]
    MountTimeout { device: PathBuf, waited: Duration },

    /// The fallback mount could not be established.
    #[error("unable to mount {} at {}", .device.display(), .mount_point.display())]
    Mount {
        device: PathBuf,
        mount_point: PathBuf,
        #[source]
        source: BoxError,
    },

    /// A mount point was already recorded for this run.
    #[error("mount point already recorded at {}", .existing.display())]
    MountAlreadyRecorded { existing: PathBuf },

    /// Copying the disc contents back into the workspace failed.
    #[error("failed to copy disc contents from {}", .mount_point.display())]
    CopyBack {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The data read back from the disc does not match the baseline.
    #[error("disc contents do not match: {report}")]
    Verification { report: VerificationReport },

    /// A cleanup step failed.
    #[error("cleanup failed to {step}")]
    Cleanup {
        step: &'static str,
        #[source]
        source: BoxError,
    },

    /// The run was interrupted by the user.
    #[error("operation cancelled by user")]
    Cancelled,
}

/// Renders an error followed by its chain of sources, separated by `: `.
pub fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
