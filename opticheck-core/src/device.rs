use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::error::Error;

/// The disc format family, which decides the write mode used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaType {
    Cd,
    Dvd,
    Bd,
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cd" => Ok(MediaType::Cd),
            "dvd" => Ok(MediaType::Dvd),
            "bd" => Ok(MediaType::Bd),
            _ => Err(Error::InvalidMediaType {
                value: s.to_string(),
            }),
        }
    }
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Cd => "CD",
            MediaType::Dvd => "DVD",
            MediaType::Bd => "BD",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The drive to burn to and the media type the operator asked for.
///
/// The media type is parsed up front. A value that is not recognised is kept
/// verbatim and only rejected when the burn stage starts, so the run still
/// stages its data and cleans up normally while no write is ever attempted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BurnTarget {
    /// Canonical path to the drive (e.g., `/dev/sr0`).
    pub device: PathBuf,
    /// The parsed media type, or the rejected value as supplied.
    pub media: std::result::Result<MediaType, String>,
}

impl BurnTarget {
    /// Builds a target, resolving symlinks in `device`.
    pub fn new(device: impl AsRef<Path>, media: impl Into<String>) -> Self {
        Self::from_parts(canonicalize_device(device.as_ref()), media)
    }

    /// Builds a target for `device` as given, without resolving it.
    pub fn from_parts(device: PathBuf, media: impl Into<String>) -> Self {
        let media = media.into();
        Self {
            device,
            media: media.parse::<MediaType>().map_err(|_| media),
        }
    }

    pub fn media_type(&self) -> Result<MediaType, Error> {
        match &self.media {
            Ok(media) => Ok(*media),
            Err(value) => Err(Error::InvalidMediaType {
                value: value.clone(),
            }),
        }
    }

    /// The media type for display, recognised or not.
    pub fn media_label(&self) -> &str {
        match &self.media {
            Ok(media) => media.as_str(),
            Err(value) => value,
        }
    }
}

impl fmt::Display for BurnTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<15} [{}]", self.device.display(), self.media_label())
    }
}

/// Resolves symlinks such as `/dev/cdrom` to the underlying device node.
///
/// A path that cannot be resolved is returned unchanged; the tools that later
/// open it will produce a more specific error.
pub fn canonicalize_device(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(device = %path.display(), error = %err, "could not resolve device path");
            path.to_path_buf()
        }
    }
}
