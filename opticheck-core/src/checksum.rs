//! Content manifests for the sample data.
//!
//! A [`Manifest`] maps every regular file directly inside a directory to the
//! SHA-256 of its contents. The baseline is taken from the staged sample before
//! burning and checked again against the data copied back off the disc.
//!
//! On disk a manifest uses the `sha256sum` text format, so it can also be
//! checked by hand with `sha256sum -c`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Mapping from file name to hex-encoded content checksum.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn insert(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.entries.insert(name.into(), digest.into());
    }

    /// Writes the manifest as `<hex>  <name>` lines, sorted by name.
    ///
    /// Names containing a backslash or a line break are escaped and the line
    /// is prefixed with `\`, as `sha256sum` does.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut text = String::new();
        for (name, digest) in self.iter() {
            if name.contains(['\\', '\n', '\r']) {
                text.push('\\');
            }
            text.push_str(digest);
            text.push_str("  ");
            escape_name(name, &mut text);
            text.push('\n');
        }
        fs::write(path, text).map_err(|source| Error::Manifest {
            operation: "write manifest",
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads a manifest in `sha256sum` format. A leading `*` (binary mode
    /// marker) on the file name and escaped names are accepted.
    pub fn read_from(path: &Path) -> Result<Self> {
        let err = |source| Error::Manifest {
            operation: "read manifest",
            path: path.to_path_buf(),
            source,
        };
        let text = fs::read_to_string(path).map_err(err)?;

        let mut manifest = Manifest::default();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let malformed = || {
                err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed manifest line {}", lineno + 1),
                ))
            };
            let (escaped, line) = match line.strip_prefix('\\') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (digest, name) = line.split_once(' ').ok_or_else(malformed)?;
            let name = name
                .strip_prefix(' ')
                .or_else(|| name.strip_prefix('*'))
                .unwrap_or(name);
            if escaped {
                manifest.insert(unescape_name(name).ok_or_else(malformed)?, digest);
            } else {
                manifest.insert(name, digest);
            }
        }
        Ok(manifest)
    }
}

/// Files that failed verification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Present, but with different contents.
    pub mismatched: Vec<String>,
    /// Listed in the manifest but not found.
    pub missing: Vec<String>,
}

impl VerificationReport {
    pub fn is_empty(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }

    /// Every failing file name, mismatched first.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.mismatched
            .iter()
            .chain(self.missing.iter())
            .map(String::as_str)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("all files match");
        }
        let mut parts = Vec::new();
        if !self.mismatched.is_empty() {
            parts.push(format!("changed: {}", self.mismatched.join(", ")));
        }
        if !self.missing.is_empty() {
            parts.push(format!("missing: {}", self.missing.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

/// Hashes every regular file directly inside `directory`.
///
/// Subdirectories are not descended into. Symlinks to regular files are
/// followed.
pub fn generate(directory: &Path) -> Result<Manifest> {
    let err = |source| Error::Manifest {
        operation: "hash files in",
        path: directory.to_path_buf(),
        source,
    };

    let mut manifest = Manifest::default();
    for entry in fs::read_dir(directory).map_err(err)? {
        let entry = entry.map_err(err)?;
        let path = entry.path();
        if !fs::metadata(&path).map_err(err)?.is_file() {
            continue;
        }
        let name = entry.file_name().into_string().map_err(|raw| {
            err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file name {raw:?} is not valid UTF-8"),
            ))
        })?;
        let digest = hash_file(&path).map_err(err)?;
        debug!(file = %name, %digest, "hashed");
        manifest.insert(name, digest);
    }
    Ok(manifest)
}

/// Recomputes checksums for the files in `manifest` and lists differences.
///
/// An entry that is no longer a regular file counts as changed. Only I/O
/// failures other than a missing file are returned as errors.
pub fn compare(manifest: &Manifest, directory: &Path) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();
    for (name, expected) in manifest.iter() {
        let path = directory.join(name);
        if fs::metadata(&path).is_ok_and(|meta| !meta.is_file()) {
            report.mismatched.push(name.to_string());
            continue;
        }
        match hash_file(&path) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
            Ok(_) => report.mismatched.push(name.to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.missing.push(name.to_string()),
            Err(source) => {
                return Err(Error::Manifest {
                    operation: "hash",
                    path,
                    source,
                });
            }
        }
    }
    Ok(report)
}

/// Checks `directory` against `manifest`, failing with
/// [`Error::ChecksumMismatch`] if any file differs or is missing.
pub fn verify(manifest: &Manifest, directory: &Path) -> Result<()> {
    let report = compare(manifest, directory)?;
    if report.is_empty() {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch { report })
    }
}

fn escape_name(name: &str, out: &mut String) {
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

fn unescape_name(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
