//! The temporary working directory and the sample data staged in it.
//!
//! Stages receive a [`WorkingDirectory`] handle instead of relying on the
//! process's current directory, which is never changed.

use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::WorkspaceConfig;
use crate::error::{Error, Result};

/// Name of the fallback mount point created inside the workspace.
pub const FALLBACK_MOUNT_DIR: &str = "mnt";

const WRITE_PROBE: &str = ".opticheck-write-probe";

/// Handle to a prepared working directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingDirectory {
    root: PathBuf,
    sample_name: String,
    manifest_name: String,
    image_name: String,
}

impl WorkingDirectory {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the sample tree is staged, and later re-populated from the disc.
    pub fn sample_dir(&self) -> PathBuf {
        self.root.join(&self.sample_name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.manifest_name)
    }

    pub fn image_path(&self) -> PathBuf {
        self.root.join(&self.image_name)
    }

    /// Where the disc is mounted if the system does not mount it on its own.
    pub fn fallback_mount_point(&self) -> PathBuf {
        self.root.join(FALLBACK_MOUNT_DIR)
    }
}

/// Creates the working directory if needed and checks that it is writable.
///
/// The whole directory is deleted when the run ends, so an existing directory
/// is only accepted if it is empty.
pub fn prepare(config: &WorkspaceConfig) -> Result<WorkingDirectory> {
    let root = &config.work_dir;
    let err = |operation, source| Error::Workspace {
        operation,
        path: root.clone(),
        source,
    };

    fs::create_dir_all(root).map_err(|e| err("create", e))?;
    if !fs::metadata(root).map_err(|e| err("inspect", e))?.is_dir() {
        return Err(err(
            "use",
            io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
        ));
    }
    if fs::read_dir(root)
        .map_err(|e| err("inspect", e))?
        .next()
        .is_some()
    {
        return Err(err(
            "claim",
            io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                "directory is not empty; refusing to use it as scratch space",
            ),
        ));
    }

    let probe = root.join(WRITE_PROBE);
    File::create(&probe).map_err(|e| err("write to", e))?;
    fs::remove_file(&probe).map_err(|e| err("write to", e))?;

    info!(path = %root.display(), "workspace ready");
    Ok(WorkingDirectory {
        root: root.clone(),
        sample_name: config.sample_name.clone(),
        manifest_name: config.manifest_name.clone(),
        image_name: config.image_name.clone(),
    })
}

/// Copies `source_path/sample_name` into the workspace, preserving permission
/// modes and access/modification times.
pub fn stage(handle: &WorkingDirectory, source_path: &Path, sample_name: &str) -> Result<()> {
    let source = source_path.join(sample_name);
    let dest = handle.root().join(sample_name);
    info!(from = %source.display(), to = %dest.display(), "staging sample data");
    copy_tree(&source, &dest, true).map_err(|source_err| Error::Staging {
        path: source,
        source: source_err,
    })
}

/// Deletes the local copy of the sample so only data read from the disc can
/// be verified.
pub fn remove_sample(handle: &WorkingDirectory) -> Result<()> {
    let dir = handle.sample_dir();
    info!(path = %dir.display(), "deleting original data files");
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::Workspace {
            operation: "remove sample from",
            path: dir,
            source,
        }),
    }
}

/// Copies every entry under `mount_point` into the workspace sample directory.
///
/// Attributes are not preserved: discs mastered with Rock Ridge carry
/// read-only directory modes that would block removing the workspace later.
pub fn copy_back(mount_point: &Path, handle: &WorkingDirectory) -> Result<()> {
    let dest = handle.sample_dir();
    info!(from = %mount_point.display(), to = %dest.display(), "copying files from disc");
    copy_tree(mount_point, &dest, false).map_err(|source| Error::CopyBack {
        mount_point: mount_point.to_path_buf(),
        source,
    })
}

fn copy_tree(source: &Path, dest: &Path, preserve: bool) -> io::Result<()> {
    if !fs::metadata(source)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotADirectory,
            format!("{} is not a directory", source.display()),
        ));
    }

    // Directory attributes are applied after their contents are written, deepest
    // first, so read-only or timestamped directories end up as in the source.
    let mut dirs = Vec::new();

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            if preserve {
                dirs.push((entry.path().to_path_buf(), target.clone()));
            }
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(&link, &target)?;
        } else {
            if fs::symlink_metadata(&target).is_ok_and(|m| m.permissions().readonly()) {
                fs::remove_file(&target)?;
            }
            // fs::copy carries the permission bits over.
            fs::copy(entry.path(), &target)?;
            if preserve {
                copy_times(entry.path(), &target)?;
            }
        }
        debug!(path = %target.display(), "copied");
    }

    for (from, to) in dirs.iter().rev() {
        fs::set_permissions(to, fs::metadata(from)?.permissions())?;
        copy_times(from, to)?;
    }
    Ok(())
}

fn copy_times(from: &Path, to: &Path) -> io::Result<()> {
    let meta = fs::metadata(from)?;
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    File::open(to)?.set_times(times)
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}
