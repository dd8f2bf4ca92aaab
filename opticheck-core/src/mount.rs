//! Waiting for the burned disc to come back mounted.
//!
//! After a burn the operator may need minutes to reload the disc, and the OS
//! mounts it on its own schedule. [`MountWaiter`] polls the mount table at a
//! fixed interval up to a ceiling, then settles the outcome:
//!
//! ```text
//! Waiting ──► Detected ─┐                   ┌──► Ready (discovered)
//!        └──► TimedOut ─┴─► re-check table ─┤
//!                                           └──► SelfMounting ──► Ready (self-managed)
//!                                                             └──► MountFailed
//! ```
//!
//! A timeout is not a failure. It only means the mount has to be done here.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{CommandRunner, Sleeper, ToolCommand};
use crate::error::{BoxError, Error, Result};
use crate::platform::{MountStatus, MountTable};

pub const MOUNT_TOOL: &str = "mount";

/// Where the disc ended up mounted and who owns that mount.
///
/// Empty until the mount wait completes; set at most once per run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountState {
    mount_point: Option<PathBuf>,
    self_managed: bool,
}

impl MountState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, mount_point: PathBuf, self_managed: bool) -> Result<()> {
        if let Some(existing) = &self.mount_point {
            return Err(Error::MountAlreadyRecorded {
                existing: existing.clone(),
            });
        }
        self.mount_point = Some(mount_point);
        self.self_managed = self_managed;
        Ok(())
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    /// `true` if this run created the mount, `false` if it was discovered.
    pub fn is_self_managed(&self) -> bool {
        self.self_managed
    }
}

/// How the polling phase ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detection {
    Detected { polls: u32, waited: Duration },
    TimedOut { polls: u32, waited: Duration },
}

/// Bounded poll for a device becoming mounted, with a self-mount fallback.
pub struct MountWaiter<'a> {
    table: &'a dyn MountTable,
    runner: &'a dyn CommandRunner,
    sleeper: &'a dyn Sleeper,
    interval: Duration,
    timeout: Duration,
    running: Option<&'a AtomicBool>,
}

impl<'a> MountWaiter<'a> {
    pub fn new(
        table: &'a dyn MountTable,
        runner: &'a dyn CommandRunner,
        sleeper: &'a dyn Sleeper,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            table,
            runner,
            sleeper,
            interval,
            timeout,
            running: None,
        }
    }

    /// Aborts the wait with [`Error::Cancelled`] once `running` is cleared.
    pub fn with_cancel_flag(mut self, running: &'a AtomicBool) -> Self {
        self.running = Some(running);
        self
    }

    /// Waits for `device`, then records its mount point in `state`.
    ///
    /// `fallback` is created and used if the device is not mounted by the time
    /// the wait ends. `on_poll` receives the elapsed wait after every poll.
    pub fn run(
        &self,
        device: &Path,
        fallback: &Path,
        state: &mut MountState,
        on_poll: impl FnMut(Duration),
    ) -> Result<PathBuf> {
        match self.wait(device, on_poll)? {
            Detection::Detected { polls, waited } => {
                info!(polls, seconds = waited.as_secs(), "drive appears to be mounted now");
            }
            Detection::TimedOut { waited, .. } => {
                let timeout = Error::MountTimeout {
                    device: device.to_path_buf(),
                    waited,
                };
                warn!(error = %timeout, "no mount detected, continuing with best effort");
            }
        }
        self.settle(device, fallback, state)
    }

    /// The polling phase: sleep one interval, check, repeat until the device
    /// shows up or the accumulated wait reaches the ceiling.
    pub fn wait(&self, device: &Path, mut on_poll: impl FnMut(Duration)) -> Result<Detection> {
        info!(
            device = %device.display(),
            seconds = self.timeout.as_secs(),
            "waiting for the drive to be mounted"
        );
        let mut waited = Duration::ZERO;
        let mut polls = 0u32;
        loop {
            self.check_cancelled()?;
            self.sleeper.sleep(self.interval);
            waited += self.interval;
            polls += 1;

            self.check_cancelled()?;
            let status = self.table.status(device);
            on_poll(waited);
            match status {
                MountStatus::Mounted(_) => return Ok(Detection::Detected { polls, waited }),
                MountStatus::NotMounted => {}
                MountStatus::CheckFailed(err) => {
                    debug!(error = %err, "mount table check failed, still waiting");
                }
            }

            if waited >= self.timeout || self.interval.is_zero() {
                return Ok(Detection::TimedOut { polls, waited });
            }
        }
    }

    /// Re-checks the mount table for `device` and either records the existing
    /// mount or mounts the device at `fallback` itself.
    pub fn settle(&self, device: &Path, fallback: &Path, state: &mut MountState) -> Result<PathBuf> {
        match self.table.status(device) {
            MountStatus::Mounted(entry) => {
                info!(mount_point = %entry.mount_point.display(), "disk is mounted");
                state.record(entry.mount_point.clone(), false)?;
                Ok(entry.mount_point)
            }
            status => {
                if let MountStatus::CheckFailed(err) = &status {
                    warn!(error = %err, "could not read the mount table, mounting directly");
                }
                self.self_mount(device, fallback, state)
            }
        }
    }

    fn self_mount(&self, device: &Path, fallback: &Path, state: &mut MountState) -> Result<PathBuf> {
        info!(
            device = %device.display(),
            mount_point = %fallback.display(),
            "attempting best effort to mount the drive"
        );
        let fail = |source: BoxError| Error::Mount {
            device: device.to_path_buf(),
            mount_point: fallback.to_path_buf(),
            source,
        };

        fs::create_dir_all(fallback).map_err(|e| fail(e.into()))?;
        let command = ToolCommand::new(MOUNT_TOOL).arg_path(device).arg_path(fallback);
        self.runner.run(&command).map_err(|e| fail(e.into()))?;

        state.record(fallback.to_path_buf(), true)?;
        Ok(fallback.to_path_buf())
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.running {
            Some(flag) if !flag.load(Ordering::SeqCst) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}
