//! The write-and-verify pipeline.
//!
//! [`Pipeline::run`] sequences the stages, stops at the first failure, and
//! always releases what the run acquired: the mount, the workspace and the
//! loaded disc. Cleanup is owned by a guard that runs it exactly once, either
//! explicitly at the end of the run or from `Drop` if the run unwinds.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::burn;
use crate::checksum::{self, Manifest};
use crate::command::{CommandRunner, Sleeper, ToolCommand};
use crate::config::{Timing, WorkspaceConfig};
use crate::device::BurnTarget;
use crate::error::{Error, Result, Stage, display_chain};
use crate::image;
use crate::mount::{MountState, MountWaiter};
use crate::platform::MountTable;
use crate::workspace::{self, WorkingDirectory};

pub const UNMOUNT_TOOL: &str = "umount";
pub const EJECT_TOOL: &str = "eject";

/// Progress hooks for front-ends. Every method defaults to doing nothing.
pub trait PipelineObserver {
    fn stage_started(&mut self, _stage: Stage) {}
    fn stage_finished(&mut self, _stage: Stage, _error: Option<&Error>) {}
    /// The drive is being given `delay` to settle before the burn.
    fn settling(&mut self, _delay: Duration) {}
    /// One mount-table poll completed after `waited` out of `timeout`.
    fn mount_poll(&mut self, _waited: Duration, _timeout: Duration) {}
    fn cleanup_started(&mut self) {}
}

/// An observer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// The first stage that failed and why.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: Error,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, display_chain(&self.error))
    }
}

/// Terminal status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Success,
    /// A stage failed. Cleanup may also have failed.
    StageFailure,
    /// Every stage passed but cleanup did not.
    CleanupFailure,
}

/// Everything a front-end needs to report the outcome of a run.
#[derive(Debug)]
pub struct PipelineResult {
    /// The first stage failure, if any. Never replaced by cleanup errors.
    pub failure: Option<StageFailure>,
    pub cleanup_errors: Vec<Error>,
    /// The manifest taken before burning, once that stage has passed.
    pub baseline: Option<Manifest>,
    /// Where the disc was mounted for verification.
    pub mount: MountState,
}

impl PipelineResult {
    pub fn status(&self) -> PipelineStatus {
        if self.failure.is_some() {
            PipelineStatus::StageFailure
        } else if !self.cleanup_errors.is_empty() {
            PipelineStatus::CleanupFailure
        } else {
            PipelineStatus::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == PipelineStatus::Success
    }

    /// Process exit code: 0 on full success, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        self.failure.as_ref().map(|f| f.stage)
    }

    /// Human-readable cause: the stage failure if there was one, otherwise the
    /// first cleanup error.
    pub fn cause(&self) -> Option<String> {
        match (&self.failure, self.cleanup_errors.first()) {
            (Some(failure), _) => Some(failure.to_string()),
            (None, Some(err)) => Some(display_chain(err)),
            (None, None) => None,
        }
    }
}

/// One write-and-verify run against one drive.
pub struct Pipeline<'a> {
    config: &'a WorkspaceConfig,
    target: &'a BurnTarget,
    timing: Timing,
    runner: &'a dyn CommandRunner,
    table: &'a dyn MountTable,
    sleeper: &'a dyn Sleeper,
    running: Option<&'a AtomicBool>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a WorkspaceConfig,
        target: &'a BurnTarget,
        timing: Timing,
        runner: &'a dyn CommandRunner,
        table: &'a dyn MountTable,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            config,
            target,
            timing,
            runner,
            table,
            sleeper,
            running: None,
        }
    }

    /// Stops the run at the next stage boundary or mount poll once `running`
    /// is cleared. Cleanup still runs.
    pub fn with_cancel_flag(mut self, running: &'a AtomicBool) -> Self {
        self.running = Some(running);
        self
    }

    /// Runs every stage, then cleans up, and reports the outcome.
    pub fn run<O: PipelineObserver + ?Sized>(&self, observer: &mut O) -> PipelineResult {
        info!(drive = %self.target, work_dir = %self.config.work_dir.display(), "starting optical write test");

        let mut session = Session::new(&self.config.work_dir, &self.target.device, self.runner);
        let mut baseline = None;
        let outcome = self.run_stages(&mut session, observer, &mut baseline);

        if let Err(failure) = &outcome {
            warn!(stage = %failure.stage, "attempting to clean up after failure");
        }
        observer.cleanup_started();
        let (mount, cleanup_errors) = session.finish();

        let result = PipelineResult {
            failure: outcome.err(),
            cleanup_errors,
            baseline,
            mount,
        };
        match result.status() {
            PipelineStatus::Success => info!("optical write test passed"),
            status => error!(?status, cause = %result.cause().unwrap_or_default(), "optical write test failed"),
        }
        result
    }

    fn run_stages<O: PipelineObserver + ?Sized>(
        &self,
        session: &mut Session<'_>,
        observer: &mut O,
        baseline: &mut Option<Manifest>,
    ) -> std::result::Result<(), StageFailure> {
        let dir = self.step(Stage::Prepare, observer, |_| workspace::prepare(self.config))?;
        session.workspace_owned = true;

        self.step(Stage::Stage, observer, |_| {
            workspace::stage(&dir, &self.config.sample_source, &self.config.sample_name)
        })?;

        let manifest = self.step(Stage::Checksum, observer, |_| record_baseline(&dir))?;
        *baseline = Some(manifest);

        self.step(Stage::Image, observer, |_| {
            image::build(self.runner, &dir.sample_dir(), &dir.image_path())
        })?;

        self.step(Stage::Burn, observer, |obs| {
            burn::burn(
                self.runner,
                self.sleeper,
                self.timing.settle_delay,
                self.target,
                &dir.image_path(),
                |delay| obs.settling(delay),
            )
        })?;

        let mount_point = self.step(Stage::MountWait, observer, |obs| {
            let timeout = self.timing.mount_timeout;
            let mut waiter = MountWaiter::new(
                self.table,
                self.runner,
                self.sleeper,
                self.timing.poll_interval,
                timeout,
            );
            if let Some(flag) = self.running {
                waiter = waiter.with_cancel_flag(flag);
            }
            waiter.run(
                &self.target.device,
                &dir.fallback_mount_point(),
                &mut session.mount,
                |waited| obs.mount_poll(waited, timeout),
            )
        })?;

        self.step(Stage::Verify, observer, |_| {
            // The local copy goes first so only data read off the disc can pass.
            workspace::remove_sample(&dir)?;
            workspace::copy_back(&mount_point, &dir)?;
            let expected = Manifest::read_from(&dir.manifest_path())?;
            checksum::verify(&expected, &dir.sample_dir()).map_err(|err| match err {
                Error::ChecksumMismatch { report } => Error::Verification { report },
                other => other,
            })?;
            info!(files = expected.len(), "disc contents match the original data");
            Ok(())
        })
    }

    fn step<T, O, F>(
        &self,
        stage: Stage,
        observer: &mut O,
        f: F,
    ) -> std::result::Result<T, StageFailure>
    where
        O: PipelineObserver + ?Sized,
        F: FnOnce(&mut O) -> Result<T>,
    {
        if self.running.is_some_and(|flag| !flag.load(Ordering::SeqCst)) {
            return Err(StageFailure {
                stage,
                error: Error::Cancelled,
            });
        }

        observer.stage_started(stage);
        let result = info_span!("stage", %stage).in_scope(|| f(&mut *observer));
        observer.stage_finished(stage, result.as_ref().err());

        result.map_err(|error| {
            error!(%stage, error = %display_chain(&error), "stage failed");
            StageFailure { stage, error }
        })
    }
}

/// Hashes the staged sample, persists the manifest, and checks the staged
/// files against the persisted copy before anything is burned.
fn record_baseline(dir: &WorkingDirectory) -> Result<Manifest> {
    let sample_dir = dir.sample_dir();
    let manifest = checksum::generate(&sample_dir)?;
    if manifest.is_empty() {
        return Err(Error::Manifest {
            operation: "find files to checksum in",
            path: sample_dir,
            source: io::Error::new(io::ErrorKind::InvalidData, "sample contains no files"),
        });
    }
    manifest.write_to(&dir.manifest_path())?;
    checksum::verify(&Manifest::read_from(&dir.manifest_path())?, &sample_dir)?;
    info!(files = manifest.len(), "baseline checksums recorded");
    Ok(manifest)
}

/// Owns the resources a run acquires and releases them exactly once.
struct Session<'a> {
    work_dir: &'a Path,
    device: &'a Path,
    runner: &'a dyn CommandRunner,
    mount: MountState,
    /// Set once `prepare` has claimed the workspace; only then is it removed.
    workspace_owned: bool,
    cleaned: bool,
}

impl<'a> Session<'a> {
    fn new(work_dir: &'a Path, device: &'a Path, runner: &'a dyn CommandRunner) -> Self {
        Self {
            work_dir,
            device,
            runner,
            mount: MountState::new(),
            workspace_owned: false,
            cleaned: false,
        }
    }

    /// Runs cleanup and hands back the mount state it released.
    fn finish(mut self) -> (MountState, Vec<Error>) {
        let errors = self.cleanup();
        (std::mem::take(&mut self.mount), errors)
    }

    /// Unmounts, removes the workspace, and ejects the disc. Every step is
    /// attempted even if an earlier one fails.
    fn cleanup(&mut self) -> Vec<Error> {
        if self.cleaned {
            return Vec::new();
        }
        self.cleaned = true;
        info!("cleaning up");

        let mut errors = Vec::new();
        let mut mount_released = true;

        if let Some(mount_point) = self.mount.mount_point() {
            info!(
                mount_point = %mount_point.display(),
                self_managed = self.mount.is_self_managed(),
                "unmounting disc"
            );
            let command = ToolCommand::new(UNMOUNT_TOOL).arg_path(mount_point);
            if let Err(e) = self.runner.run(&command) {
                mount_released = false;
                errors.push(Error::Cleanup {
                    step: "unmount the disc",
                    source: e.into(),
                });
            }
        }

        let mount_inside_workspace = self
            .mount
            .mount_point()
            .is_some_and(|p| p.starts_with(self.work_dir));
        if !self.workspace_owned {
            debug!(path = %self.work_dir.display(), "workspace was never claimed, leaving it alone");
        } else if !mount_released && mount_inside_workspace {
            // Removing the tree now would descend into the still-mounted disc.
            errors.push(Error::Cleanup {
                step: "remove the workspace",
                source: format!("{} is still mounted", self.work_dir.display()).into(),
            });
        } else {
            info!(path = %self.work_dir.display(), "removing workspace");
            match fs::remove_dir_all(self.work_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => errors.push(Error::Cleanup {
                    step: "remove the workspace",
                    source: e.into(),
                }),
            }
        }

        info!(device = %self.device.display(), "ejecting spent media");
        let command = ToolCommand::new(EJECT_TOOL).arg_path(self.device);
        if let Err(e) = self.runner.run(&command) {
            errors.push(Error::Cleanup {
                step: "eject the disc",
                source: e.into(),
            });
        }

        for err in &errors {
            error!(error = %display_chain(err), "cleanup step failed");
        }
        errors
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // Only reached without `finish` when a stage panicked.
        self.cleanup();
    }
}
