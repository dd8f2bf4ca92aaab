use std::cell::{Cell, RefCell};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use opticheck_core::{
    BurnTarget, CommandRunner, Error, MountEntry, MountStatus, MountTable, Pipeline,
    PipelineObserver, PipelineStatus, Sleeper, Stage, Timing, ToolCommand, ToolError,
    WorkspaceConfig,
};
use tempfile::TempDir;

const DEVICE: &str = "/dev/sr0";

/// A drive simulated on the local filesystem.
///
/// Burning copies the staged sample into `disc`; the OS "mounts" the disc at
/// `disc` itself when `auto_mount` is set, and the `mount` tool copies it to
/// the requested directory otherwise.
struct FakeDrive {
    sample_dir: PathBuf,
    disc: PathBuf,
    auto_mount: bool,
    corrupt: Option<&'static str>,
    failing: Vec<&'static str>,
    panicking: Option<&'static str>,
    burned: Cell<bool>,
    commands: RefCell<Vec<ToolCommand>>,
    image_inputs: RefCell<Vec<String>>,
}

impl FakeDrive {
    fn new(fixture: &Fixture) -> Self {
        Self {
            sample_dir: fixture.config.work_dir.join(&fixture.config.sample_name),
            disc: fixture.temp.path().join("disc"),
            auto_mount: true,
            corrupt: None,
            failing: Vec::new(),
            panicking: None,
            burned: Cell::new(false),
            commands: RefCell::new(Vec::new()),
            image_inputs: RefCell::new(Vec::new()),
        }
    }

    fn programs(&self) -> Vec<String> {
        self.commands
            .borrow()
            .iter()
            .map(|c| c.program().to_string())
            .collect()
    }

    fn count(&self, program: &str) -> usize {
        self.programs().iter().filter(|p| *p == program).count()
    }

    fn command(&self, program: &str) -> Option<String> {
        self.commands
            .borrow()
            .iter()
            .find(|c| c.program() == program)
            .map(ToString::to_string)
    }
}

fn copy_files(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

impl CommandRunner for FakeDrive {
    fn run(&self, command: &ToolCommand) -> Result<(), ToolError> {
        self.commands.borrow_mut().push(command.clone());
        let program = command.program();
        if self.panicking.is_some_and(|p| p == program) {
            panic!("{program} crashed");
        }
        if self.failing.iter().any(|f| *f == program) {
            return Err(ToolError::Failed {
                program: program.to_string(),
                code: Some(1),
                stderr: format!("{program}: simulated failure"),
            });
        }

        let args: Vec<PathBuf> = command.get_args().iter().map(PathBuf::from).collect();
        match program {
            "genisoimage" => {
                *self.image_inputs.borrow_mut() = file_names(args.last().unwrap());
                let out = args.iter().position(|a| a == Path::new("-o")).unwrap() + 1;
                fs::write(&args[out], b"CD001").unwrap();
            }
            "wodim" | "growisofs" => {
                copy_files(&self.sample_dir, &self.disc);
                if let Some(name) = self.corrupt {
                    let path = self.disc.join(name);
                    let mut bytes = fs::read(&path).unwrap();
                    bytes[0] ^= 0xff;
                    fs::write(&path, bytes).unwrap();
                }
                self.burned.set(true);
            }
            "mount" => copy_files(&self.disc, &args[1]),
            _ => {}
        }
        Ok(())
    }
}

impl MountTable for FakeDrive {
    fn status(&self, device: &Path) -> MountStatus {
        if self.auto_mount && self.burned.get() && device == Path::new(DEVICE) {
            MountStatus::Mounted(MountEntry {
                device: device.to_path_buf(),
                mount_point: self.disc.clone(),
                fs_type: "iso9660".into(),
                options: vec!["ro".into()],
            })
        } else {
            MountStatus::NotMounted
        }
    }
}

#[derive(Default)]
struct VirtualClock {
    now: Cell<Duration>,
}

impl Sleeper for VirtualClock {
    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

#[derive(Default)]
struct Recorder {
    finished: Vec<(Stage, bool)>,
    polls: usize,
    cleanups: usize,
}

impl PipelineObserver for Recorder {
    fn stage_finished(&mut self, stage: Stage, error: Option<&Error>) {
        self.finished.push((stage, error.is_none()));
    }

    fn mount_poll(&mut self, _waited: Duration, _timeout: Duration) {
        self.polls += 1;
    }

    fn cleanup_started(&mut self) {
        self.cleanups += 1;
    }
}

struct Fixture {
    temp: TempDir,
    config: WorkspaceConfig,
}

impl Fixture {
    /// A sample tree of three files.
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let config = WorkspaceConfig {
            work_dir: temp.path().join("optical-test"),
            sample_source: temp.path().join("example-content"),
            sample_name: "Ubuntu_Free_Culture_Showcase".into(),
            ..WorkspaceConfig::default()
        };
        let sample = config.sample_source.join(&config.sample_name);
        fs::create_dir_all(&sample).unwrap();
        fs::write(sample.join("track1.ogg"), b"first track").unwrap();
        fs::write(sample.join("track2.ogg"), vec![0x5a; 4096]).unwrap();
        fs::write(sample.join("video.ogv"), b"moving pictures").unwrap();
        Self { temp, config }
    }

    fn target(&self, media: &str) -> BurnTarget {
        BurnTarget::from_parts(PathBuf::from(DEVICE), media)
    }
}

fn timing() -> Timing {
    Timing::default()
}

#[test]
fn cd_run_verifies_and_cleans_up() {
    let fixture = Fixture::new();
    let drive = FakeDrive::new(&fixture);
    let clock = VirtualClock::default();
    let target = fixture.target("cd");
    let mut observer = Recorder::default();

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut observer);

    assert_eq!(result.status(), PipelineStatus::Success, "{:?}", result.cause());
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.baseline.as_ref().unwrap().len(), 3);
    assert_eq!(
        *drive.image_inputs.borrow(),
        vec!["track1.ogg", "track2.ogg", "video.ogv"]
    );
    assert_eq!(drive.programs(), vec!["genisoimage", "wodim", "umount", "eject"]);
    assert!(drive.command("wodim").unwrap().starts_with("wodim -eject dev=/dev/sr0 "));
    assert_eq!(result.mount.mount_point(), Some(drive.disc.as_path()));
    assert!(!result.mount.is_self_managed());
    assert!(observer.finished.iter().all(|(_, ok)| *ok));
    assert_eq!(observer.finished.len(), Stage::ALL.len());
    assert_eq!(observer.cleanups, 1);
    assert!(!fixture.config.work_dir.exists());
}

#[test]
fn dvd_run_uses_growisofs() {
    let fixture = Fixture::new();
    let drive = FakeDrive::new(&fixture);
    let clock = VirtualClock::default();
    let target = fixture.target("dvd");

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut opticheck_core::NoopObserver);

    assert!(result.is_success());
    assert_eq!(drive.count("wodim"), 0);
    assert_eq!(drive.count("growisofs"), 1);
}

#[test]
fn unknown_media_type_fails_before_burning() {
    let fixture = Fixture::new();
    let drive = FakeDrive::new(&fixture);
    let clock = VirtualClock::default();
    let target = fixture.target("floppy");
    let mut observer = Recorder::default();

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut observer);

    assert_eq!(result.status(), PipelineStatus::StageFailure);
    assert_eq!(result.exit_code(), 1);
    assert_eq!(result.failed_stage(), Some(Stage::Burn));
    assert!(matches!(
        result.failure.as_ref().unwrap().error,
        Error::InvalidMediaType { .. }
    ));
    assert_eq!(drive.count("wodim") + drive.count("growisofs"), 0);
    assert_eq!(drive.programs(), vec!["genisoimage", "eject"]);
    assert_eq!(clock.now.get(), Duration::ZERO);
    assert_eq!(
        observer.finished,
        vec![
            (Stage::Prepare, true),
            (Stage::Stage, true),
            (Stage::Checksum, true),
            (Stage::Image, true),
            (Stage::Burn, false),
        ]
    );
    assert!(!fixture.config.work_dir.exists());
}

#[test]
fn altered_disc_content_fails_verification() {
    let fixture = Fixture::new();
    let mut drive = FakeDrive::new(&fixture);
    drive.corrupt = Some("track2.ogg");
    let clock = VirtualClock::default();
    let target = fixture.target("cd");

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut opticheck_core::NoopObserver);

    assert_eq!(result.exit_code(), 1);
    assert_eq!(result.failed_stage(), Some(Stage::Verify));
    match &result.failure.as_ref().unwrap().error {
        Error::Verification { report } => {
            assert_eq!(report.mismatched, vec!["track2.ogg".to_string()]);
            assert!(report.missing.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(result.cause().unwrap().contains("track2.ogg"));
    assert_eq!(drive.count("umount"), 1);
    assert_eq!(drive.count("eject"), 1);
    assert!(!fixture.config.work_dir.exists());
}

#[test]
fn missing_mount_falls_back_to_self_mount() {
    let fixture = Fixture::new();
    let mut drive = FakeDrive::new(&fixture);
    drive.auto_mount = false;
    let clock = VirtualClock::default();
    let target = fixture.target("bd");
    let mut observer = Recorder::default();
    let timing = timing();

    let result = Pipeline::new(&fixture.config, &target, timing, &drive, &drive, &clock)
        .run(&mut observer);

    assert!(result.is_success(), "{:?}", result.cause());
    let fallback = fixture.config.work_dir.join("mnt");
    assert_eq!(
        drive.command("mount").unwrap(),
        format!("mount /dev/sr0 {}", fallback.display())
    );
    assert_eq!(
        drive.command("umount").unwrap(),
        format!("umount {}", fallback.display())
    );
    assert!(result.mount.is_self_managed());
    assert_eq!(observer.polls, 100);
    assert!(
        clock.now.get()
            <= timing.settle_delay + timing.mount_timeout + timing.poll_interval
    );
}

#[test]
fn cleanup_runs_once_whichever_stage_fails() {
    let cases: [(&[&'static str], bool, Stage); 3] = [
        (&["genisoimage"], true, Stage::Image),
        (&["wodim"], true, Stage::Burn),
        (&["mount"], false, Stage::MountWait),
    ];

    for (failing, auto_mount, stage) in cases {
        let fixture = Fixture::new();
        let mut drive = FakeDrive::new(&fixture);
        drive.failing = failing.to_vec();
        drive.auto_mount = auto_mount;
        let clock = VirtualClock::default();
        let target = fixture.target("cd");
        let mut observer = Recorder::default();

        let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
            .run(&mut observer);

        assert_eq!(result.failed_stage(), Some(stage));
        assert_eq!(result.exit_code(), 1);
        assert_eq!(drive.count("eject"), 1, "stage {stage}");
        assert_eq!(observer.cleanups, 1);
        assert_eq!(drive.count("umount"), 0, "nothing was mounted at {stage}");
        assert!(!fixture.config.work_dir.exists());
    }
}

#[test]
fn missing_sample_fails_staging() {
    let fixture = Fixture::new();
    let config = WorkspaceConfig {
        sample_name: "Not_There".into(),
        ..fixture.config.clone()
    };
    let drive = FakeDrive::new(&fixture);
    let clock = VirtualClock::default();
    let target = fixture.target("cd");

    let result = Pipeline::new(&config, &target, timing(), &drive, &drive, &clock)
        .run(&mut opticheck_core::NoopObserver);

    assert_eq!(result.failed_stage(), Some(Stage::Stage));
    assert!(matches!(
        result.failure.as_ref().unwrap().error,
        Error::Staging { .. }
    ));
    assert_eq!(drive.programs(), vec!["eject"]);
}

#[test]
fn cleanup_failure_alone_fails_the_run() {
    let fixture = Fixture::new();
    let mut drive = FakeDrive::new(&fixture);
    drive.failing = vec!["eject"];
    let clock = VirtualClock::default();
    let target = fixture.target("cd");

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut opticheck_core::NoopObserver);

    assert_eq!(result.status(), PipelineStatus::CleanupFailure);
    assert_eq!(result.exit_code(), 1);
    assert!(result.failure.is_none());
    assert_eq!(result.cleanup_errors.len(), 1);
    assert!(result.cause().unwrap().contains("eject"));
}

#[test]
fn cleanup_failure_keeps_first_cause() {
    let fixture = Fixture::new();
    let mut drive = FakeDrive::new(&fixture);
    drive.failing = vec!["genisoimage", "eject"];
    let clock = VirtualClock::default();
    let target = fixture.target("cd");

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut opticheck_core::NoopObserver);

    assert_eq!(result.status(), PipelineStatus::StageFailure);
    assert_eq!(result.failed_stage(), Some(Stage::Image));
    assert_eq!(result.cleanup_errors.len(), 1);
    assert!(result.cause().unwrap().starts_with("Image stage failed"));
}

#[test]
fn failed_unmount_of_self_mount_keeps_workspace() {
    let fixture = Fixture::new();
    let mut drive = FakeDrive::new(&fixture);
    drive.auto_mount = false;
    drive.failing = vec!["umount"];
    let clock = VirtualClock::default();
    let target = fixture.target("cd");

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut opticheck_core::NoopObserver);

    assert_eq!(result.status(), PipelineStatus::CleanupFailure);
    assert_eq!(result.cleanup_errors.len(), 2);
    assert!(fixture.config.work_dir.exists());
    assert_eq!(drive.count("eject"), 1);
}

#[test]
fn cancelled_run_still_cleans_up() {
    let fixture = Fixture::new();
    let drive = FakeDrive::new(&fixture);
    let clock = VirtualClock::default();
    let target = fixture.target("cd");
    let running = AtomicBool::new(false);

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .with_cancel_flag(&running)
        .run(&mut opticheck_core::NoopObserver);

    assert_eq!(result.failed_stage(), Some(Stage::Prepare));
    assert!(matches!(
        result.failure.as_ref().unwrap().error,
        Error::Cancelled
    ));
    assert_eq!(drive.programs(), vec!["eject"]);
}

#[test]
fn empty_sample_fails_checksum_stage() {
    let fixture = Fixture::new();
    let sample = fixture.config.sample_source.join(&fixture.config.sample_name);
    for entry in fs::read_dir(&sample).unwrap() {
        fs::remove_file(entry.unwrap().path()).unwrap();
    }
    let drive = FakeDrive::new(&fixture);
    let clock = VirtualClock::default();
    let target = fixture.target("cd");
    let mut observer = Recorder::default();

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut observer);

    assert_eq!(result.failed_stage(), Some(Stage::Checksum));
    assert!(matches!(
        result.failure.as_ref().unwrap().error,
        Error::Manifest { .. }
    ));
    assert!(result.baseline.is_none());
    assert_eq!(drive.programs(), vec!["eject"]);
    assert_eq!(observer.cleanups, 1);
    assert!(!fixture.config.work_dir.exists());
}

#[test]
fn populated_work_dir_is_left_untouched() {
    let fixture = Fixture::new();
    fs::create_dir_all(&fixture.config.work_dir).unwrap();
    let thesis = fixture.config.work_dir.join("thesis.tex");
    fs::write(&thesis, b"\\chapter{One}").unwrap();
    let drive = FakeDrive::new(&fixture);
    let clock = VirtualClock::default();
    let target = fixture.target("floppy");

    let result = Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
        .run(&mut opticheck_core::NoopObserver);

    assert_eq!(result.exit_code(), 1);
    assert_eq!(result.failed_stage(), Some(Stage::Prepare));
    assert!(matches!(
        result.failure.as_ref().unwrap().error,
        Error::Workspace { .. }
    ));
    assert!(result.cleanup_errors.is_empty());
    assert_eq!(drive.programs(), vec!["eject"]);
    assert_eq!(fs::read(&thesis).unwrap(), b"\\chapter{One}");
}

#[test]
fn panicking_stage_still_cleans_up_once() {
    let fixture = Fixture::new();
    let mut drive = FakeDrive::new(&fixture);
    drive.panicking = Some("wodim");
    let clock = VirtualClock::default();
    let target = fixture.target("cd");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        Pipeline::new(&fixture.config, &target, timing(), &drive, &drive, &clock)
            .run(&mut opticheck_core::NoopObserver)
    }));

    assert!(outcome.is_err());
    assert_eq!(drive.programs(), vec!["genisoimage", "wodim", "eject"]);
    assert!(!fixture.config.work_dir.exists());
}
