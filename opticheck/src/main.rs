use anyhow::Result;
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use opticheck_core::config::{
    DEFAULT_DEVICE, DEFAULT_IMAGE_NAME, DEFAULT_MANIFEST_NAME, DEFAULT_MEDIA_TYPE,
    DEFAULT_SAMPLE_NAME, DEFAULT_SAMPLE_SOURCE, DEFAULT_WORK_DIR,
};
use opticheck_core::{
    BurnTarget, Error, Pipeline, PipelineObserver, PipelineResult, PipelineStatus, ProcMounts,
    Stage, SystemRunner, ThreadSleeper, Timing, WorkspaceConfig,
};
use std::io::{IsTerminal, stderr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "opticheck")]
#[command(
    about = "Burn sample data to an optical disc and verify it bit-for-bit",
    version
)]
struct Cli {
    /// Optical drive to test (symlinks are resolved)
    #[arg(default_value = DEFAULT_DEVICE)]
    device: PathBuf,

    /// Media type loaded in the drive: cd, dvd or bd
    #[arg(default_value = DEFAULT_MEDIA_TYPE)]
    media_type: String,

    /// Temporary working directory, removed when the run ends (must be absent or empty)
    #[arg(long, default_value = DEFAULT_WORK_DIR)]
    work_dir: PathBuf,

    /// Directory containing the sample data
    #[arg(long, default_value = DEFAULT_SAMPLE_SOURCE)]
    sample_path: PathBuf,

    /// Name of the sample directory inside --sample-path
    #[arg(long, default_value = DEFAULT_SAMPLE_NAME)]
    sample_name: String,

    /// Seconds to let the drive settle before burning
    #[arg(long, default_value_t = 10)]
    settle_secs: u64,

    /// Seconds to wait for the burned disc to be mounted
    #[arg(long, default_value_t = 300)]
    mount_timeout_secs: u64,

    /// Seconds between mount checks
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_secs: u64,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            work_dir: self.work_dir.clone(),
            sample_source: self.sample_path.clone(),
            sample_name: self.sample_name.clone(),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
        }
    }

    fn timing(&self) -> Timing {
        Timing {
            settle_delay: Duration::from_secs(self.settle_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            mount_timeout: Duration::from_secs(self.mount_timeout_secs),
        }
    }
}

/// Installs the log subscriber. `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8) -> Result<()> {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))
}

/// Renders pipeline progress as one spinner per stage.
struct ProgressObserver {
    current: Option<ProgressBar>,
    enabled: bool,
}

impl ProgressObserver {
    fn new() -> Self {
        Self {
            current: None,
            enabled: stderr().is_terminal(),
        }
    }

    fn spinner(&self, stage: Stage) -> ProgressBar {
        let pb = if self.enabled {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        pb.set_prefix(stage.label());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

impl PipelineObserver for ProgressObserver {
    fn stage_started(&mut self, stage: Stage) {
        let pb = self.spinner(stage);
        pb.set_message(match stage {
            Stage::Prepare => "Creating working directory ...",
            Stage::Stage => "Copying sample files ...",
            Stage::Checksum => "Generating checksums of sample files ...",
            Stage::Image => "Creating ISO image ...",
            Stage::Burn => "Burning image ...",
            Stage::MountWait => "Waiting for the disc to be mounted ...",
            Stage::Verify => "Copying files back from the disc and checking them ...",
        });
        self.current = Some(pb);
    }

    fn stage_finished(&mut self, _stage: Stage, error: Option<&Error>) {
        if let Some(pb) = self.current.take() {
            match error {
                None => pb.finish_with_message(format!("{}", style("done").green())),
                Some(_) => pb.finish_with_message(format!("{}", style("failed").red())),
            }
        }
    }

    fn settling(&mut self, delay: Duration) {
        if let Some(pb) = &self.current {
            pb.set_message(format!(
                "Waiting {}s in case the drive is not yet ready ...",
                delay.as_secs()
            ));
        }
    }

    fn mount_poll(&mut self, waited: Duration, timeout: Duration) {
        if let Some(pb) = &self.current {
            pb.set_message(format!(
                "Reload the disc if it was ejected. Waiting for mount ({}s / {}s)",
                waited.as_secs(),
                timeout.as_secs()
            ));
        }
    }

    fn cleanup_started(&mut self) {
        if let Some(pb) = self.current.take() {
            pb.finish_and_clear();
        }
    }
}

fn report(result: &PipelineResult, target: &BurnTarget) {
    match result.status() {
        PipelineStatus::Success => {
            let files = result.baseline.as_ref().map_or(0, |m| m.len());
            println!(
                "\n✨ {} verified: {} files read back from {} match the original.",
                style("Disc").green().bold(),
                files,
                style(target.device.display()).cyan()
            );
        }
        PipelineStatus::StageFailure | PipelineStatus::CleanupFailure => {
            if let Some(cause) = result.cause() {
                eprintln!("\n{} {}", style("ERROR:").red().bold(), cause);
            }
            // The first cleanup error is already the cause when no stage failed.
            let skip = usize::from(result.failure.is_none());
            for err in result.cleanup_errors.iter().skip(skip) {
                eprintln!(
                    "{} {}",
                    style("CLEANUP:").yellow().bold(),
                    opticheck_core::error::display_chain(err)
                );
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("failed to initialise logging: {e}");
    }

    // This flag allows a Ctrl+C to stop the run while still cleaning up.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
    }

    let config = cli.workspace_config();
    let target = BurnTarget::new(&cli.device, cli.media_type.clone());

    println!("Testing optical drive:");
    println!("  Device: {}", style(target.device.display()).cyan());
    println!("  Media:  {}", style(target.media_label()).cyan());
    println!("  Sample: {}", style(config.sample_source.join(&config.sample_name).display()).cyan());
    println!();

    let runner = SystemRunner;
    let mounts = ProcMounts::new();
    let sleeper = ThreadSleeper;
    let pipeline = Pipeline::new(&config, &target, cli.timing(), &runner, &mounts, &sleeper)
        .with_cancel_flag(&running);

    let mut observer = ProgressObserver::new();
    let result = pipeline.run(&mut observer);

    report(&result, &target);
    ExitCode::from(result.exit_code())
}
