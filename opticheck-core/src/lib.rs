//! The core, UI-agnostic library for the `opticheck` optical drive tester.
//!
//! `opticheck-core` checks that an optical writer really works. It stages a
//! known sample dataset, builds an ISO image from it, burns the image to a
//! disc, waits for the disc to come back mounted, and verifies every file read
//! back from the disc against checksums taken before the burn. Whatever
//! happens, the mount, the temporary workspace and the disc are released.
//!
//! The library is structured into several key modules:
//! - [`pipeline`]: The orchestrator that sequences the stages and guarantees cleanup.
//! - [`mount`]: The bounded wait for the disc to be mounted, with a self-mount fallback.
//! - [`workspace`]: The temporary working directory and sample staging.
//! - [`checksum`]: Content manifests and their verification.
//! - [`image`] and [`burn`]: The image build and the disc write.
//! - [`platform`]: Reading the operating system's mount table.
//! - [`command`]: The seam through which every external tool is run.
//!
//! The primary entry point is [`Pipeline::run`], which reports progress through
//! a [`PipelineObserver`] so the calling application can display it however it
//! chooses.
//!
//! ## Example: Running the Full Test
//!
//! ```rust,no_run
//! use opticheck_core::{
//!     BurnTarget, NoopObserver, Pipeline, ProcMounts, SystemRunner, ThreadSleeper, Timing,
//!     WorkspaceConfig,
//! };
//!
//! let config = WorkspaceConfig::default();
//! let target = BurnTarget::new("/dev/cdrom", "dvd");
//! let mounts = ProcMounts::new();
//!
//! let pipeline = Pipeline::new(
//!     &config,
//!     &target,
//!     Timing::default(),
//!     &SystemRunner,
//!     &mounts,
//!     &ThreadSleeper,
//! );
//! let result = pipeline.run(&mut NoopObserver);
//!
//! if let Some(cause) = result.cause() {
//!     eprintln!("{cause}");
//! }
//! std::process::exit(i32::from(result.exit_code()));
//! ```

pub mod burn;
pub mod checksum;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod mount;
pub mod pipeline;
pub mod platform;
pub mod workspace;

pub use checksum::{Manifest, VerificationReport};
pub use command::{CommandRunner, Sleeper, SystemRunner, ThreadSleeper, ToolCommand, ToolError};
pub use config::{Timing, WorkspaceConfig};
pub use device::{BurnTarget, MediaType};
pub use error::{Error, Result, Stage};
pub use mount::{MountState, MountWaiter};
pub use pipeline::{NoopObserver, Pipeline, PipelineObserver, PipelineResult, PipelineStatus};
pub use platform::{MountEntry, MountStatus, MountTable, ProcMounts};
pub use workspace::WorkingDirectory;
