//! Writing the image to the physical disc.
//!
//! CDs are written with `wodim`, which ejects the disc when it is done so the
//! operator can reload it. DVDs and Blu-ray discs are written as a single
//! session with `growisofs`.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::command::{CommandRunner, Sleeper, ToolCommand};
use crate::device::{BurnTarget, MediaType};
use crate::error::{Error, Result};

pub const CD_TOOL: &str = "wodim";
pub const DISC_TOOL: &str = "growisofs";

/// The write invocation for `media`.
pub fn burn_command(media: MediaType, device: &Path, image_path: &Path) -> ToolCommand {
    match media {
        MediaType::Cd => ToolCommand::new(CD_TOOL)
            .arg("-eject")
            .arg(format!("dev={}", device.display()))
            .arg_path(image_path),
        MediaType::Dvd | MediaType::Bd => {
            let mut target = device.as_os_str().to_os_string();
            target.push("=");
            target.push(image_path.as_os_str());
            ToolCommand::new(DISC_TOOL)
                .args(["-dvd-compat", "-Z"])
                .arg(target)
        }
    }
}

/// Burns `image_path` to the target's drive.
///
/// The media type is checked before anything else: an unrecognised value fails
/// with [`Error::InvalidMediaType`] without waiting or touching the device.
/// Otherwise the drive is given `settle_delay` to become ready, reported
/// through `on_settle`, before the write tool runs.
pub fn burn(
    runner: &dyn CommandRunner,
    sleeper: &dyn Sleeper,
    settle_delay: Duration,
    target: &BurnTarget,
    image_path: &Path,
    on_settle: impl FnOnce(Duration),
) -> Result<MediaType> {
    let media = target.media_type()?;
    let device = target.device.as_path();

    if !settle_delay.is_zero() {
        info!(seconds = settle_delay.as_secs(), "waiting in case the drive is not yet ready");
        on_settle(settle_delay);
        sleeper.sleep(settle_delay);
    }

    info!(device = %device.display(), %media, "beginning image burn");
    runner
        .run(&burn_command(media, device, image_path))
        .map_err(|source| Error::Burn {
            media,
            device: device.to_path_buf(),
            source,
        })?;
    Ok(media)
}
