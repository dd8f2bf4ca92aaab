//! Building the ISO-9660 image that gets burned.

use std::path::Path;

use tracing::info;

use crate::command::{CommandRunner, ToolCommand};
use crate::error::{Error, Result};

pub const IMAGE_TOOL: &str = "genisoimage";

/// The image tool invocation: ISO-9660 with Rock Ridge and Joliet extensions,
/// file names read as UTF-8.
pub fn build_command(source_directory: &Path, image_path: &Path) -> ToolCommand {
    ToolCommand::new(IMAGE_TOOL)
        .args(["-input-charset", "UTF-8", "-r", "-J", "-o"])
        .arg_path(image_path)
        .arg_path(source_directory)
}

/// Builds an image rooted at `source_directory` and writes it to `image_path`.
///
/// On failure the image file, if any, must not be used.
pub fn build(runner: &dyn CommandRunner, source_directory: &Path, image_path: &Path) -> Result<()> {
    info!(source = %source_directory.display(), image = %image_path.display(), "creating ISO image");
    runner
        .run(&build_command(source_directory, image_path))
        .map_err(|source| Error::ImageBuild {
            image: image_path.to_path_buf(),
            source,
        })
}
