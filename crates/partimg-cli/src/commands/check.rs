//! Check command - verifies every checksum in an image without writing

use anyhow::{Context, Result};

use super::GlobalOptions;
use crate::device::open_image_reader;

/// Execute the check command
pub fn execute(image_path: &str, opts: &GlobalOptions) -> Result<()> {
    let mut image = open_image_reader(image_path)?;

    let mut engine = opts.engine(opts.settings.engine.to_config());
    engine
        .check(&mut *image)
        .with_context(|| format!("Image {} failed verification", image_path))?;

    Ok(())
}
