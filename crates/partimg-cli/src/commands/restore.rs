//! Restore command - writes an image back onto a device

use anyhow::{Context, Result};

use super::GlobalOptions;
use crate::device::{open_image_reader, open_target};

/// Arguments for the restore command
pub struct RestoreArgs {
    /// Image path, `-` for stdin
    pub image: String,
    /// Device or file to restore onto, `-` for stdout
    pub target: String,
    /// Allow a target smaller than the imaged device
    pub no_size_check: bool,
}

/// Execute the restore command
pub fn execute(args: RestoreArgs, opts: &GlobalOptions) -> Result<()> {
    opts.ensure_stdout_free(&args.target, "restored data")?;
    opts.warn_privileges(&[&args.target]);

    let engine_settings = &opts.settings.engine;
    let config = engine_settings
        .to_config()
        .check_size(engine_settings.check_size && !args.no_size_check);

    let mut image = open_image_reader(&args.image)?;
    let mut target = open_target(&args.target)?;

    tracing::info!("Restoring {} onto {}", args.image, args.target);
    let mut engine = opts.engine(config);
    engine
        .restore(&mut *image, &mut *target)
        .with_context(|| format!("Failed to restore {}", args.image))?;

    Ok(())
}
