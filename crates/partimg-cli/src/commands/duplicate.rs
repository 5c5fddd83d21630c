//! Duplicate command - copies the used blocks of one device onto another

use anyhow::{Context, Result};
use partimg_core::RawProvider;

use super::GlobalOptions;
use crate::device::{open_target, DeviceHandle};

/// Arguments for the duplicate command
pub struct DuplicateArgs {
    /// Device or file to copy from
    pub source: String,
    /// Device or file to copy onto, `-` for stdout
    pub target: String,
    /// Block size override for raw copying
    pub block_size: Option<u32>,
    /// Re-read failed blocks sector by sector
    pub rescue: bool,
    /// Allow a target smaller than the source device
    pub no_size_check: bool,
}

/// Execute the duplicate command
pub fn execute(args: DuplicateArgs, opts: &GlobalOptions) -> Result<()> {
    opts.ensure_stdout_free(&args.target, "copied data")?;
    opts.warn_privileges(&[&args.source, &args.target]);

    let engine_settings = &opts.settings.engine;
    let block_size = args.block_size.unwrap_or(engine_settings.raw_block_size);
    let config = engine_settings
        .to_config()
        .rescue(args.rescue || engine_settings.rescue)
        .check_size(engine_settings.check_size && !args.no_size_check);

    let mut source = DeviceHandle::open_source(&args.source)?;
    let mut target = open_target(&args.target)?;
    let mut provider = RawProvider::new(block_size);

    tracing::info!("Duplicating {} onto {}", args.source, args.target);
    let mut engine = opts.engine(config);
    engine
        .duplicate(&mut provider, &mut source, &mut *target)
        .with_context(|| format!("Failed to duplicate {}", args.source))?;

    Ok(())
}
