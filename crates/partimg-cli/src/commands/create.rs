//! Create command - images a partition into a container
//!
//! Only used blocks are stored. The image can go to a file or, with `-`, to
//! stdout for piping into compressors or over the network.

use anyhow::{Context, Result};
use partimg_core::RawProvider;

use super::GlobalOptions;
use crate::device::{open_image_writer, DeviceHandle};

/// Arguments for the create command
pub struct CreateArgs {
    /// Device or file to image
    pub source: String,
    /// Image path, `-` for stdout
    pub image: String,
    /// Block size override for raw imaging
    pub block_size: Option<u32>,
    /// Re-read failed blocks sector by sector
    pub rescue: bool,
    /// Skip the free space check
    pub no_space_check: bool,
}

/// Execute the create command
pub fn execute(args: CreateArgs, opts: &GlobalOptions) -> Result<()> {
    opts.ensure_stdout_free(&args.image, "image")?;
    opts.warn_privileges(&[&args.source]);

    let engine_settings = &opts.settings.engine;
    let block_size = args.block_size.unwrap_or(engine_settings.raw_block_size);
    let config = engine_settings
        .to_config()
        .rescue(args.rescue || engine_settings.rescue)
        .check_free_space(engine_settings.check_free_space && !args.no_space_check);

    let mut source = DeviceHandle::open_source(&args.source)?;
    let mut image = open_image_writer(&args.image)?;
    let mut provider = RawProvider::new(block_size);

    tracing::info!("Imaging {} into {}", args.source, args.image);
    let mut engine = opts.engine(config);
    engine
        .create(&mut provider, &mut source, &mut *image)
        .with_context(|| format!("Failed to image {}", args.source))?;

    Ok(())
}
