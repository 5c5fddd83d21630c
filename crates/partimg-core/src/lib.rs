//! # partimg Core
//!
//! Core library for the partimg partition imaging tool: sparse, bitmap-driven
//! imaging, restore and device duplication with a streaming integrity check.
//!
//! ## Modules
//!
//! - `engine`: The copy engine driving create, restore, duplicate and check runs
//! - `container`: Image header, bitmap and block record layout
//! - `bitmap`: Used-block bitmap and the filesystem provider interface
//! - `checksum`: Running CRC-32 tagging every block record
//! - `rescue`: Sector-level recovery of unreadable source blocks
//! - `device`: Random-access and sequential source/target handles
//! - `progress`: Progress reporting contract and helpers
//! - `error`: Error types and result aliases
//! - `config`: Runtime configuration
//! - `settings`: Persistent user settings from configuration file
//!
//! ## Example
//!
//! ```ignore
//! use partimg_core::{Engine, EngineConfig, RandomAccess, RawProvider};
//! use std::fs::File;
//!
//! let device = File::open("/dev/sdb1")?;
//! let size = device.metadata()?.len();
//! let mut source = RandomAccess::new(device).with_capacity(size);
//! let mut image = RandomAccess::new(File::create("sdb1.img")?);
//!
//! let mut engine = Engine::with_config(EngineConfig::new().rescue(true))
//!     .on_progress(|p| println!("{:.1}% - {}", p.percentage(), p.speed_display()));
//!
//! let summary = engine.create(&mut RawProvider::default(), &mut source, &mut image)?;
//! println!("Copied {} blocks in {:?}", summary.blocks_copied, summary.elapsed);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitmap;
pub mod checksum;
pub mod config;
pub mod container;
pub mod device;
pub mod engine;
pub mod error;
pub mod progress;
pub mod rescue;
pub mod settings;

pub use bitmap::{Bitmap, BitmapProvider, RawProvider, DEFAULT_RAW_BLOCK_SIZE};
pub use checksum::{RunningChecksum, CHECKSUM_SEED, CHECKSUM_SIZE};
pub use config::{EngineConfig, Mode};
pub use container::{
    projected_image_size, read_header, ImageHeader, BITMAP_SENTINEL, HEADER_SIZE, IMAGE_MAGIC,
    IMAGE_VERSION,
};
pub use device::{
    BlockReader, BlockWriter, NullTarget, RandomAccess, SeekCapability, Sequential,
};
pub use engine::{Engine, Phase};
pub use error::{is_media_error, Error, Result};
pub use progress::{
    format_duration, format_speed, CallbackReporter, NullReporter, ProgressReporter,
    ProgressState, RenderThrottle, Summary, SKIP_REPORT_INTERVAL,
};
pub use rescue::{RescuePolicy, BAD_SECTOR_WARNING, SECTOR_SIZE};
pub use settings::{BehaviorSettings, EngineSettings, ProgressSettings, Settings, SettingsError};
