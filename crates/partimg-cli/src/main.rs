//! partimg - image, restore and duplicate partitions, copying only used blocks
//!
//! # Usage
//!
//! ```bash
//! # Image a partition
//! partimg create /dev/sda1 sda1.img
//!
//! # Stream an image through a compressor
//! partimg create /dev/sda1 - | zstd > sda1.img.zst
//!
//! # Restore it
//! partimg restore sda1.img /dev/sdb1
//!
//! # Verify an image without restoring it
//! partimg check sda1.img
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use partimg_core::{Settings, BAD_SECTOR_WARNING};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod device;
mod progress;

use commands::GlobalOptions;
use progress::ProgressMode;

/// Exit status after Ctrl+C
const EXIT_CANCELLED: i32 = 130;

/// partimg - image, restore and duplicate partitions, copying only used blocks
#[derive(Parser)]
#[command(name = "partimg")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Progress display (defaults to the configured style)
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Update progress at most once per second
    #[arg(long, global = true)]
    progress_limit: bool,

    /// Also write a debug log to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Use this configuration file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an image of a partition
    Create {
        /// Device or file to image
        source: String,

        /// Image file to write, or - for stdout
        image: String,

        /// Block size for raw imaging, in bytes
        #[arg(short, long)]
        block_size: Option<u32>,

        /// Continue past unreadable sectors, marking them in the image
        #[arg(short = 'R', long)]
        rescue: bool,

        /// Do not check free space for the image
        #[arg(long)]
        no_space_check: bool,
    },

    /// Restore an image onto a device
    Restore {
        /// Image file to read, or - for stdin
        image: String,

        /// Device or file to restore onto, or - for stdout
        target: String,

        /// Allow a target smaller than the imaged device
        #[arg(short = 'C', long)]
        no_size_check: bool,
    },

    /// Copy the used blocks of one device onto another
    Duplicate {
        /// Device or file to copy from
        source: String,

        /// Device or file to copy onto, or - for stdout
        target: String,

        /// Block size for raw copying, in bytes
        #[arg(short, long)]
        block_size: Option<u32>,

        /// Continue past unreadable sectors, marking them on the target
        #[arg(short = 'R', long)]
        rescue: bool,

        /// Allow a target smaller than the source device
        #[arg(short = 'C', long)]
        no_size_check: bool,
    },

    /// Verify every checksum in an image without restoring it
    Check {
        /// Image file to read, or - for stdin
        image: String,
    },

    /// Show the header of an image
    Info {
        /// Image file to read, or - for stdin
        image: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage the configuration file
    Config {
        /// Create a configuration file with default values
        #[arg(long)]
        init: bool,

        /// Print the configuration file path
        #[arg(long)]
        path: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    // Set up panic handler for nicer error messages
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{} {}", style("Error:").red().bold(), panic_info);
    }));

    if let Err(e) = run() {
        let core_error = e.downcast_ref::<partimg_core::Error>();

        if matches!(core_error, Some(partimg_core::Error::Cancelled)) {
            eprintln!("{}", style("Cancelled").yellow().bold());
            std::process::exit(EXIT_CANCELLED);
        }

        eprintln!("{} {:#}", style("Error:").red().bold(), e);

        if core_error.is_some_and(|err| err.is_bad_sector()) {
            eprintln!();
            eprintln!("{}", style(BAD_SECTOR_WARNING).yellow());
        }

        // Show cause chain in verbose mode
        if std::env::var("RUST_BACKTRACE").is_ok() {
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  {} {}", style("Caused by:").yellow(), cause);
                source = cause.source();
            }
        }

        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config_file.clone().or_else(Settings::config_path);
    let settings = Settings::load_from_path(config_path);
    let quiet = cli.quiet || settings.behavior.quiet;

    init_logging(cli.verbose, quiet, cli.log_file.as_ref())?;

    let progress = cli
        .progress
        .unwrap_or_else(|| ProgressMode::from_setting(&settings.progress.style));
    let progress_limit = cli.progress_limit || settings.progress.limit;

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        if !r.load(Ordering::SeqCst) {
            // Second Ctrl+C, force exit
            eprintln!("\n{}", style("Forced exit").red().bold());
            std::process::exit(EXIT_CANCELLED);
        }
        r.store(false, Ordering::SeqCst);
        eprintln!(
            "\n{}",
            style("Cancelling... Press Ctrl+C again to force exit").yellow()
        );
    })?;

    let opts = GlobalOptions {
        quiet,
        progress,
        progress_limit,
        running,
        settings,
    };

    match cli.command {
        Commands::Create {
            source,
            image,
            block_size,
            rescue,
            no_space_check,
        } => commands::create::execute(
            commands::create::CreateArgs {
                source,
                image,
                block_size,
                rescue,
                no_space_check,
            },
            &opts,
        ),
        Commands::Restore {
            image,
            target,
            no_size_check,
        } => commands::restore::execute(
            commands::restore::RestoreArgs {
                image,
                target,
                no_size_check,
            },
            &opts,
        ),
        Commands::Duplicate {
            source,
            target,
            block_size,
            rescue,
            no_size_check,
        } => commands::duplicate::execute(
            commands::duplicate::DuplicateArgs {
                source,
                target,
                block_size,
                rescue,
                no_size_check,
            },
            &opts,
        ),
        Commands::Check { image } => commands::check::execute(&image, &opts),
        Commands::Info { image, json } => commands::info::execute(&image, json),
        Commands::Config { init, path, json } => {
            commands::config::execute(commands::config::ConfigArgs {
                init,
                path,
                json,
                silent: quiet,
                config_file: cli.config_file,
            })
        }
    }
}

/// Install the stderr logger and, when requested, a debug log file
fn init_logging(verbose: bool, quiet: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("off")
    } else {
        EnvFilter::new("info")
    };

    let stderr_layer = fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new("debug")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}
