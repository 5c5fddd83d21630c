//! CLI command implementations

pub mod check;
pub mod config;
pub mod create;
pub mod duplicate;
pub mod info;
pub mod restore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use console::style;
use partimg_core::{Engine, EngineConfig, Settings};

use crate::device::{is_device_path, STDIO_PATH};
use crate::progress::{ProgressMode, TerminalReporter};

/// Options shared by every command
pub struct GlobalOptions {
    /// Suppress everything but errors
    pub quiet: bool,
    /// Progress sink
    pub progress: ProgressMode,
    /// Render progress at most once per second
    pub progress_limit: bool,
    /// Cleared by the Ctrl+C handler
    pub running: Arc<AtomicBool>,
    /// Settings loaded from the configuration file
    pub settings: Settings,
}

impl GlobalOptions {
    /// Build an engine wired to the terminal reporter and the Ctrl+C handler
    pub fn engine(&self, config: EngineConfig) -> Engine {
        let engine = Engine::with_config(config.progress_limit(self.progress_limit))
            .with_reporter(TerminalReporter::new(self.progress, self.quiet))
            .available_memory(probe_memory());
        link_cancel(&self.running, engine.cancel_handle());
        engine
    }

    /// Refuse to draw the stdout gauge when `output` also goes to stdout
    pub fn ensure_stdout_free(&self, output: &str, what: &str) -> Result<()> {
        if output == STDIO_PATH && self.progress == ProgressMode::Gauge && !self.quiet {
            bail!("--progress gauge writes to stdout and cannot be used while the {what} goes to stdout");
        }
        Ok(())
    }

    /// Warn when raw devices are about to be opened without root
    pub fn warn_privileges(&self, paths: &[&str]) {
        if self.quiet || partimg_platform::has_elevated_privileges() {
            return;
        }
        if paths.iter().any(|p| is_device_path(p)) {
            eprintln!(
                "{} Not running as root, opening devices may fail. Try: sudo partimg ...",
                style("Warning:").yellow()
            );
        }
    }
}

fn probe_memory() -> Option<u64> {
    match partimg_platform::available_memory() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::debug!("Cannot determine available memory: {}", e);
            None
        }
    }
}

/// Forward Ctrl+C to the engine's cancel flag
fn link_cancel(running: &Arc<AtomicBool>, cancel: Arc<AtomicBool>) {
    let running = Arc::clone(running);
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        cancel.store(true, Ordering::SeqCst);
    });
}
