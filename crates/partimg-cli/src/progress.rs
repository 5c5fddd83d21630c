//! Progress sinks for the CLI
//!
//! One sink is chosen at startup and handed to the engine as its reporter.
//! All human-facing output goes to stderr so an image can be streamed to
//! stdout; only the gauge sink writes to stdout, for `dialog --gauge`.

use std::io::Write;

use clap::ValueEnum;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use partimg_core::{Mode, ProgressReporter, ProgressState, RenderThrottle, Summary};

/// How progress is displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgressMode {
    /// Interactive progress bar
    Bar,
    /// One text line per update
    Plain,
    /// Integer percentages on stdout
    Gauge,
    /// No progress output
    None,
}

impl ProgressMode {
    /// Parse the style named in the settings file, falling back to a bar
    pub fn from_setting(name: &str) -> Self {
        <Self as ValueEnum>::from_str(name, true).unwrap_or_else(|_| {
            tracing::warn!("Unknown progress style {:?} in config, using bar", name);
            ProgressMode::Bar
        })
    }
}

enum Sink {
    Bar(ProgressBar),
    Plain,
    Gauge { last: Option<u64> },
    Silent,
}

/// Engine reporter that renders to the terminal
pub struct TerminalReporter {
    sink: Sink,
    throttle: RenderThrottle,
    quiet: bool,
}

impl TerminalReporter {
    /// Create a reporter for the chosen mode
    pub fn new(mode: ProgressMode, quiet: bool) -> Self {
        let sink = match mode {
            _ if quiet => Sink::Silent,
            ProgressMode::Bar => Sink::Bar(create_progress_bar()),
            ProgressMode::Plain => Sink::Plain,
            ProgressMode::Gauge => Sink::Gauge { last: None },
            ProgressMode::None => Sink::Silent,
        };
        Self {
            sink,
            throttle: RenderThrottle::default(),
            quiet,
        }
    }
}

impl ProgressReporter for TerminalReporter {
    fn update(&mut self, state: &ProgressState) {
        if !self.throttle.should_render(state) {
            return;
        }

        match &mut self.sink {
            Sink::Bar(pb) => {
                if pb.length() != Some(state.bytes_total()) {
                    pb.set_length(state.bytes_total());
                    pb.set_prefix(verb(state.mode));
                }
                pb.set_position(state.bytes_copied());
                pb.set_message(format!("{}, ETA: {}", state.speed_display(), state.eta_display()));
            }
            Sink::Plain => eprintln!("{}", plain_line(state)),
            Sink::Gauge { last } => {
                let percent = state.percentage() as u64;
                if *last != Some(percent) {
                    let mut stdout = std::io::stdout().lock();
                    let _ = writeln!(stdout, "{}", percent);
                    let _ = stdout.flush();
                    *last = Some(percent);
                }
            }
            Sink::Silent => {}
        }
    }

    fn finish(&mut self, summary: &Summary) {
        if let Sink::Bar(pb) = &self.sink {
            pb.finish_and_clear();
        }
        if self.quiet || !summary.completed {
            return;
        }

        eprintln!("  {} {}", style("✓").green(), summary_line(summary));
        if let Some(checksum) = summary.checksum {
            eprintln!("    {} {:#010x}", style("Checksum:").dim(), checksum);
        }
        if summary.bad_sectors > 0 {
            eprintln!(
                "  {} {} unreadable sectors were replaced with BADSECTOR markers",
                style("⚠").yellow(),
                summary.bad_sectors
            );
        }
    }
}

/// Present participle for a run, used as the bar prefix
fn verb(mode: Mode) -> &'static str {
    match mode {
        Mode::Create => "Imaging",
        Mode::Restore => "Restoring",
        Mode::Duplicate => "Duplicating",
        Mode::Check => "Checking",
    }
}

fn plain_line(state: &ProgressState) -> String {
    format!(
        "{}: {:>6.2}% ({}/{} blocks), {}, ETA: {}",
        verb(state.mode),
        state.percentage(),
        state.copied,
        state.total,
        state.speed_display(),
        state.eta_display()
    )
}

/// One-line description of a finished run
pub fn summary_line(summary: &Summary) -> String {
    let action = match summary.mode {
        Mode::Create => "Imaged",
        Mode::Restore => "Restored",
        Mode::Duplicate => "Duplicated",
        Mode::Check => "Verified",
    };
    format!(
        "{} {} blocks ({}) in {:.1}s ({})",
        action,
        summary.blocks_copied,
        format_size(summary.bytes_copied),
        summary.elapsed.as_secs_f64(),
        summary.speed_display()
    )
}

/// Format a size in bytes to human-readable binary units
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Create the progress bar used by the bar sink
fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    match ProgressStyle::default_bar()
        .template("  {spinner:.green} {prefix} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        Ok(bar_style) => pb.set_style(bar_style.progress_chars("█▓░")),
        Err(e) => tracing::debug!("Invalid progress template: {}", e),
    }
    pb
}
