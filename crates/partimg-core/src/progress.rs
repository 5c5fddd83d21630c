//! Progress reporting contract between the engine and its sinks
//!
//! The engine fills a [`ProgressState`] and hands it to whatever
//! [`ProgressReporter`] it was given. Sinks (terminal bars, plain text, gauges,
//! test doubles) decide how to render it; the engine never knows which one is
//! active.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::Mode;
use crate::container::ImageHeader;

/// Unused blocks skipped between progress updates
pub const SKIP_REPORT_INTERVAL: u64 = 100;

/// Minimum time between renders when the rate-limit hint is set
pub const RENDER_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot of a run in progress
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// What the run is doing
    pub mode: Mode,

    /// Used blocks transferred so far
    pub copied: u64,

    /// Used blocks to transfer
    pub total: u64,

    /// Block id most recently visited
    pub block_id: u64,

    /// Blocks in the partition
    pub total_blocks: u64,

    /// Bytes per block
    pub block_size: u32,

    /// Set on the final update of a run
    pub done: bool,

    /// Sinks should render at most once per [`RENDER_INTERVAL`]
    pub rate_limited: bool,

    /// Elapsed time since traversal started
    pub elapsed: Duration,
}

impl ProgressState {
    /// Create the initial state for a run over `header`
    pub fn new(mode: Mode, header: &ImageHeader, rate_limited: bool) -> Self {
        Self {
            mode,
            copied: 0,
            total: header.used_blocks,
            block_id: 0,
            total_blocks: header.total_blocks,
            block_size: header.block_size,
            done: false,
            rate_limited,
            elapsed: Duration::ZERO,
        }
    }

    /// Completion percentage (0.0 to 100.0), measured in used blocks
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.copied as f64 / self.total as f64) * 100.0
        }
    }

    /// Data bytes transferred so far
    pub fn bytes_copied(&self) -> u64 {
        self.copied * u64::from(self.block_size)
    }

    /// Data bytes the run will transfer in total
    pub fn bytes_total(&self) -> u64 {
        self.total * u64::from(self.block_size)
    }

    /// Average transfer speed in bytes per second
    pub fn speed_bps(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_copied() as f64 / secs) as u64
        } else {
            0
        }
    }

    /// Estimated time remaining in seconds
    pub fn eta_seconds(&self) -> Option<u64> {
        let speed = self.speed_bps();
        if speed == 0 || self.copied >= self.total {
            return None;
        }
        Some(self.bytes_total().saturating_sub(self.bytes_copied()) / speed)
    }

    /// Format speed for display (e.g., "45.2 MB/s")
    pub fn speed_display(&self) -> String {
        format_speed(self.speed_bps())
    }

    /// Format ETA for display (e.g., "2m 30s")
    pub fn eta_display(&self) -> String {
        match self.eta_seconds() {
            Some(secs) if secs > 0 => format_duration(secs),
            _ => "calculating...".to_string(),
        }
    }
}

/// Final report for a run
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    /// What the run did
    pub mode: Mode,

    /// True when the run reached `Done`
    pub completed: bool,

    /// Used blocks transferred
    pub blocks_copied: u64,

    /// Data bytes transferred
    pub bytes_copied: u64,

    /// Sectors replaced with the bad-sector placeholder
    pub bad_sectors: u64,

    /// Final running checksum (create, restore and check)
    pub checksum: Option<u32>,

    /// Time from start to finish
    pub elapsed: Duration,

    /// Header of the image or device, once known
    pub header: Option<ImageHeader>,
}

impl Summary {
    /// Average speed in bytes per second
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_copied as f64 / secs) as u64
        } else {
            0
        }
    }

    /// Format average speed for display
    pub fn speed_display(&self) -> String {
        format_speed(self.average_speed())
    }
}

/// Sink for engine progress
#[cfg_attr(test, mockall::automock)]
pub trait ProgressReporter {
    /// Called after every used block and periodically across unused runs
    fn update(&mut self, state: &ProgressState);

    /// Called once when the run ends, successfully or not
    fn finish(&mut self, summary: &Summary) {
        let _ = summary;
    }
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn update(&mut self, _state: &ProgressState) {}
}

/// Reporter backed by a closure
pub struct CallbackReporter<F> {
    callback: F,
}

impl<F> CallbackReporter<F>
where
    F: FnMut(&ProgressState),
{
    /// Wrap a closure
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for CallbackReporter<F>
where
    F: FnMut(&ProgressState),
{
    fn update(&mut self, state: &ProgressState) {
        (self.callback)(state);
    }
}

/// Render gate for sinks that honor the rate-limit hint
///
/// Lets every update through unless the state is rate limited, in which case
/// at most one update per interval passes. The final update always passes.
#[derive(Debug, Clone)]
pub struct RenderThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl RenderThrottle {
    /// Create a throttle with the given interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether `state` should be rendered now
    pub fn should_render(&mut self, state: &ProgressState) -> bool {
        self.should_render_at(state, Instant::now())
    }

    fn should_render_at(&mut self, state: &ProgressState, now: Instant) -> bool {
        let due = !state.rate_limited
            || state.done
            || self
                .last
                .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}

impl Default for RenderThrottle {
    fn default() -> Self {
        Self::new(RENDER_INTERVAL)
    }
}

/// Format speed for display
pub fn format_speed(bytes_per_second: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes_per_second >= GB {
        format!("{:.1} GB/s", bytes_per_second as f64 / GB as f64)
    } else if bytes_per_second >= MB {
        format!("{:.1} MB/s", bytes_per_second as f64 / MB as f64)
    } else if bytes_per_second >= KB {
        format!("{:.1} KB/s", bytes_per_second as f64 / KB as f64)
    } else {
        format!("{} B/s", bytes_per_second)
    }
}

/// Format duration for display
pub fn format_duration(seconds: u64) -> String {
    if seconds >= 3600 {
        let hours = seconds / 3600;
        let mins = (seconds % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else if seconds >= 60 {
        let mins = seconds / 60;
        let secs = seconds % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", seconds)
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state(rate_limited: bool) -> ProgressState {
        let header = ImageHeader::new("RAW", 4096, 1000, 200, 4_096_000);
        ProgressState::new(Mode::Create, &header, rate_limited)
    }

    // -------------------------------------------------------------------------
    // ProgressState tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_progress_state_new() {
        let s = state(false);
        assert_eq!(s.copied, 0);
        assert_eq!(s.total, 200);
        assert_eq!(s.total_blocks, 1000);
        assert!(!s.done);
        assert_eq!(s.bytes_total(), 200 * 4096);
    }

    #[test]
    fn test_progress_percentage() {
        let mut s = state(false);
        assert_eq!(s.percentage(), 0.0);
        s.copied = 50;
        assert_eq!(s.percentage(), 25.0);
        s.copied = 200;
        assert_eq!(s.percentage(), 100.0);
    }

    #[test]
    fn test_progress_percentage_nothing_used() {
        let header = ImageHeader::new("RAW", 4096, 10, 0, 40960);
        let s = ProgressState::new(Mode::Restore, &header, false);
        assert_eq!(s.percentage(), 100.0);
    }

    #[test]
    fn test_progress_speed_and_eta() {
        let mut s = state(false);
        assert_eq!(s.speed_bps(), 0);
        assert_eq!(s.eta_seconds(), None);
        assert_eq!(s.eta_display(), "calculating...");

        s.copied = 100;
        s.elapsed = Duration::from_secs(2);
        assert_eq!(s.speed_bps(), 100 * 4096 / 2);
        assert_eq!(s.eta_seconds(), Some(2));
    }

    // -------------------------------------------------------------------------
    // Reporter tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_callback_reporter() {
        let mut seen = Vec::new();
        {
            let mut reporter = CallbackReporter::new(|s: &ProgressState| seen.push(s.copied));
            let mut s = state(false);
            reporter.update(&s);
            s.copied = 5;
            reporter.update(&s);
        }
        assert_eq!(seen, vec![0, 5]);
    }

    // -------------------------------------------------------------------------
    // RenderThrottle tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_throttle_passes_everything_without_hint() {
        let mut throttle = RenderThrottle::default();
        let s = state(false);
        let now = Instant::now();
        assert!(throttle.should_render_at(&s, now));
        assert!(throttle.should_render_at(&s, now));
    }

    #[test]
    fn test_throttle_limits_with_hint() {
        let mut throttle = RenderThrottle::default();
        let mut s = state(true);
        let start = Instant::now();

        assert!(throttle.should_render_at(&s, start));
        assert!(!throttle.should_render_at(&s, start + Duration::from_millis(500)));
        assert!(throttle.should_render_at(&s, start + Duration::from_millis(1000)));

        s.done = true;
        assert!(throttle.should_render_at(&s, start + Duration::from_millis(1001)));
    }

    // -------------------------------------------------------------------------
    // Formatting tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(500), "500 B/s");
        assert_eq!(format_speed(1024), "1.0 KB/s");
        assert_eq!(format_speed(1024 * 1024 * 45), "45.0 MB/s");
        assert_eq!(format_speed(1024 * 1024 * 1024), "1.0 GB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3720), "1h 2m");
    }

    #[test]
    fn test_summary_speed() {
        let summary = Summary {
            mode: Mode::Create,
            completed: true,
            blocks_copied: 256,
            bytes_copied: 1024 * 1024,
            bad_sectors: 0,
            checksum: Some(0),
            elapsed: Duration::from_secs(1),
            header: None,
        };
        assert_eq!(summary.average_speed(), 1024 * 1024);
        assert_eq!(summary.speed_display(), "1.0 MB/s");
    }
}
