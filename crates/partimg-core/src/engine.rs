//! Bitmap-driven block copy engine
//!
//! Every run walks the same state machine:
//!
//! ```text
//! Init -> HeaderExchange -> Traverse -> Drain -> Done
//!   \__________\_______________\__________\----> Failed
//! ```
//!
//! - `Init` obtains the header and bitmap (from a [`BitmapProvider`] or an image)
//!   and runs the size, memory and free space checks.
//! - `HeaderExchange` writes or reads the image preamble.
//! - `Traverse` visits block ids in ascending order and moves used blocks.
//! - `Drain` syncs the target. It also runs, best effort, when a run fails.
//!
//! Random-access runs seek straight to each used block and stop as soon as the
//! last used block is copied. Sequential runs skip forward over unused blocks and
//! visit every id.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bitmap::{Bitmap, BitmapProvider};
use crate::checksum::RunningChecksum;
use crate::config::{EngineConfig, Mode};
use crate::container::{self, ImageHeader};
use crate::device::{BlockReader, BlockWriter, NullTarget};
use crate::error::{Error, Result};
use crate::progress::{CallbackReporter, NullReporter, ProgressReporter, ProgressState, Summary};
use crate::rescue::RescuePolicy;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Header and bitmap acquisition, pre-flight checks
    Init,
    /// Image preamble written or read
    HeaderExchange,
    /// Used blocks being copied
    Traverse,
    /// Target being synced
    Drain,
    /// Run finished successfully
    Done,
    /// Run ended with an error
    Failed,
}

/// Outcome of moving one block
#[derive(Debug, Default, Clone, Copy)]
struct Transfer {
    bytes: u64,
    bad_sectors: u64,
}

/// Counters for one run
struct RunStats {
    mode: Mode,
    started: Instant,
    blocks_copied: u64,
    bytes_copied: u64,
    bad_sectors: u64,
    checksum: Option<u32>,
    header: Option<ImageHeader>,
    end_offset: u64,
}

impl RunStats {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            started: Instant::now(),
            blocks_copied: 0,
            bytes_copied: 0,
            bad_sectors: 0,
            checksum: None,
            header: None,
            end_offset: 0,
        }
    }

    fn record(&mut self, transfer: Transfer) {
        self.blocks_copied += 1;
        self.bytes_copied += transfer.bytes;
        self.bad_sectors += transfer.bad_sectors;
    }

    fn summary(&self, completed: bool) -> Summary {
        Summary {
            mode: self.mode,
            completed,
            blocks_copied: self.blocks_copied,
            bytes_copied: self.bytes_copied,
            bad_sectors: self.bad_sectors,
            checksum: self.checksum,
            elapsed: self.started.elapsed(),
            header: self.header.clone(),
        }
    }
}

/// Copy engine for create, restore, duplicate and check runs
pub struct Engine {
    config: EngineConfig,
    reporter: Box<dyn ProgressReporter>,
    cancel_flag: Arc<AtomicBool>,
    available_memory: Option<u64>,
    phase: Phase,
}

impl Engine {
    /// Create an engine with default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with custom configuration
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            reporter: Box::new(NullReporter),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            available_memory: None,
            phase: Phase::Init,
        }
    }

    /// Set a progress callback
    pub fn on_progress<F>(self, callback: F) -> Self
    where
        F: FnMut(&ProgressState) + 'static,
    {
        self.with_reporter(CallbackReporter::new(callback))
    }

    /// Set the progress sink
    pub fn with_reporter<R>(mut self, reporter: R) -> Self
    where
        R: ProgressReporter + 'static,
    {
        self.reporter = Box::new(reporter);
        self
    }

    /// Free memory to check the bitmap and block buffer against
    pub fn available_memory(mut self, bytes: Option<u64>) -> Self {
        self.available_memory = bytes;
        self
    }

    /// Get a handle to cancel the run
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Image a partition into a container
    ///
    /// `image` receives the header, bitmap, sentinel and one record per used
    /// block. It is written strictly front to back.
    pub fn create(
        &mut self,
        provider: &mut dyn BitmapProvider,
        source: &mut dyn BlockReader,
        image: &mut dyn BlockWriter,
    ) -> Result<Summary> {
        let mut stats = RunStats::new(Mode::Create);
        let result = self.create_blocks(&mut stats, provider, source, image);
        self.conclude(stats, result, image)
    }

    /// Restore a container onto a device
    pub fn restore(
        &mut self,
        image: &mut dyn Read,
        target: &mut dyn BlockWriter,
    ) -> Result<Summary> {
        let mut stats = RunStats::new(Mode::Restore);
        let result = self.restore_blocks(&mut stats, image, target);
        self.conclude(stats, result, target)
    }

    /// Copy the used blocks of one device onto another
    pub fn duplicate(
        &mut self,
        provider: &mut dyn BitmapProvider,
        source: &mut dyn BlockReader,
        target: &mut dyn BlockWriter,
    ) -> Result<Summary> {
        let mut stats = RunStats::new(Mode::Duplicate);
        let result = self.duplicate_blocks(&mut stats, provider, source, target);
        self.conclude(stats, result, target)
    }

    /// Verify every checksum in a container without writing anywhere
    pub fn check(&mut self, image: &mut dyn Read) -> Result<Summary> {
        let mut target = NullTarget;
        let mut stats = RunStats::new(Mode::Check);
        let result = self.restore_blocks(&mut stats, image, &mut target);
        self.conclude(stats, result, &mut target)
    }

    fn create_blocks(
        &mut self,
        stats: &mut RunStats,
        provider: &mut dyn BitmapProvider,
        source: &mut dyn BlockReader,
        image: &mut dyn BlockWriter,
    ) -> Result<()> {
        self.begin(stats.mode)?;
        let (header, bitmap) = self.extract(provider, source)?;
        stats.header = Some(header.clone());
        stats.end_offset = container::projected_image_size(&header);
        self.check_memory(&header)?;
        self.check_free_space(&header, &*image)?;
        log_header(&header);

        self.enter(Phase::HeaderExchange);
        container::write_preamble(&mut *image, &header, &bitmap)?;

        self.enter(Phase::Traverse);
        source.seek_to(0).map_err(|e| Error::device_io(0, e))?;
        let random = source.supports_random_access();
        let block_size = u64::from(header.block_size);
        let record_size = header.record_size();
        let rescue = self.rescue_policy();
        let mut buffer = alloc_block(header.block_size)?;
        let mut running = RunningChecksum::new();
        let mut image_offset = header.data_offset();

        self.traverse(&header, &bitmap, random, stats, |block_id, used| {
            let offset = block_id * block_size;
            if !used {
                source
                    .skip(block_size)
                    .map_err(|e| Error::device_io(offset, e))?;
                return Ok(Transfer::default());
            }

            if random {
                source
                    .seek_to(offset)
                    .map_err(|e| Error::device_io(offset, e))?;
            }
            let bad_sectors = read_source_block(&mut *source, &mut buffer, offset, &rescue)?;

            running.fold(&buffer);
            container::write_block_record(&mut *image, &buffer, running.snapshot(), image_offset)?;
            image_offset += record_size;

            Ok(Transfer {
                bytes: block_size,
                bad_sectors,
            })
        })?;

        stats.checksum = Some(running.value());
        Ok(())
    }

    fn restore_blocks(
        &mut self,
        stats: &mut RunStats,
        image: &mut dyn Read,
        target: &mut dyn BlockWriter,
    ) -> Result<()> {
        self.begin(stats.mode)?;
        let header = container::read_header(&mut *image)?;
        stats.header = Some(header.clone());
        stats.end_offset = header.partition_size();
        if stats.mode != Mode::Check {
            self.check_capacity(&header, &*target)?;
        }
        self.check_memory(&header)?;
        let bitmap = container::read_bitmap(&mut *image, &header)?;
        log_header(&header);

        self.enter(Phase::HeaderExchange);
        container::read_sentinel(&mut *image, &header)?;

        self.enter(Phase::Traverse);
        target.seek_to(0).map_err(|e| Error::device_io(0, e))?;
        let random = target.supports_random_access();
        let block_size = u64::from(header.block_size);
        let record_size = header.record_size();
        let mut buffer = alloc_block(header.block_size)?;
        let mut running = RunningChecksum::new();
        let mut image_offset = header.data_offset();

        self.traverse(&header, &bitmap, random, stats, |block_id, used| {
            let offset = block_id * block_size;
            if !used {
                target
                    .skip(block_size)
                    .map_err(|e| Error::device_io(offset, e))?;
                return Ok(Transfer::default());
            }

            let tag =
                container::read_block_record(&mut *image, &mut buffer, block_id, image_offset)?;
            image_offset += record_size;
            running.fold(&buffer);
            running.verify(block_id, tag)?;

            if random {
                target
                    .seek_to(offset)
                    .map_err(|e| Error::device_io(offset, e))?;
            }
            target
                .write_all(&buffer)
                .map_err(|e| Error::device_io(offset, e))?;

            Ok(Transfer {
                bytes: block_size,
                bad_sectors: 0,
            })
        })?;

        stats.checksum = Some(running.value());
        Ok(())
    }

    fn duplicate_blocks(
        &mut self,
        stats: &mut RunStats,
        provider: &mut dyn BitmapProvider,
        source: &mut dyn BlockReader,
        target: &mut dyn BlockWriter,
    ) -> Result<()> {
        self.begin(stats.mode)?;
        let (header, bitmap) = self.extract(provider, source)?;
        stats.header = Some(header.clone());
        stats.end_offset = header.partition_size();
        self.check_capacity(&header, &*target)?;
        self.check_memory(&header)?;
        log_header(&header);

        // No container, nothing to exchange
        self.enter(Phase::HeaderExchange);

        self.enter(Phase::Traverse);
        source.seek_to(0).map_err(|e| Error::device_io(0, e))?;
        target.seek_to(0).map_err(|e| Error::device_io(0, e))?;
        let random = source.supports_random_access() && target.supports_random_access();
        let block_size = u64::from(header.block_size);
        let rescue = self.rescue_policy();
        let mut buffer = alloc_block(header.block_size)?;

        self.traverse(&header, &bitmap, random, stats, |block_id, used| {
            let offset = block_id * block_size;
            if !used {
                source
                    .skip(block_size)
                    .map_err(|e| Error::device_io(offset, e))?;
                target
                    .skip(block_size)
                    .map_err(|e| Error::device_io(offset, e))?;
                return Ok(Transfer::default());
            }

            if random {
                source
                    .seek_to(offset)
                    .map_err(|e| Error::device_io(offset, e))?;
            }
            let bad_sectors = read_source_block(&mut *source, &mut buffer, offset, &rescue)?;

            if random {
                target
                    .seek_to(offset)
                    .map_err(|e| Error::device_io(offset, e))?;
            }
            target
                .write_all(&buffer)
                .map_err(|e| Error::device_io(offset, e))?;

            Ok(Transfer {
                bytes: block_size,
                bad_sectors,
            })
        })?;

        Ok(())
    }

    /// Visit block ids in order, calling `step` for used blocks (and for unused
    /// blocks on sequential runs)
    fn traverse<F>(
        &mut self,
        header: &ImageHeader,
        bitmap: &Bitmap,
        random: bool,
        stats: &mut RunStats,
        mut step: F,
    ) -> Result<()>
    where
        F: FnMut(u64, bool) -> Result<Transfer>,
    {
        let mut state = ProgressState::new(stats.mode, header, self.config.progress_limit);
        let interval = self.config.skip_report_interval;
        let mut skipped = 0u64;

        tracing::debug!(
            "Traversing {} blocks, {} used, {} access",
            header.total_blocks,
            header.used_blocks,
            if random { "random" } else { "sequential" }
        );

        for block_id in 0..header.total_blocks {
            if self.cancel_flag.load(Ordering::SeqCst) {
                tracing::info!("Cancelled at block {}", block_id);
                return Err(Error::Cancelled);
            }

            let last = block_id + 1 == header.total_blocks;
            state.block_id = block_id;

            if bitmap.is_used(block_id) {
                let transfer = step(block_id, true)?;
                stats.record(transfer);
                tracing::trace!(block_id, "block copied");

                state.copied = stats.blocks_copied;
                state.done = last || (random && stats.blocks_copied == header.used_blocks);
                self.report(&mut state, stats.started);

                if state.done {
                    if !last {
                        tracing::debug!(
                            "All used blocks copied, stopping at block {}",
                            block_id
                        );
                    }
                    break;
                }
            } else {
                if !random {
                    step(block_id, false)?;
                }
                skipped += 1;
                if skipped >= interval || last {
                    state.done = last;
                    self.report(&mut state, stats.started);
                    skipped = 0;
                }
            }
        }

        Ok(())
    }

    fn report(&mut self, state: &mut ProgressState, started: Instant) {
        state.elapsed = started.elapsed();
        self.reporter.update(state);
    }

    /// Drain the target and hand the summary to the reporter
    fn conclude(
        &mut self,
        stats: RunStats,
        result: Result<()>,
        target: &mut dyn BlockWriter,
    ) -> Result<Summary> {
        let result = result.and_then(|()| {
            self.enter(Phase::Drain);
            self.drain(target, stats.end_offset)
        });

        match result {
            Ok(()) => {
                self.enter(Phase::Done);
                let summary = stats.summary(true);
                tracing::info!(
                    "{} finished: {} blocks, {} bytes in {:.1}s",
                    summary.mode,
                    summary.blocks_copied,
                    summary.bytes_copied,
                    summary.elapsed.as_secs_f64()
                );
                self.reporter.finish(&summary);
                Ok(summary)
            }
            Err(e) => {
                if self.phase != Phase::Drain {
                    if let Err(sync_err) = target.sync() {
                        tracing::warn!("Failed to sync target after error: {}", sync_err);
                    }
                }
                self.enter(Phase::Failed);
                tracing::debug!("{} failed: {}", stats.mode, e);
                self.reporter.finish(&stats.summary(false));
                Err(e)
            }
        }
    }

    fn drain(&mut self, target: &mut dyn BlockWriter, end_offset: u64) -> Result<()> {
        let synced = if self.config.sync_on_complete {
            tracing::debug!("Syncing target");
            target.sync()
        } else {
            target.flush()
        };
        synced.map_err(|e| Error::device_io(end_offset, e))
    }

    fn begin(&mut self, mode: Mode) -> Result<()> {
        self.enter(Phase::Init);
        self.config.validate()?;
        tracing::debug!("Starting {} run", mode);
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("Phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn rescue_policy(&self) -> RescuePolicy {
        RescuePolicy::new(self.config.rescue, self.config.sector_size)
    }

    fn extract(
        &self,
        provider: &mut dyn BitmapProvider,
        source: &mut dyn BlockReader,
    ) -> Result<(ImageHeader, Bitmap)> {
        tracing::info!("Reading {} bitmap", provider.fs_type());
        let (header, bitmap) = provider.extract(source)?;
        header.validate()?;
        bitmap.validate(&header)?;
        Ok((header, bitmap))
    }

    fn check_capacity(&self, header: &ImageHeader, target: &dyn BlockWriter) -> Result<()> {
        if !self.config.check_size {
            tracing::debug!("Target size check disabled");
            return Ok(());
        }

        match target.capacity() {
            Some(available) if available < header.device_size => Err(Error::SizeMismatch {
                required: header.device_size,
                available,
            }),
            Some(available) => {
                tracing::debug!(
                    "Target has {} bytes, {} required",
                    available,
                    header.device_size
                );
                Ok(())
            }
            None => {
                tracing::warn!("Target size unknown, skipping size check");
                Ok(())
            }
        }
    }

    fn check_memory(&self, header: &ImageHeader) -> Result<()> {
        let Some(available) = self.available_memory else {
            return Ok(());
        };

        let needed = header
            .total_blocks
            .checked_add(u64::from(header.block_size))
            .ok_or_else(|| {
                Error::Resource(format!(
                    "bitmap of {} blocks does not fit in memory",
                    header.total_blocks
                ))
            })?;
        if available < needed {
            return Err(Error::Resource(format!(
                "bitmap and block buffer need {} bytes of memory, {} available",
                needed, available
            )));
        }
        Ok(())
    }

    fn check_free_space(&self, header: &ImageHeader, image: &dyn BlockWriter) -> Result<()> {
        if !self.config.check_free_space {
            tracing::debug!("Free space check disabled");
            return Ok(());
        }

        let needed = container::projected_image_size(header);
        match image.available_space() {
            Some(available) if available < needed => Err(Error::Resource(format!(
                "image needs {} bytes, only {} bytes free on target",
                needed, available
            ))),
            Some(_) => Ok(()),
            None => {
                tracing::debug!("Free space on image target unknown, skipping check");
                Ok(())
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a zeroed block buffer
fn alloc_block(block_size: u32) -> Result<Vec<u8>> {
    let len = block_size as usize;
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|e| {
        Error::Resource(format!("cannot allocate {len} byte block buffer: {e}"))
    })?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// Read one full block, rescuing it when the policy allows
///
/// Returns the number of sectors lost to bad media.
fn read_source_block(
    source: &mut dyn BlockReader,
    buf: &mut [u8],
    offset: u64,
    rescue: &RescuePolicy,
) -> Result<u64> {
    let mut filled = 0;

    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return rescue
                    .recover(source, offset, buf, filled, e)
                    .map(|report| report.sectors_lost);
            }
        }
    }

    if filled < buf.len() {
        return Err(Error::device_io(
            offset + filled as u64,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {} bytes", filled, buf.len()),
            ),
        ));
    }
    Ok(0)
}

fn log_header(header: &ImageHeader) {
    tracing::info!("File system:  {}", header.fs_type);
    tracing::info!("Device size:  {} bytes", header.device_size);
    tracing::info!(
        "Space in use: {} bytes ({} blocks)",
        header.used_size(),
        header.used_blocks
    );
    tracing::info!(
        "Free space:   {} bytes",
        header.partition_size().saturating_sub(header.used_size())
    );
    tracing::info!("Block size:   {} bytes", header.block_size);
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::RawProvider;
    use crate::device::{RandomAccess, Sequential};
    use crate::progress::MockProgressReporter;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Provider with a fixed bitmap
    struct FixedProvider {
        block_size: u32,
        used: Vec<u64>,
        total: u64,
    }

    impl BitmapProvider for FixedProvider {
        fn fs_type(&self) -> &str {
            "test"
        }

        fn extract(&mut self, _source: &mut dyn BlockReader) -> Result<(ImageHeader, Bitmap)> {
            let mut bitmap = Bitmap::try_new(self.total)?;
            for &id in &self.used {
                bitmap.set_used(id);
            }
            let header = ImageHeader::new(
                "test",
                self.block_size,
                self.total,
                bitmap.used_blocks(),
                self.total * u64::from(self.block_size),
            );
            Ok((header, bitmap))
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    fn make_image(provider: &mut FixedProvider, device: &[u8]) -> Vec<u8> {
        let mut source = RandomAccess::new(Cursor::new(device.to_vec()));
        let mut image = RandomAccess::new(Cursor::new(Vec::new()));
        Engine::new()
            .create(provider, &mut source, &mut image)
            .unwrap();
        image.into_inner().into_inner()
    }

    // -------------------------------------------------------------------------
    // Phase tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_engine_new() {
        let engine = Engine::new();
        assert_eq!(engine.phase(), Phase::Init);
        assert!(!engine.config().rescue);
    }

    #[test]
    fn test_phase_done_after_success() {
        let mut provider = RawProvider::new(512);
        let mut source =
            RandomAccess::new(Cursor::new(vec![1u8; 2048])).with_capacity(2048);
        let mut image = RandomAccess::new(Cursor::new(Vec::new()));

        let mut engine = Engine::new();
        let summary = engine.create(&mut provider, &mut source, &mut image).unwrap();

        assert_eq!(engine.phase(), Phase::Done);
        assert!(summary.completed);
        assert_eq!(summary.blocks_copied, 4);
        assert_eq!(summary.bytes_copied, 2048);
        assert!(summary.checksum.is_some());
    }

    #[test]
    fn test_phase_failed_after_error() {
        let mut engine = Engine::new();
        let mut target = RandomAccess::new(Cursor::new(Vec::new()));
        let err = engine
            .restore(&mut Cursor::new(vec![0u8; 64]), &mut target)
            .unwrap_err();

        assert!(matches!(err, Error::Format(_)));
        assert_eq!(engine.phase(), Phase::Failed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut engine = Engine::with_config(EngineConfig::new().sector_size(0));
        let mut source = RandomAccess::new(Cursor::new(vec![0u8; 512]));
        let mut image = RandomAccess::new(Cursor::new(Vec::new()));
        let err = engine
            .create(&mut RawProvider::new(512).device_size(512), &mut source, &mut image)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    // -------------------------------------------------------------------------
    // Reporter tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_reporter_sees_every_used_block_and_finish() {
        let mut reporter = MockProgressReporter::new();
        reporter.expect_update().times(3).return_const(());
        reporter
            .expect_finish()
            .times(1)
            .withf(|s: &Summary| s.completed && s.blocks_copied == 3)
            .return_const(());

        let mut provider = FixedProvider {
            block_size: 64,
            used: vec![0, 1, 2],
            total: 3,
        };
        let mut source = RandomAccess::new(Cursor::new(patterned(192)));
        let mut image = RandomAccess::new(Cursor::new(Vec::new()));

        Engine::new()
            .with_reporter(reporter)
            .create(&mut provider, &mut source, &mut image)
            .unwrap();
    }

    #[test]
    fn test_finish_called_on_failure() {
        let mut reporter = MockProgressReporter::new();
        reporter.expect_update().times(0);
        reporter
            .expect_finish()
            .times(1)
            .withf(|s: &Summary| !s.completed)
            .return_const(());

        let mut target = RandomAccess::new(Cursor::new(Vec::new()));
        let result = Engine::new()
            .with_reporter(reporter)
            .restore(&mut Cursor::new(Vec::new()), &mut target);
        assert!(result.is_err());
    }

    #[test]
    fn test_unused_runs_reported_every_interval() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);

        // 250 blocks, only block 0 used: updates after block 0, then at
        // skipped counts 100 and 200, then at the final block
        let mut provider = FixedProvider {
            block_size: 16,
            used: vec![0],
            total: 250,
        };
        let mut source = Sequential::new(Cursor::new(patterned(16 * 250)));
        let mut image = Sequential::new(Vec::new());

        Engine::new()
            .on_progress(move |s| sink.lock().unwrap().push((s.block_id, s.done)))
            .create(&mut provider, &mut source, &mut image)
            .unwrap();

        let states = states.lock().unwrap();
        assert_eq!(
            *states,
            vec![(0, false), (100, false), (200, false), (249, true)]
        );
    }

    // -------------------------------------------------------------------------
    // Cancellation tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_cancel_stops_run() {
        let mut provider = RawProvider::new(512).device_size(512 * 100);
        let mut source = RandomAccess::new(Cursor::new(patterned(512 * 100)));
        let mut image = RandomAccess::new(Cursor::new(Vec::new()));

        let mut engine = Engine::new();
        let cancel = engine.cancel_handle();
        let flag = Arc::clone(&cancel);
        engine = engine.on_progress(move |s| {
            if s.copied == 10 {
                flag.store(true, Ordering::SeqCst);
            }
        });

        let err = engine
            .create(&mut provider, &mut source, &mut image)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(engine.phase(), Phase::Failed);

        let written = image.into_inner().into_inner();
        let header = ImageHeader::new("RAW", 512, 100, 100, 51_200);
        assert_eq!(
            written.len() as u64,
            header.data_offset() + 10 * header.record_size()
        );
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    #[test]
    fn test_memory_check() {
        let mut provider = RawProvider::new(4096).device_size(4096 * 1000);
        let mut source = RandomAccess::new(Cursor::new(Vec::new()));
        let mut image = RandomAccess::new(Cursor::new(Vec::new()));

        let err = Engine::new()
            .available_memory(Some(1000))
            .create(&mut provider, &mut source, &mut image)
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        assert!(image.into_inner().into_inner().is_empty());
    }

    #[test]
    fn test_free_space_check() {
        let mut provider = RawProvider::new(512).device_size(512 * 8);
        let mut source = RandomAccess::new(Cursor::new(vec![0u8; 512 * 8]));
        let mut image = RandomAccess::new(Cursor::new(Vec::new())).with_available_space(1024);

        let err = Engine::new()
            .create(&mut provider, &mut source, &mut image)
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));

        let mut image = RandomAccess::new(Cursor::new(Vec::new())).with_available_space(1024);
        let mut source = RandomAccess::new(Cursor::new(vec![0u8; 512 * 8]));
        Engine::with_config(EngineConfig::new().check_free_space(false))
            .create(&mut provider, &mut source, &mut image)
            .unwrap();
    }

    #[test]
    fn test_unknown_capacity_skips_size_check() {
        let mut provider = FixedProvider {
            block_size: 32,
            used: vec![1],
            total: 4,
        };
        let image = make_image(&mut provider, &patterned(128));
        let mut target = Sequential::new(Vec::new());

        Engine::new()
            .restore(&mut Cursor::new(image), &mut target)
            .unwrap();
        assert_eq!(target.into_inner().len(), 128);
    }

    #[test]
    fn test_oversized_geometry_rejected_before_allocation() {
        for (block_size, total) in [(4096, 1u64 << 60), (512, u64::MAX - 4)] {
            let header = ImageHeader::new("RAW", block_size, total, 0, 0);
            let image = header.encode().to_vec();

            let err = Engine::new()
                .available_memory(Some(64 << 20))
                .check(&mut Cursor::new(image.clone()))
                .unwrap_err();
            assert!(matches!(err, Error::CorruptHeader(_)), "got {err:?}");

            let mut target = Sequential::new(Vec::new());
            let err = Engine::new()
                .restore(&mut Cursor::new(image), &mut target)
                .unwrap_err();
            assert!(matches!(err, Error::CorruptHeader(_)), "got {err:?}");
        }
    }

    #[test]
    fn test_memory_check_rejects_huge_bitmap() {
        let header = ImageHeader::new("RAW", 4096, 1 << 40, 0, 0);
        let err = Engine::new()
            .available_memory(Some(64 << 20))
            .check(&mut Cursor::new(header.encode().to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)), "got {err:?}");
    }

    #[test]
    fn test_check_mode_ignores_capacity() {
        let mut provider = FixedProvider {
            block_size: 32,
            used: vec![0, 3],
            total: 4,
        };
        let image = make_image(&mut provider, &patterned(128));

        let summary = Engine::new().check(&mut Cursor::new(image)).unwrap();
        assert_eq!(summary.mode, Mode::Check);
        assert_eq!(summary.blocks_copied, 2);
    }

    // -------------------------------------------------------------------------
    // Rescue tests
    // -------------------------------------------------------------------------

    /// Pipe that fails once when the stream reaches `fail_at`
    struct FailOnce {
        data: Cursor<Vec<u8>>,
        fail_at: u64,
        failed: bool,
    }

    impl Read for FailOnce {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pos = self.data.position();
            if self.failed || pos > self.fail_at {
                return self.data.read(buf);
            }
            if pos == self.fail_at {
                self.failed = true;
                return Err(io::Error::from_raw_os_error(5));
            }
            let len = buf.len().min((self.fail_at - pos) as usize);
            self.data.read(&mut buf[..len])
        }
    }

    #[test]
    fn test_sequential_rescue_after_partial_block_read() {
        let device: Vec<u8> = [1u8, 2, 3, 4].iter().flat_map(|&b| [b; 512]).collect();
        let mut provider = FixedProvider {
            block_size: 1024,
            used: vec![0, 1],
            total: 2,
        };
        let mut source = Sequential::new(FailOnce {
            data: Cursor::new(device.clone()),
            fail_at: 512,
            failed: false,
        });
        let mut image = Sequential::new(Vec::new());

        let summary = Engine::with_config(EngineConfig::new().rescue(true))
            .create(&mut provider, &mut source, &mut image)
            .unwrap();
        assert_eq!(summary.blocks_copied, 2);
        assert_eq!(summary.bad_sectors, 0);

        let image = image.into_inner();
        let mut target = Sequential::new(Vec::new());
        Engine::new()
            .restore(&mut Cursor::new(image), &mut target)
            .unwrap();
        assert_eq!(target.into_inner(), device);
    }
}
