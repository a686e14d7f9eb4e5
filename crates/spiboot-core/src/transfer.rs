//! Chunked image streaming
//!
//! [`TransferEngine`] pushes a prepared [`FirmwareImage`] through one open
//! channel in `buffer_size` chunks. Chunks go out strictly in order and
//! back-to-back; the cancel token is checked between chunks, so a chunk
//! that has started is always allowed to finish.
//!
//! A failure aborts the remaining chunks and closes the channel. Nothing is
//! retried here; a retry is a fresh job.

use std::fmt;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::channel::{ChannelHandle, ChannelManager};
use crate::error::{BootError, ChannelError};
use crate::image::FirmwareImage;
use crate::target::{ChannelKey, TargetConfig};

/// Progress callbacks, keyed by job id
///
/// Called from worker threads. All methods default to doing nothing.
pub trait TransferProgress: Send + Sync {
    /// A job is about to send `total` bytes
    fn started(&self, _job: usize, _target: &TargetConfig, _total: usize) {}

    /// A chunk went out; `sent` is the running total
    fn chunk_sent(&self, _job: usize, _sent: usize) {}

    /// A job finished, successfully or not
    fn finished(&self, _job: usize, _result: &BootResult) {}
}

/// Progress sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl TransferProgress for NoProgress {}

/// How a job ended
#[derive(Debug)]
pub enum Outcome {
    /// Every byte was sent
    Success,
    /// The job stopped early
    Failed(BootError),
    /// No image was supplied for the target
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("ok"),
            Outcome::Failed(e) => write!(f, "FAILED: {}", e),
            Outcome::Skipped => f.write_str("skipped"),
        }
    }
}

/// Per-job report
#[derive(Debug)]
pub struct BootResult {
    /// Job id (index in the job list)
    pub job: usize,
    /// Target display name
    pub target: String,
    /// Channel the job used
    pub key: ChannelKey,
    /// Bytes acknowledged by the channel
    pub bytes_sent: usize,
    /// Chunks sent
    pub chunks: usize,
    /// Wall-clock time spent streaming
    pub elapsed: Duration,
    /// Result
    pub outcome: Outcome,
}

impl BootResult {
    fn new(job: usize, target: &TargetConfig, outcome: Outcome) -> Self {
        Self {
            job,
            target: target.name.clone(),
            key: target.key,
            bytes_sent: 0,
            chunks: 0,
            elapsed: Duration::ZERO,
            outcome,
        }
    }

    /// Result for a target that had no image
    pub fn skipped(job: usize, target: &TargetConfig) -> Self {
        Self::new(job, target, Outcome::Skipped)
    }

    /// Result for a job that failed before sending anything
    pub fn failed(job: usize, target: &TargetConfig, error: BootError) -> Self {
        Self::new(job, target, Outcome::Failed(error))
    }

    /// Whether every byte was sent
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    /// Whether the job failed (including interruption)
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }

    /// Whether the job was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, Outcome::Skipped)
    }

    /// Failure cause, if any
    pub fn error(&self) -> Option<&BootError> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Average throughput in bytes per second
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (self.bytes_sent > 0 && secs > 0.0).then(|| self.bytes_sent as f64 / secs)
    }
}

/// Streams images through open channels
pub struct TransferEngine<'a> {
    cancel: &'a CancelToken,
    progress: &'a dyn TransferProgress,
}

impl<'a> TransferEngine<'a> {
    /// Create an engine observing `cancel` and reporting to `progress`
    pub fn new(cancel: &'a CancelToken, progress: &'a dyn TransferProgress) -> Self {
        Self { cancel, progress }
    }

    /// Open the target's channel, stream the image and close the channel
    pub fn boot(
        &self,
        channels: &ChannelManager,
        job: usize,
        target: &TargetConfig,
        image: &FirmwareImage,
    ) -> BootResult {
        if self.cancel.is_cancelled() {
            return self.finish(BootResult::failed(job, target, BootError::Interrupted));
        }
        if image.is_empty() {
            log::info!("{}: image is empty, nothing to send", target.name);
            return self.finish(BootResult::new(job, target, Outcome::Success));
        }

        let mut handle = match channels.open(target) {
            Ok(handle) => handle,
            Err(e) => return self.finish(BootResult::failed(job, target, e.into())),
        };
        let result = self.stream(job, target, image, &mut handle);
        handle.close();
        result
    }

    /// Stream `image` through an already open channel
    ///
    /// On failure the handle is closed before returning.
    pub fn stream(
        &self,
        job: usize,
        target: &TargetConfig,
        image: &FirmwareImage,
        handle: &mut ChannelHandle<'_>,
    ) -> BootResult {
        let mut result = BootResult::new(job, target, Outcome::Success);
        self.progress.started(job, target, image.len());
        log::info!(
            "{}: sending {} bytes to {} on {} in {}-byte chunks",
            target.name,
            image.len(),
            target.family,
            handle.key(),
            target.buffer_size
        );

        let start = Instant::now();
        for chunk in image.bytes().chunks(target.buffer_size) {
            if self.cancel.is_cancelled() {
                result.outcome = Outcome::Failed(BootError::Interrupted);
                break;
            }
            if let Err(e) = handle.transfer(result.bytes_sent, chunk) {
                handle.close();
                result.outcome = Outcome::Failed(self.classify(e));
                break;
            }
            result.chunks += 1;
            result.bytes_sent += chunk.len();
            log::debug!(
                "transfer: {} chunk {} ({} bytes, {}/{})",
                handle.key(),
                result.chunks,
                chunk.len(),
                result.bytes_sent,
                image.len()
            );
            self.progress.chunk_sent(job, result.bytes_sent);
        }
        result.elapsed = start.elapsed();

        match &result.outcome {
            Outcome::Success => match result.throughput() {
                Some(rate) => log::info!(
                    "{}: sent {} bytes in {:.2?} ({:.1} KiB/s)",
                    target.name,
                    result.bytes_sent,
                    result.elapsed,
                    rate / 1024.0
                ),
                None => log::info!("{}: sent {} bytes", target.name, result.bytes_sent),
            },
            Outcome::Failed(e) => log::error!(
                "{}: stopped after {} of {} bytes: {}",
                target.name,
                result.bytes_sent,
                image.len(),
                e
            ),
            Outcome::Skipped => {}
        }
        self.finish(result)
    }

    /// A channel closed underneath us during cancellation was force-closed
    /// by cleanup, which makes the job interrupted rather than broken.
    fn classify(&self, error: ChannelError) -> BootError {
        match error {
            ChannelError::Closed(_) if self.cancel.is_cancelled() => BootError::Interrupted,
            e => e.into(),
        }
    }

    fn finish(&self, result: BootResult) -> BootResult {
        self.progress.finished(result.job, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{SpiMode, TargetFamily, SETTLE_FLOOR};
    use crate::testutil::{Event, MockHw};
    use crate::transform::BitOrder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn target(buffer_size: usize) -> TargetConfig {
        TargetConfig {
            name: "dsp".into(),
            family: TargetFamily::Adsp21489,
            key: ChannelKey::new(0, 0),
            pins: None,
            reset_pin: None,
            strap_pins: Default::default(),
            clock_hz: 1_000_000,
            buffer_size,
            mode: SpiMode::MODE_3,
            settle: SETTLE_FLOOR,
        }
    }

    fn image(len: usize) -> FirmwareImage {
        let raw: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        FirmwareImage::from_bytes(raw, BitOrder::MsbFirst)
    }

    /// Cancels the token once `after` chunks have gone out
    struct CancelAfter {
        token: CancelToken,
        after: usize,
        seen: AtomicUsize,
    }

    impl TransferProgress for CancelAfter {
        fn chunk_sent(&self, _job: usize, _sent: usize) {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.token.cancel();
            }
        }
    }

    #[test]
    fn test_chunks_in_order() {
        let hw = Arc::new(MockHw::new());
        let channels = ChannelManager::new(hw.clone());
        let cancel = CancelToken::new();
        let engine = TransferEngine::new(&cancel, &NoProgress);
        let image = image(10_000);

        let result = engine.boot(&channels, 0, &target(4096), &image);
        assert!(result.is_success());
        assert_eq!(result.bytes_sent, 10_000);
        assert_eq!(result.chunks, 3);

        let transfers = hw.transfers();
        let sizes: Vec<usize> = transfers.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert_eq!(transfers.concat(), image.bytes());
        assert!(channels.open_set().is_empty());
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        for (len, size, expected) in [(1, 1, 1), (4096, 4096, 1), (4097, 4096, 2), (10, 3, 4)] {
            let hw = Arc::new(MockHw::new());
            let channels = ChannelManager::new(hw.clone());
            let cancel = CancelToken::new();
            let engine = TransferEngine::new(&cancel, &NoProgress);
            let image = image(len);

            let result = engine.boot(&channels, 0, &target(size), &image);
            assert_eq!(result.chunks, expected, "len {} size {}", len, size);
            assert_eq!(hw.transfers().concat(), image.bytes());
        }
    }

    #[test]
    fn test_empty_image_is_noop() {
        let hw = Arc::new(MockHw::new());
        let channels = ChannelManager::new(hw.clone());
        let cancel = CancelToken::new();
        let engine = TransferEngine::new(&cancel, &NoProgress);

        let result = engine.boot(&channels, 0, &target(64), &image(0));
        assert!(result.is_success());
        assert_eq!(result.bytes_sent, 0);
        assert!(hw.events().is_empty());
    }

    #[test]
    fn test_failure_aborts_and_closes() {
        let hw = Arc::new(MockHw {
            fail_transfer_at: Some(1),
            ..MockHw::default()
        });
        let channels = ChannelManager::new(hw.clone());
        let cancel = CancelToken::new();
        let engine = TransferEngine::new(&cancel, &NoProgress);

        let result = engine.boot(&channels, 0, &target(4096), &image(10_000));
        assert_eq!(result.bytes_sent, 4096);
        assert!(matches!(
            result.error(),
            Some(BootError::Channel(ChannelError::TransferFailed { offset: 4096, .. }))
        ));
        assert_eq!(hw.transfers().len(), 1);
        assert!(channels.open_set().is_empty());

        let closes = hw
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Close(_)))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_open_failure() {
        let hw = Arc::new(MockHw {
            fail_open: true,
            ..MockHw::default()
        });
        let channels = ChannelManager::new(hw);
        let cancel = CancelToken::new();
        let engine = TransferEngine::new(&cancel, &NoProgress);

        let result = engine.boot(&channels, 3, &target(64), &image(100));
        assert_eq!(result.job, 3);
        assert!(matches!(
            result.error(),
            Some(BootError::Channel(ChannelError::OpenFailed { .. }))
        ));
    }

    #[test]
    fn test_cancel_between_chunks() {
        let hw = Arc::new(MockHw::new());
        let channels = ChannelManager::new(hw.clone());
        let cancel = CancelToken::new();
        let progress = CancelAfter {
            token: cancel.clone(),
            after: 1,
            seen: AtomicUsize::new(0),
        };
        let engine = TransferEngine::new(&cancel, &progress);

        let result = engine.boot(&channels, 0, &target(4096), &image(10_000));
        assert!(matches!(result.error(), Some(BootError::Interrupted)));
        assert_eq!(result.bytes_sent, 4096);
        assert_eq!(hw.transfers().len(), 1);
        assert!(channels.open_set().is_empty());
    }

    #[test]
    fn test_cancelled_before_open() {
        let hw = Arc::new(MockHw::new());
        let channels = ChannelManager::new(hw.clone());
        let cancel = CancelToken::new();
        cancel.cancel();
        let engine = TransferEngine::new(&cancel, &NoProgress);

        let result = engine.boot(&channels, 0, &target(64), &image(100));
        assert!(result.error().is_some_and(BootError::is_interrupted));
        assert!(hw.events().is_empty());
    }

    #[test]
    fn test_outcome_display() {
        let t = target(64);
        assert_eq!(BootResult::skipped(0, &t).outcome.to_string(), "skipped");
        assert_eq!(
            BootResult::failed(0, &t, BootError::Interrupted)
                .outcome
                .to_string(),
            "FAILED: interrupted"
        );
    }
}
