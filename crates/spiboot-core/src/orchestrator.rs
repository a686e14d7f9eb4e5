//! Multi-target boot orchestration
//!
//! The orchestrator resets every target once, then runs one worker thread
//! per physical SPI bus. Targets on the same bus are booted one after the
//! other by that bus's worker; different buses run in parallel and fail
//! independently.
//!
//! Cancellation is cooperative. When the [`CancelToken`] is set, workers
//! stop at the next chunk boundary. Workers that have not reported within
//! the grace period are abandoned: their channels are force-closed, which
//! makes any further transfer on them fail immediately. Cleanup (channel
//! close and GPIO release) runs on every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::channel::ChannelManager;
use crate::config::DeviceConfig;
use crate::error::{BootError, ConfigError, FileError};
use crate::image::FirmwareImage;
use crate::programmer::{GpioPort, SpiChannelDriver};
use crate::sequence::BootSequencer;
use crate::target::{ChannelKey, TargetConfig};
use crate::transfer::{BootResult, NoProgress, TransferEngine, TransferProgress};

/// Time workers get to finish their in-flight chunk after cancellation
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// How often the orchestrator checks the cancel token while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One target and the image to boot it with
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Target to boot
    pub target: TargetConfig,
    /// Prepared image; `None` skips the target
    pub image: Option<FirmwareImage>,
}

impl TransferJob {
    /// Create a job
    pub fn new(target: TargetConfig, image: Option<FirmwareImage>) -> Self {
        Self { target, image }
    }

    /// Create a job, loading the image (if any) for the target's bit order
    pub fn load(target: &TargetConfig, path: Option<&Path>) -> Result<Self, FileError> {
        let image = path
            .map(|p| FirmwareImage::load(p, target.family.bit_order()))
            .transpose()?;
        Ok(Self::new(target.clone(), image))
    }

    /// Build one job per configured target from per-channel image paths
    ///
    /// Targets without a path are skipped. A path for a channel the
    /// configuration does not describe is a configuration error. Every
    /// image is read before this returns, so no hardware is touched on a
    /// missing file.
    pub fn for_config(
        config: &DeviceConfig,
        paths: &BTreeMap<ChannelKey, PathBuf>,
    ) -> Result<Vec<Self>, BootError> {
        if let Some(key) = paths.keys().find(|k| config.target(**k).is_none()) {
            return Err(ConfigError::invalid(
                format!("spi.{}.cs.{}", key.bus, key.chip_select),
                "no target configured on this chip-select",
            )
            .into());
        }

        config
            .targets
            .iter()
            .map(|target| {
                TransferJob::load(target, paths.get(&target.key).map(PathBuf::as_path))
                    .map_err(BootError::from)
            })
            .collect()
    }
}

/// A job that has an image, as handed to a worker
struct ActiveJob {
    id: usize,
    target: TargetConfig,
    image: FirmwareImage,
}

/// Results of a run, in job order
#[derive(Debug)]
pub struct BootSummary {
    /// One result per job
    pub results: Vec<BootResult>,
    /// Whether the run was cancelled
    pub interrupted: bool,
}

impl BootSummary {
    /// Jobs that failed
    pub fn failed(&self) -> impl Iterator<Item = &BootResult> {
        self.results.iter().filter(|r| r.is_failed())
    }

    /// Whether no job failed and the run was not interrupted
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.failed().next().is_none()
    }

    /// Bytes sent across all jobs
    pub fn total_bytes(&self) -> usize {
        self.results.iter().map(|r| r.bytes_sent).sum()
    }

    /// Log one line per job plus a total
    pub fn log_report(&self) {
        for r in &self.results {
            if r.is_failed() {
                log::error!("{} ({}): {}", r.target, r.key, r.outcome);
            } else {
                log::info!(
                    "{} ({}): {}, {} bytes in {:.2?}",
                    r.target,
                    r.key,
                    r.outcome,
                    r.bytes_sent,
                    r.elapsed
                );
            }
        }

        let count = |f: fn(&BootResult) -> bool| self.results.iter().filter(|r| f(r)).count();
        log::info!(
            "{} booted, {} failed, {} skipped",
            count(BootResult::is_success),
            count(BootResult::is_failed),
            count(BootResult::is_skipped)
        );
    }
}

/// Runs a set of transfer jobs across per-bus workers
pub struct Orchestrator {
    gpio: Arc<dyn GpioPort>,
    channels: Arc<ChannelManager>,
    cancel: CancelToken,
    grace: Duration,
    progress: Arc<dyn TransferProgress>,
}

impl Orchestrator {
    /// Create an orchestrator over the given backends
    pub fn new(
        gpio: Arc<dyn GpioPort>,
        driver: Arc<dyn SpiChannelDriver>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            gpio,
            channels: Arc::new(ChannelManager::new(driver)),
            cancel,
            grace: DEFAULT_GRACE,
            progress: Arc::new(NoProgress),
        }
    }

    /// Set the grace period granted after cancellation
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Report progress to `progress`
    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// The channel manager shared with workers
    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// Boot every job and report per-job results
    ///
    /// Only a reset/strap sequencing failure aborts the run with an error;
    /// channel and transfer failures are reported per job.
    pub fn run(&self, jobs: Vec<TransferJob>) -> Result<BootSummary, BootError> {
        let mut results: BTreeMap<usize, BootResult> = BTreeMap::new();
        let mut by_bus: BTreeMap<u8, Vec<ActiveJob>> = BTreeMap::new();

        for (id, job) in jobs.into_iter().enumerate() {
            match job.image {
                Some(image) => by_bus
                    .entry(job.target.key.bus)
                    .or_default()
                    .push(ActiveJob {
                        id,
                        target: job.target,
                        image,
                    }),
                None => {
                    log::warn!("{}: no program file supplied, skipping", job.target.name);
                    self.record(&mut results, BootResult::skipped(id, &job.target));
                }
            }
        }

        let pending: BTreeMap<usize, TargetConfig> = by_bus
            .values()
            .flatten()
            .map(|job| (job.id, job.target.clone()))
            .collect();

        let sequencer = BootSequencer::new(self.gpio.as_ref());
        if let Err(e) = sequencer.prepare(pending.values()) {
            log::error!("Reset sequence failed: {}", e);
            self.cleanup();
            return Err(e.into());
        }

        // Spawning is the barrier: every reset above has completed before
        // any worker can open a channel.
        let (tx, rx) = mpsc::channel();
        let mut workers: Vec<(u8, JoinHandle<()>)> = Vec::new();
        let mut outstanding = 0;
        for (bus, jobs) in by_bus {
            let ids: Vec<usize> = jobs.iter().map(|j| j.id).collect();
            match self.spawn_worker(bus, jobs, tx.clone()) {
                Ok(handle) => {
                    outstanding += ids.len();
                    workers.push((bus, handle));
                }
                Err(source) => {
                    log::error!("Could not start worker for spi{}: {}", bus, source);
                    for id in ids {
                        let error = BootError::WorkerSpawn {
                            bus,
                            source: std::io::Error::new(source.kind(), source.to_string()),
                        };
                        self.record(&mut results, BootResult::failed(id, &pending[&id], error));
                    }
                }
            }
        }
        drop(tx);

        let mut deadline: Option<Instant> = None;
        let mut abandoned = false;
        while outstanding > 0 {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(result) => {
                    outstanding -= 1;
                    results.insert(result.job, result);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.cancel.is_cancelled() {
                let deadline = *deadline.get_or_insert_with(|| {
                    log::warn!(
                        "Interrupted, waiting up to {} ms for in-flight transfers",
                        self.grace.as_millis()
                    );
                    Instant::now() + self.grace
                });
                if outstanding > 0 && Instant::now() >= deadline {
                    log::warn!("Grace period expired, forcing shutdown");
                    abandoned = true;
                    break;
                }
            }
        }

        let mut panicked = BTreeSet::new();
        for (bus, handle) in workers {
            if abandoned && !handle.is_finished() {
                log::warn!("Worker for spi{} did not stop, abandoning it", bus);
                continue;
            }
            if handle.join().is_err() {
                log::error!("Worker for spi{} panicked", bus);
                panicked.insert(bus);
            }
        }
        while let Ok(result) = rx.try_recv() {
            results.entry(result.job).or_insert(result);
        }

        self.cleanup();

        for (id, target) in &pending {
            if !results.contains_key(id) {
                let error = if panicked.contains(&target.key.bus) {
                    BootError::WorkerPanicked {
                        bus: target.key.bus,
                    }
                } else {
                    BootError::Interrupted
                };
                self.record(&mut results, BootResult::failed(*id, target, error));
            }
        }

        Ok(BootSummary {
            results: results.into_values().collect(),
            interrupted: self.cancel.is_cancelled(),
        })
    }

    fn spawn_worker(
        &self,
        bus: u8,
        jobs: Vec<ActiveJob>,
        tx: Sender<BootResult>,
    ) -> std::io::Result<JoinHandle<()>> {
        let channels = Arc::clone(&self.channels);
        let cancel = self.cancel.clone();
        let progress = Arc::clone(&self.progress);

        thread::Builder::new()
            .name(format!("spi{}", bus))
            .spawn(move || {
                let engine = TransferEngine::new(&cancel, progress.as_ref());
                for job in jobs {
                    let result = engine.boot(&channels, job.id, &job.target, &job.image);
                    if tx.send(result).is_err() {
                        // The orchestrator has stopped listening
                        break;
                    }
                }
            })
    }

    fn record(&self, results: &mut BTreeMap<usize, BootResult>, result: BootResult) {
        self.progress.finished(result.job, &result);
        results.insert(result.job, result);
    }

    /// Close every channel still open and release GPIO lines
    ///
    /// Failures are logged only, so they never hide the error that led here.
    fn cleanup(&self) {
        let forced = self.channels.close_all();
        if forced > 0 {
            log::warn!("Force-closed {} channel(s) left open", forced);
        }
        if let Err(e) = self.gpio.cleanup() {
            log::warn!("GPIO cleanup failed: {}", e);
        }
    }
}
