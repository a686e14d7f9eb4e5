//! Boot command implementations
//!
//! All three loaders share one flow: load and validate the configuration,
//! read every program file, then hand the jobs to the orchestrator. Nothing
//! touches hardware until the first two steps have succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use spiboot_core::config::{ConfigLayout, DeviceConfig};
use spiboot_core::orchestrator::{BootSummary, Orchestrator, TransferJob, DEFAULT_GRACE};
use spiboot_core::target::ChannelKey;
use spiboot_core::{BootError, CancelToken};

use super::progress::IndicatifProgress;
use crate::backends;
use crate::cli::ChannelImage;
use crate::RunError;

/// Options shared by every boot command
pub struct BootOptions<'a> {
    pub backend: &'a str,
    pub grace: Duration,
}

impl<'a> BootOptions<'a> {
    pub fn new(backend: &'a str) -> Self {
        Self {
            backend,
            grace: DEFAULT_GRACE,
        }
    }
}

/// Boot a single DSP
pub fn run_dsp(opts: &BootOptions<'_>, program: &Path, config: &Path) -> Result<(), RunError> {
    let config = DeviceConfig::from_file(config, ConfigLayout::SingleDsp)?;
    let images = config
        .targets
        .iter()
        .map(|t| (t.key, program.to_path_buf()))
        .collect();
    boot(opts, &config, &images)
}

/// Boot up to three DSPs
pub fn run_multi(
    opts: &BootOptions<'_>,
    programs: &[ChannelImage],
    config: &Path,
) -> Result<(), RunError> {
    let config = DeviceConfig::from_file(config, ConfigLayout::MultiDsp)?;
    let images = channel_images(programs)?;
    boot(opts, &config, &images)
}

/// Load a bitstream into the FPGA
pub fn run_spartan(
    opts: &BootOptions<'_>,
    program: &Path,
    config: &Path,
    speed: Option<u32>,
) -> Result<(), RunError> {
    let mut config = DeviceConfig::from_file(config, ConfigLayout::Spartan)?;
    if let Some(hz) = speed {
        log::info!("Overriding SPI clock with {} Hz", hz);
        config = config.with_clock_hz(hz)?;
    }
    let images = config
        .targets
        .iter()
        .map(|t| (t.key, program.to_path_buf()))
        .collect();
    boot(opts, &config, &images)
}

/// Index `BUS.CS=PATH` arguments by channel, rejecting duplicates
fn channel_images(programs: &[ChannelImage]) -> Result<BTreeMap<ChannelKey, PathBuf>, RunError> {
    let mut images = BTreeMap::new();
    for image in programs {
        if images.insert(image.key, image.path.clone()).is_some() {
            return Err(RunError::DuplicateProgram(image.key));
        }
    }
    Ok(images)
}

fn boot(
    opts: &BootOptions<'_>,
    config: &DeviceConfig,
    images: &BTreeMap<ChannelKey, PathBuf>,
) -> Result<(), RunError> {
    let jobs = TransferJob::for_config(config, images)?;
    let backend = backends::open_backend(opts.backend, config)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            log::warn!("Already stopping, please wait");
        } else {
            handler_token.cancel();
        }
    })?;

    let orchestrator = Orchestrator::new(backend.gpio.clone(), backend.driver.clone(), cancel)
        .with_grace(opts.grace)
        .with_progress(Arc::new(IndicatifProgress::new()));

    log::info!(
        "Booting {} target(s) via {}",
        jobs.iter().filter(|j| j.image.is_some()).count(),
        orchestrator.channels().driver().name()
    );
    let summary = orchestrator.run(jobs)?;
    summary.log_report();
    backend.log_summary();

    check_summary(&summary)
}

/// Map a finished run onto the process outcome
fn check_summary(summary: &BootSummary) -> Result<(), RunError> {
    if summary.interrupted {
        return Err(BootError::Interrupted.into());
    }
    let failed = summary.failed().count();
    if failed > 0 {
        return Err(RunError::JobsFailed {
            failed,
            total: summary.results.len(),
        });
    }
    println!(
        "Boot complete: {} bytes sent to {} target(s)",
        summary.total_bytes(),
        summary.results.iter().filter(|r| r.is_success()).count()
    );
    Ok(())
}
