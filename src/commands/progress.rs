//! Progress reporting using indicatif progress bars

use std::collections::BTreeMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use spiboot_core::target::TargetConfig;
use spiboot_core::transfer::{BootResult, Outcome, TransferProgress};

/// One bar per job, all drawn together
pub struct IndicatifProgress {
    multi: MultiProgress,
    bars: Mutex<BTreeMap<usize, ProgressBar>>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(BTreeMap::new()),
        }
    }

    fn bar(&self, job: usize) -> Option<ProgressBar> {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.get(&job).cloned()
    }
}

impl TransferProgress for IndicatifProgress {
    fn started(&self, job: usize, target: &TargetConfig, total: usize) {
        let pb = self.multi.add(ProgressBar::new(total as u64));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} {prefix:10} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_prefix(target.name.clone());
        pb.set_message(target.family.to_string());

        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.insert(job, pb);
    }

    fn chunk_sent(&self, job: usize, sent: usize) {
        if let Some(pb) = self.bar(job) {
            pb.set_position(sent as u64);
        }
    }

    fn finished(&self, job: usize, result: &BootResult) {
        let Some(pb) = self.bar(job) else {
            return;
        };
        match &result.outcome {
            Outcome::Success => pb.finish_with_message("done"),
            Outcome::Failed(e) if e.is_interrupted() => pb.abandon_with_message("interrupted"),
            Outcome::Failed(_) => pb.abandon_with_message("FAILED"),
            Outcome::Skipped => pb.finish_and_clear(),
        }
    }
}
