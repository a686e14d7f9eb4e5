//! End-to-end boot runs against the dummy backend

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spiboot_core::config::{ConfigLayout, DeviceConfig};
use spiboot_core::orchestrator::{BootSummary, Orchestrator, TransferJob};
use spiboot_core::programmer::Level;
use spiboot_core::target::ChannelKey;
use spiboot_core::{BootError, CancelToken, ConfigError};

use super::*;

const SINGLE_DSP: &str = r#"{
    "spi": { "baudrate": 500000, "buffer_size": 4096 },
    "pin_mapping": { "cs": 8, "reset": 17, "miso": 9, "mosi": 10, "sclk": 11 }
}"#;

const MULTI_DSP: &str = r#"{
    "dsp_reset": 17,
    "spi": {
        "0": {
            "baudrate": 1000000, "buffer_size": 4096,
            "miso": 9, "mosi": 10, "sclk": 11, "cs": { "0": 8, "1": 7 }
        },
        "1": {
            "baudrate": 1000000, "buffer_size": 1024,
            "miso": 19, "mosi": 20, "sclk": 21, "cs": { "0": 16 }
        }
    }
}"#;

const SPARTAN: &str = r#"{
    "spi": { "bus": 0, "device": 0, "clock_speed": 8000000, "buffer_size": 2048 },
    "pin_mapping": { "program_b": 27, "init_b": 22 }
}"#;

fn write_image(name: &str, len: usize) -> PathBuf {
    let path = std::env::temp_dir().join(format!("spiboot-e2e-{}-{}", std::process::id(), name));
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

/// Parse, load images and boot, the way the CLI does
fn boot(
    config_text: &str,
    layout: ConfigLayout,
    images: &[(ChannelKey, &PathBuf)],
    hw: &Arc<DummyHardware>,
    cancel: CancelToken,
) -> Result<BootSummary, BootError> {
    let config = DeviceConfig::parse(config_text, layout)?;
    let paths: BTreeMap<ChannelKey, PathBuf> = images
        .iter()
        .map(|(key, path)| (*key, (*path).clone()))
        .collect();
    let jobs = TransferJob::for_config(&config, &paths)?;
    Orchestrator::new(hw.clone(), hw.clone(), cancel).run(jobs)
}

#[test]
fn test_image_streamed_in_buffer_sized_chunks() {
    let key = ChannelKey::new(0, 0);
    let path = write_image("chunks.ldr", 10_000);
    let hw = Arc::new(DummyHardware::default());

    let summary = boot(
        SINGLE_DSP,
        ConfigLayout::SingleDsp,
        &[(key, &path)],
        &hw,
        CancelToken::new(),
    )
    .unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.results[0].bytes_sent, 10_000);
    assert_eq!(summary.results[0].chunks, 3);
    assert_eq!(hw.chunk_sizes(key), vec![4096, 4096, 1808]);

    // The DSP receives the file bit-reversed, byte for byte
    let file = std::fs::read(&path).unwrap();
    let expected: Vec<u8> = file.iter().map(|b| b.reverse_bits()).collect();
    assert_eq!(hw.received(key), expected);

    // Reset is pulsed and released before the channel opens
    let events = hw.events();
    let open = events.iter().position(|e| *e == Event::Open(key)).unwrap();
    let release = events
        .iter()
        .position(|e| *e == Event::Write(17, Level::High))
        .unwrap();
    assert!(release < open);
    assert!(hw.open_channels().is_empty());
    assert_eq!(events.last(), Some(&Event::Cleanup));

    std::fs::remove_file(path).ok();
}

#[test]
fn test_missing_buffer_size_fails_before_hardware() {
    let text = SINGLE_DSP.replace(r#", "buffer_size": 4096"#, "");
    let path = write_image("nobuf.ldr", 16);
    let hw = Arc::new(DummyHardware::default());

    let err = boot(
        &text,
        ConfigLayout::SingleDsp,
        &[(ChannelKey::new(0, 0), &path)],
        &hw,
        CancelToken::new(),
    )
    .unwrap_err();
    match err {
        BootError::Config(e @ ConfigError::Missing { .. }) => {
            assert_eq!(e.field(), Some("spi.buffer_size"))
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(hw.events().is_empty());

    std::fs::remove_file(path).ok();
}

#[test]
fn test_skipped_job_does_not_block_siblings() {
    let a = write_image("skip-a.ldr", 5000);
    let b = write_image("skip-b.ldr", 3000);
    let hw = Arc::new(DummyHardware::default());

    let summary = boot(
        MULTI_DSP,
        ConfigLayout::MultiDsp,
        &[(ChannelKey::new(0, 0), &a), (ChannelKey::new(1, 0), &b)],
        &hw,
        CancelToken::new(),
    )
    .unwrap();

    assert!(summary.is_success());
    let by_key: BTreeMap<ChannelKey, _> = summary.results.iter().map(|r| (r.key, r)).collect();
    assert!(by_key[&ChannelKey::new(0, 0)].is_success());
    assert!(by_key[&ChannelKey::new(0, 1)].is_skipped());
    assert_eq!(by_key[&ChannelKey::new(0, 1)].bytes_sent, 0);
    assert!(by_key[&ChannelKey::new(1, 0)].is_success());
    assert_eq!(hw.chunk_sizes(ChannelKey::new(1, 0)), vec![1024, 1024, 952]);

    // One shared reset for all targets
    let resets = hw
        .events()
        .iter()
        .filter(|e| **e == Event::Write(17, Level::Low))
        .count();
    assert_eq!(resets, 1);
    assert!(!hw.events().contains(&Event::Open(ChannelKey::new(0, 1))));

    std::fs::remove_file(a).ok();
    std::fs::remove_file(b).ok();
}

#[test]
fn test_failure_isolated_to_its_bus() {
    let a = write_image("iso-a.ldr", 9000);
    let b = write_image("iso-b.ldr", 9000);
    let c = write_image("iso-c.ldr", 3000);
    let hw = Arc::new(DummyHardware::new(DummyConfig {
        fail_transfer: [(ChannelKey::new(1, 0), 1)].into_iter().collect(),
        ..DummyConfig::default()
    }));

    let summary = boot(
        MULTI_DSP,
        ConfigLayout::MultiDsp,
        &[
            (ChannelKey::new(0, 0), &a),
            (ChannelKey::new(0, 1), &b),
            (ChannelKey::new(1, 0), &c),
        ],
        &hw,
        CancelToken::new(),
    )
    .unwrap();

    assert!(!summary.is_success());
    let failed: Vec<ChannelKey> = summary.failed().map(|r| r.key).collect();
    assert_eq!(failed, vec![ChannelKey::new(1, 0)]);
    assert_eq!(summary.results[2].bytes_sent, 1024);
    assert!(matches!(
        summary.results[2].error(),
        Some(BootError::Channel(_))
    ));

    // Both targets on bus 0 got their full image, one after the other
    assert_eq!(hw.received(ChannelKey::new(0, 0)).len(), 9000);
    assert_eq!(hw.received(ChannelKey::new(0, 1)).len(), 9000);
    let events = hw.events();
    let close_first = events
        .iter()
        .position(|e| *e == Event::Close(ChannelKey::new(0, 0)))
        .unwrap();
    let open_second = events
        .iter()
        .position(|e| *e == Event::Open(ChannelKey::new(0, 1)))
        .unwrap();
    assert!(close_first < open_second);
    assert!(hw.open_channels().is_empty());

    for path in [a, b, c] {
        std::fs::remove_file(path).ok();
    }
}

#[test]
fn test_interrupt_mid_transfer() {
    let a = write_image("int-a.ldr", 40_000);
    let b = write_image("int-b.ldr", 2000);
    let cancel = CancelToken::new();
    let interrupted = ChannelKey::new(0, 0);
    let hw = Arc::new(DummyHardware::new(DummyConfig {
        chunk_delay: Duration::from_millis(2),
        cancel_after: Some((interrupted, 1, cancel.clone())),
        ..DummyConfig::default()
    }));

    let summary = boot(
        MULTI_DSP,
        ConfigLayout::MultiDsp,
        &[(interrupted, &a), (ChannelKey::new(1, 0), &b)],
        &hw,
        cancel,
    )
    .unwrap();

    assert!(summary.interrupted);
    let first = &summary.results[0];
    assert_eq!(first.key, interrupted);
    assert!(first.error().is_some_and(BootError::is_interrupted));
    assert_eq!(first.bytes_sent, 2 * 4096);

    // The other bus either finished or stopped cleanly on the same signal
    let other = &summary.results[2];
    assert!(other.is_success() || other.error().is_some_and(BootError::is_interrupted));

    assert!(hw.open_channels().is_empty());
    assert!(hw.events().contains(&Event::Cleanup));

    std::fs::remove_file(a).ok();
    std::fs::remove_file(b).ok();
}

#[test]
fn test_stuck_worker_is_abandoned_after_grace() {
    let key = ChannelKey::new(0, 0);
    let path = write_image("stuck.ldr", 4096 * 8);
    let cancel = CancelToken::new();
    let hw = Arc::new(DummyHardware::new(DummyConfig {
        chunk_delay: Duration::from_millis(400),
        ..DummyConfig::default()
    }));

    let config = DeviceConfig::parse(SINGLE_DSP, ConfigLayout::SingleDsp).unwrap();
    let paths = [(key, path.clone())].into_iter().collect();
    let jobs = TransferJob::for_config(&config, &paths).unwrap();
    let orchestrator =
        Orchestrator::new(hw.clone(), hw.clone(), cancel.clone()).with_grace(Duration::from_millis(50));

    // Cancel while the first chunk is still on the wire
    let trigger = cancel.clone();
    let watched = hw.clone();
    std::thread::spawn(move || {
        while watched.open_channels().is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        trigger.cancel();
    });

    let start = Instant::now();
    let summary = orchestrator.run(jobs).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(summary.results[0]
        .error()
        .is_some_and(BootError::is_interrupted));

    // Cleanup force-closed the channel the worker was still using
    assert!(orchestrator.channels().open_set().is_empty());
    assert!(hw.open_channels().is_empty());
    assert!(hw.events().contains(&Event::Close(key)));

    std::fs::remove_file(path).ok();
}

#[test]
fn test_stale_channel_recovered() {
    let key = ChannelKey::new(0, 0);
    let path = write_image("stale.ldr", 100);
    let hw = Arc::new(DummyHardware::new(DummyConfig {
        stale: [key].into_iter().collect(),
        ..DummyConfig::default()
    }));

    let summary = boot(
        SINGLE_DSP,
        ConfigLayout::SingleDsp,
        &[(key, &path)],
        &hw,
        CancelToken::new(),
    )
    .unwrap();
    assert!(summary.is_success());

    let events = hw.events();
    let close = events.iter().position(|e| *e == Event::Close(key)).unwrap();
    let open = events.iter().position(|e| *e == Event::Open(key)).unwrap();
    assert!(close < open);

    std::fs::remove_file(path).ok();
}

#[test]
fn test_open_failure_reported_per_job() {
    let a = write_image("open-a.ldr", 100);
    let b = write_image("open-b.ldr", 100);
    let hw = Arc::new(DummyHardware::new(DummyConfig {
        fail_open: [ChannelKey::new(0, 0)].into_iter().collect(),
        ..DummyConfig::default()
    }));

    let summary = boot(
        MULTI_DSP,
        ConfigLayout::MultiDsp,
        &[(ChannelKey::new(0, 0), &a), (ChannelKey::new(0, 1), &b)],
        &hw,
        CancelToken::new(),
    )
    .unwrap();

    assert!(summary.results[0].is_failed());
    // The next target on the same bus still boots
    assert!(summary.results[1].is_success());
    assert!(summary.results[2].is_skipped());

    std::fs::remove_file(a).ok();
    std::fs::remove_file(b).ok();
}

#[test]
fn test_spartan_strap_sequence_precedes_transfer() {
    let key = ChannelKey::new(0, 0);
    let path = write_image("top.bit", 5000);
    let hw = Arc::new(DummyHardware::default());

    let summary = boot(
        SPARTAN,
        ConfigLayout::Spartan,
        &[(key, &path)],
        &hw,
        CancelToken::new(),
    )
    .unwrap();
    assert!(summary.is_success());

    // Bitstreams go out MSB first, unchanged
    assert_eq!(hw.received(key), std::fs::read(&path).unwrap());
    assert_eq!(hw.chunk_sizes(key), vec![2048, 2048, 904]);

    let writes: Vec<Event> = hw
        .events()
        .into_iter()
        .take_while(|e| !matches!(e, Event::Open(_)))
        .filter(|e| matches!(e, Event::Write(..)))
        .collect();
    assert_eq!(
        writes,
        vec![
            Event::Write(27, Level::Low),
            Event::Write(22, Level::Low),
            Event::Write(27, Level::High),
            Event::Write(22, Level::High),
        ]
    );

    std::fs::remove_file(path).ok();
}
