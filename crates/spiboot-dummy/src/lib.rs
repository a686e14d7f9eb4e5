//! spiboot-dummy - In-memory boot target emulator
//!
//! This crate provides a dummy backend that implements both hardware
//! capabilities ([`GpioPort`] and [`SpiChannelDriver`]) in memory and
//! records every call. It's useful for dry runs (`--backend dummy`) and for
//! testing the boot engine without real hardware.
//!
//! Faults can be injected per chip-select through [`DummyConfig`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use spiboot_core::programmer::{GpioPort, Level, SpiChannelDriver};
use spiboot_core::target::{ChannelKey, ChannelParams};
use spiboot_core::{CancelToken, DriverError};

#[cfg(test)]
mod e2e;

/// One recorded capability call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `GpioPort::set_output`
    SetOutput(u32),
    /// `GpioPort::write`
    Write(u32, Level),
    /// `GpioPort::cleanup`
    Cleanup,
    /// Successful `SpiChannelDriver::open`
    Open(ChannelKey),
    /// Successful `SpiChannelDriver::transfer`, with the chunk length
    Transfer(ChannelKey, usize),
    /// `SpiChannelDriver::close` of an open channel
    Close(ChannelKey),
}

/// Behaviour of the dummy backend
#[derive(Debug, Clone, Default)]
pub struct DummyConfig {
    /// Time each chunk transfer takes
    pub chunk_delay: Duration,
    /// Channels whose open fails
    pub fail_open: BTreeSet<ChannelKey>,
    /// Fail the transfer of chunk N (0-based) on a channel
    pub fail_transfer: BTreeMap<ChannelKey, usize>,
    /// Cancel a token once chunk N (0-based) on a channel has been received
    pub cancel_after: Option<(ChannelKey, usize, CancelToken)>,
    /// Channels reported open before anything opened them, as if leaked by
    /// an earlier run
    pub stale: BTreeSet<ChannelKey>,
}

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    outputs: BTreeSet<u32>,
    levels: BTreeMap<u32, Level>,
    open: BTreeSet<ChannelKey>,
    received: BTreeMap<ChannelKey, Vec<u8>>,
    chunks: BTreeMap<ChannelKey, Vec<usize>>,
}

/// Dummy GPIO port and SPI channel driver
///
/// Share one instance (in an `Arc`) as both capabilities.
#[derive(Debug)]
pub struct DummyHardware {
    config: DummyConfig,
    state: Mutex<State>,
}

impl Default for DummyHardware {
    fn default() -> Self {
        Self::new(DummyConfig::default())
    }
}

impl DummyHardware {
    /// Create a dummy backend with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        let state = State {
            open: config.stale.clone(),
            ..State::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call so far, in order
    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    /// Bytes received on a channel, across all opens
    pub fn received(&self, key: ChannelKey) -> Vec<u8> {
        self.state().received.get(&key).cloned().unwrap_or_default()
    }

    /// Chunk lengths received on a channel, in order
    pub fn chunk_sizes(&self, key: ChannelKey) -> Vec<usize> {
        self.state().chunks.get(&key).cloned().unwrap_or_default()
    }

    /// Channels currently open
    pub fn open_channels(&self) -> Vec<ChannelKey> {
        self.state().open.iter().copied().collect()
    }

    /// Last level driven on a pin
    pub fn level(&self, pin: u32) -> Option<Level> {
        self.state().levels.get(&pin).copied()
    }

    /// Log what each channel received
    pub fn log_summary(&self) {
        let state = self.state();
        for (key, data) in &state.received {
            let chunks = state.chunks.get(key).map_or(0, Vec::len);
            log::info!(
                "dummy: {} received {} bytes in {} chunk(s)",
                key,
                data.len(),
                chunks
            );
        }
    }
}

impl GpioPort for DummyHardware {
    fn set_output(&self, pin: u32) -> Result<(), DriverError> {
        let mut state = self.state();
        state.outputs.insert(pin);
        state.events.push(Event::SetOutput(pin));
        Ok(())
    }

    fn write(&self, pin: u32, level: Level) -> Result<(), DriverError> {
        let mut state = self.state();
        if !state.outputs.contains(&pin) {
            return Err(DriverError::new(format!(
                "GPIO{} is not configured as output",
                pin
            )));
        }
        state.levels.insert(pin, level);
        state.events.push(Event::Write(pin, level));
        log::trace!("dummy: GPIO{} = {:?}", pin, level);
        Ok(())
    }

    fn cleanup(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        state.outputs.clear();
        state.events.push(Event::Cleanup);
        Ok(())
    }
}

impl SpiChannelDriver for DummyHardware {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn open(&self, params: &ChannelParams) -> Result<(), DriverError> {
        let key = params.key;
        if self.config.fail_open.contains(&key) {
            return Err(DriverError::new(format!("{}: injected open failure", key)));
        }
        let mut state = self.state();
        if !state.open.insert(key) {
            return Err(DriverError::new(format!("{} is already open", key)));
        }
        state.events.push(Event::Open(key));
        log::debug!(
            "dummy: opened {} ({} Hz, {})",
            key,
            params.clock_hz,
            params.mode
        );
        Ok(())
    }

    fn transfer(&self, key: ChannelKey, data: &[u8]) -> Result<usize, DriverError> {
        let index = {
            let state = self.state();
            if !state.open.contains(&key) {
                return Err(DriverError::new(format!("{} is not open", key)));
            }
            state.chunks.get(&key).map_or(0, Vec::len)
        };
        if self.config.fail_transfer.get(&key) == Some(&index) {
            return Err(DriverError::new(format!(
                "{}: injected failure on chunk {}",
                key, index
            )));
        }

        // The lock is not held while the "hardware" is busy
        if !self.config.chunk_delay.is_zero() {
            std::thread::sleep(self.config.chunk_delay);
        }

        {
            let mut state = self.state();
            if !state.open.contains(&key) {
                return Err(DriverError::new(format!("{} closed during transfer", key)));
            }
            state.received.entry(key).or_default().extend_from_slice(data);
            state.chunks.entry(key).or_default().push(data.len());
            state.events.push(Event::Transfer(key, data.len()));
        }

        if let Some((cancel_key, after, token)) = &self.config.cancel_after {
            if *cancel_key == key && *after == index {
                log::debug!("dummy: cancelling after chunk {} on {}", index, key);
                token.cancel();
            }
        }
        Ok(data.len())
    }

    fn close(&self, key: ChannelKey) -> Result<(), DriverError> {
        let mut state = self.state();
        if state.open.remove(&key) {
            state.events.push(Event::Close(key));
        }
        Ok(())
    }

    fn is_open(&self, key: ChannelKey) -> bool {
        self.state().open.contains(&key)
    }
}
