//! SPI channel lifecycle
//!
//! [`ChannelManager`] owns the process-wide "open set": every chip-select
//! this process currently has open. Workers open and close channels through
//! it, and the orchestrator's cleanup path force-closes whatever is left.
//! Both paths take the same lock, so a worker's own close and a forced
//! close can race safely; whichever comes second is a no-op.
//!
//! A [`ChannelHandle`] closes its channel when dropped, so every successful
//! open is matched by exactly one close on every exit path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ChannelError;
use crate::programmer::SpiChannelDriver;
use crate::target::{ChannelKey, ChannelParams, TargetConfig};

/// Open channels, each tagged with the generation of the open that created it
#[derive(Debug, Default)]
struct OpenSet {
    channels: BTreeMap<ChannelKey, u64>,
    next_generation: u64,
}

/// Owner of the open-channel set
pub struct ChannelManager {
    driver: Arc<dyn SpiChannelDriver>,
    open: Mutex<OpenSet>,
}

impl ChannelManager {
    /// Create a manager on top of a channel driver
    pub fn new(driver: Arc<dyn SpiChannelDriver>) -> Self {
        Self {
            driver,
            open: Mutex::new(OpenSet::default()),
        }
    }

    /// The underlying driver
    pub fn driver(&self) -> &dyn SpiChannelDriver {
        self.driver.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, OpenSet> {
        // A worker that panicked while holding the lock leaves the set
        // consistent (every mutation is a single insert/remove).
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the channel for `target`
    pub fn open(&self, target: &TargetConfig) -> Result<ChannelHandle<'_>, ChannelError> {
        self.recover_and_open(&target.channel_params())
    }

    /// Open a channel, first closing a stale one the driver still holds
    ///
    /// A channel counts as stale when the driver reports it open but no live
    /// handle in this process owns it, e.g. after an earlier run was killed.
    /// The stale close is best effort: its failure is logged and the fresh
    /// open is attempted regardless. Closing is idempotent on every driver,
    /// so this is safe even when the driver state is out of date.
    ///
    /// Fails with [`ChannelError::AlreadyOpen`] if a live handle holds the
    /// chip-select, or [`ChannelError::OpenFailed`] if the driver refuses.
    pub fn recover_and_open(
        &self,
        params: &ChannelParams,
    ) -> Result<ChannelHandle<'_>, ChannelError> {
        let key = params.key;
        let mut set = self.lock();

        if set.channels.contains_key(&key) {
            return Err(ChannelError::AlreadyOpen(key));
        }

        if self.driver.is_open(key) {
            log::warn!("channel: {} left open by a previous run, closing it", key);
            if let Err(e) = self.driver.close(key) {
                log::debug!("channel: closing stale {} failed: {}", key, e);
            }
        }

        self.driver
            .open(params)
            .map_err(|source| ChannelError::OpenFailed { key, source })?;

        let generation = set.next_generation;
        set.next_generation += 1;
        set.channels.insert(key, generation);

        log::debug!(
            "channel: opened {} via {} ({} Hz, {})",
            key,
            self.driver.name(),
            params.clock_hz,
            params.mode
        );

        Ok(ChannelHandle {
            manager: self,
            params: *params,
            generation,
            open: true,
        })
    }

    /// Close a handle's channel; a no-op if it is already closed
    pub fn close(&self, handle: &mut ChannelHandle<'_>) {
        handle.close();
    }

    /// Close `key` if this process has it open, returning whether it did
    ///
    /// Driver failures are logged, never returned: close is best effort.
    pub fn close_key(&self, key: ChannelKey) -> bool {
        let mut set = self.lock();
        self.close_locked(&mut set, key, None)
    }

    fn close_locked(&self, set: &mut OpenSet, key: ChannelKey, generation: Option<u64>) -> bool {
        match set.channels.get(&key) {
            Some(&g) if generation.map_or(true, |want| want == g) => {}
            _ => return false,
        }
        set.channels.remove(&key);
        if let Err(e) = self.driver.close(key) {
            log::warn!("channel: failed to close {}: {}", key, e);
        } else {
            log::debug!("channel: closed {}", key);
        }
        true
    }

    /// Force-close every channel in the open set
    ///
    /// Returns the number of channels that were closed.
    pub fn close_all(&self) -> usize {
        let mut set = self.lock();
        let keys: Vec<ChannelKey> = set.channels.keys().copied().collect();
        for &key in &keys {
            log::info!("channel: force-closing {}", key);
            self.close_locked(&mut set, key, None);
        }
        keys.len()
    }

    /// Chip-selects currently open, in (bus, cs) order
    pub fn open_set(&self) -> Vec<ChannelKey> {
        self.lock().channels.keys().copied().collect()
    }

    /// Whether `key` is in the open set
    pub fn is_open(&self, key: ChannelKey) -> bool {
        self.lock().channels.contains_key(&key)
    }

    fn is_current(&self, key: ChannelKey, generation: u64) -> bool {
        self.lock().channels.get(&key) == Some(&generation)
    }
}

/// Exclusive use of one open channel
///
/// Dropping the handle closes the channel.
pub struct ChannelHandle<'m> {
    manager: &'m ChannelManager,
    params: ChannelParams,
    generation: u64,
    open: bool,
}

impl ChannelHandle<'_> {
    /// Channel identity
    pub fn key(&self) -> ChannelKey {
        self.params.key
    }

    /// Parameters the channel was opened with
    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    /// Whether the channel is still open (not closed by us or by cleanup)
    pub fn is_open(&self) -> bool {
        self.open && self.manager.is_current(self.params.key, self.generation)
    }

    /// Send one chunk; `offset` is only used for error reporting
    ///
    /// The open-set lock is not held while the driver transfers, so a
    /// forced close from cleanup does not wait for the chunk to finish.
    pub fn transfer(&self, offset: usize, data: &[u8]) -> Result<(), ChannelError> {
        let key = self.params.key;
        if !self.is_open() {
            return Err(ChannelError::Closed(key));
        }

        let sent = self
            .manager
            .driver
            .transfer(key, data)
            .map_err(|source| ChannelError::TransferFailed {
                key,
                offset,
                source,
            })?;

        if sent != data.len() {
            return Err(ChannelError::ShortTransfer {
                key,
                offset,
                sent,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Close the channel; idempotent and never fails
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut set = self.manager.lock();
        self.manager
            .close_locked(&mut set, self.params.key, Some(self.generation));
    }
}

impl Drop for ChannelHandle<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChannelHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("key", &self.params.key)
            .field("generation", &self.generation)
            .field("open", &self.open)
            .finish()
    }
}
