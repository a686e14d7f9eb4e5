//! Minimal capability stubs for unit tests

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::DriverError;
use crate::programmer::{GpioPort, Level, SpiChannelDriver};
use crate::target::{ChannelKey, ChannelParams};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Output(u32),
    Write(u32, Level),
    Cleanup,
    Open(ChannelKey),
    Transfer(ChannelKey, Vec<u8>),
    Close(ChannelKey),
}

#[derive(Default)]
pub struct MockHw {
    pub events: Mutex<Vec<Event>>,
    pub open: Mutex<BTreeSet<ChannelKey>>,
    pub fail_open: bool,
    pub fail_close: bool,
    pub fail_gpio_write: bool,
    /// Fail the transfer with this (0-based) index
    pub fail_transfer_at: Option<usize>,
}

impl MockHw {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn transfers(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Transfer(_, data) => Some(data),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl GpioPort for MockHw {
    fn set_output(&self, pin: u32) -> Result<(), DriverError> {
        self.push(Event::Output(pin));
        Ok(())
    }

    fn write(&self, pin: u32, level: Level) -> Result<(), DriverError> {
        if self.fail_gpio_write {
            return Err(DriverError::new("line request failed"));
        }
        self.push(Event::Write(pin, level));
        Ok(())
    }

    fn cleanup(&self) -> Result<(), DriverError> {
        self.push(Event::Cleanup);
        Ok(())
    }
}

impl SpiChannelDriver for MockHw {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(&self, params: &ChannelParams) -> Result<(), DriverError> {
        if self.fail_open {
            return Err(DriverError::new("daemon unreachable"));
        }
        self.open.lock().unwrap().insert(params.key);
        self.push(Event::Open(params.key));
        Ok(())
    }

    fn transfer(&self, key: ChannelKey, data: &[u8]) -> Result<usize, DriverError> {
        let index = self.transfers().len();
        if self.fail_transfer_at == Some(index) {
            return Err(DriverError::new("bus error"));
        }
        self.push(Event::Transfer(key, data.to_vec()));
        Ok(data.len())
    }

    fn close(&self, key: ChannelKey) -> Result<(), DriverError> {
        self.open.lock().unwrap().remove(&key);
        self.push(Event::Close(key));
        if self.fail_close {
            return Err(DriverError::new("close failed"));
        }
        Ok(())
    }

    fn is_open(&self, key: ChannelKey) -> bool {
        self.open.lock().unwrap().contains(&key)
    }
}
