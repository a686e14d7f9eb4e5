//! Linux spidev channels
//!
//! [`LinuxSpi`] wraps one `/dev/spidevB.C` file; [`LinuxSpiDriver`] keeps
//! the open ones by chip-select and implements [`SpiChannelDriver`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use spiboot_core::programmer::SpiChannelDriver;
use spiboot_core::target::{ChannelKey, ChannelParams, SpiMode};
use spiboot_core::DriverError;

use crate::error::{LinuxSpiError, Result};

/// spidev module parameter limiting the size of one message
const BUF_SIZE_SYSFS: &str = "/sys/module/spidev/parameters/bufsiz";

/// spidev ioctl requests
mod ioctl {
    use nix::ioctl_write_ptr;

    // SPI ioctl magic number
    const SPI_IOC_MAGIC: u8 = b'k';

    // SPI ioctl type numbers
    const SPI_IOC_TYPE_MODE: u8 = 1;
    const SPI_IOC_TYPE_BITS_PER_WORD: u8 = 3;
    const SPI_IOC_TYPE_MAX_SPEED_HZ: u8 = 4;

    ioctl_write_ptr!(spi_ioc_wr_mode, SPI_IOC_MAGIC, SPI_IOC_TYPE_MODE, u8);
    ioctl_write_ptr!(
        spi_ioc_wr_bits_per_word,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_BITS_PER_WORD,
        u8
    );
    ioctl_write_ptr!(
        spi_ioc_wr_max_speed_hz,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_MAX_SPEED_HZ,
        u32
    );

    // SPI_IOC_MESSAGE(n) = _IOW(SPI_IOC_MAGIC, 0, char[n * sizeof(struct spi_ioc_transfer)])

    /// Size of struct spi_ioc_transfer (same on 32- and 64-bit)
    pub const SPI_IOC_TRANSFER_SIZE: usize = 32;

    /// Request number of `SPI_IOC_MESSAGE(n)`
    pub fn spi_ioc_message(n: u8) -> libc::c_ulong {
        let size = (n as usize) * SPI_IOC_TRANSFER_SIZE;
        // _IOC(dir, type, nr, size) = ((dir)<<30)|((size)<<16)|((type)<<8)|(nr), _IOC_WRITE = 1
        ((1u32 << 30) | ((size as u32) << 16) | ((SPI_IOC_MAGIC as u32) << 8)) as libc::c_ulong
    }
}

/// `struct spi_ioc_transfer` from `<linux/spi/spidev.h>`
#[repr(C)]
#[derive(Debug, Default, Clone)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    _pad: u8,
}

/// Device node for a channel, e.g. `/dev/spidev0.1`
pub fn device_path(dev_dir: &Path, key: ChannelKey) -> PathBuf {
    dev_dir.join(format!("spidev{}.{}", key.bus, key.chip_select))
}

/// One open spidev channel
pub struct LinuxSpi {
    /// Open device node
    file: File,
    /// Largest message the kernel accepts
    bufsiz: usize,
    /// Current speed in Hz
    speed_hz: u32,
}

impl LinuxSpi {
    /// Open a spidev node and program its mode, word size and clock
    pub fn open(path: &Path, speed_hz: u32, mode: SpiMode) -> Result<Self> {
        log::debug!("linux_spi: opening device {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LinuxSpiError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let fd = file.as_raw_fd();

        // The SpiMode bits are the spidev mode byte
        let mode = mode.bits();
        unsafe {
            ioctl::spi_ioc_wr_mode(fd, &mode).map_err(|e| LinuxSpiError::SetModeFailed {
                mode,
                source: std::io::Error::from_raw_os_error(e as i32),
            })?;
        }

        let bits: u8 = 8;
        unsafe {
            ioctl::spi_ioc_wr_bits_per_word(fd, &bits).map_err(|e| {
                LinuxSpiError::SetBitsPerWordFailed {
                    bits,
                    source: std::io::Error::from_raw_os_error(e as i32),
                }
            })?;
        }

        unsafe {
            ioctl::spi_ioc_wr_max_speed_hz(fd, &speed_hz).map_err(|e| {
                LinuxSpiError::SetSpeedFailed {
                    speed: speed_hz,
                    source: std::io::Error::from_raw_os_error(e as i32),
                }
            })?;
        }

        let bufsiz = kernel_bufsiz();
        log::info!(
            "linux_spi: opened {} (mode={}, speed={} kHz, bufsiz={})",
            path.display(),
            mode,
            speed_hz / 1000,
            bufsiz
        );

        Ok(Self {
            file,
            bufsiz,
            speed_hz,
        })
    }

    /// Write `data`, split into messages the kernel accepts
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        for piece in data.chunks(self.bufsiz.max(1)) {
            self.write_message(piece)?;
        }
        Ok(data.len())
    }

    /// Perform a write-only SPI_IOC_MESSAGE(1)
    fn write_message(&mut self, data: &[u8]) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let transfer = SpiIocTransfer {
            tx_buf: data.as_ptr() as u64,
            len: data.len() as u32,
            speed_hz: self.speed_hz,
            bits_per_word: 8,
            ..Default::default()
        };

        let ret = unsafe {
            libc::ioctl(
                fd,
                ioctl::spi_ioc_message(1),
                &transfer as *const SpiIocTransfer,
            )
        };
        if ret < 0 {
            return Err(LinuxSpiError::TransferFailed(
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

/// spidev `bufsiz`, falling back to the page size when sysfs has no answer
fn kernel_bufsiz() -> usize {
    if let Ok(content) = std::fs::read_to_string(BUF_SIZE_SYSFS) {
        if let Ok(size) = content.trim().parse::<usize>() {
            if size > 0 {
                log::debug!("linux_spi: using buffer size {} from sysfs", size);
                return size;
            }
        }
        log::warn!("linux_spi: invalid buffer size in {}", BUF_SIZE_SYSFS);
    } else {
        log::debug!("linux_spi: cannot read {}, using page size", BUF_SIZE_SYSFS);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as usize
    } else {
        4096
    }
}

/// spidev [`SpiChannelDriver`]
pub struct LinuxSpiDriver {
    dev_dir: PathBuf,
    channels: Mutex<BTreeMap<ChannelKey, Arc<Mutex<LinuxSpi>>>>,
}

impl Default for LinuxSpiDriver {
    fn default() -> Self {
        Self::new("/dev")
    }
}

impl LinuxSpiDriver {
    /// Create a driver looking for spidev nodes in `dev_dir`
    pub fn new(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, BTreeMap<ChannelKey, Arc<Mutex<LinuxSpi>>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpiChannelDriver for LinuxSpiDriver {
    fn name(&self) -> &'static str {
        "linux_spi"
    }

    fn open(&self, params: &ChannelParams) -> std::result::Result<(), DriverError> {
        let key = params.key;
        let mut channels = self.channels();
        if channels.contains_key(&key) {
            return Err(LinuxSpiError::AlreadyOpen(key).into());
        }
        if params.pins.is_some() {
            log::debug!("linux_spi: {} pin mapping ignored, the kernel owns the pins", key);
        }
        let spi = LinuxSpi::open(
            &device_path(&self.dev_dir, key),
            params.clock_hz,
            params.mode,
        )?;
        channels.insert(key, Arc::new(Mutex::new(spi)));
        Ok(())
    }

    fn transfer(&self, key: ChannelKey, data: &[u8]) -> std::result::Result<usize, DriverError> {
        let channel = self
            .channels()
            .get(&key)
            .cloned()
            .ok_or(LinuxSpiError::NotOpen(key))?;
        let mut spi = channel.lock().unwrap_or_else(|e| e.into_inner());
        Ok(spi.write(data)?)
    }

    fn close(&self, key: ChannelKey) -> std::result::Result<(), DriverError> {
        if self.channels().remove(&key).is_some() {
            log::debug!("linux_spi: closed {}", key);
        }
        Ok(())
    }

    fn is_open(&self, key: ChannelKey) -> bool {
        self.channels().contains_key(&key)
    }
}
