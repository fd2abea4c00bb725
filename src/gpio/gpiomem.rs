//! Memory-mapped BCM283x GPIO backend.
//!
//! Maps the 4 KiB GPIO register page exposed by `/dev/gpiomem` and drives
//! pins by direct register access:
//!
//! ```text
//! word  0..=5   GPFSELn     function select, 3 bits per pin
//! word  7..=8   GPSETn      write 1 to drive high
//! word 10..=11  GPCLRn      write 1 to drive low
//! word 13..=14  GPLEVn      sensed level
//! word 37       GPPUD       pull mode (BCM2835/6/7)
//! word 38..=39  GPPUDCLKn   pull clock (BCM2835/6/7)
//! word 57..=60  GPPUPPDNn   pull control, 2 bits per pin (BCM2711)
//! ```
//!
//! The block has 54 pins. Register indices for higher pin numbers would
//! alias other pins' bits (pin 70 lands on GPSET0 bit 0), so every operation
//! on a pin above [`MAX_PIN`] is a no-op and reads as unknown.

use super::{Direction, Gpio, GpioError, Level, Pull};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Highest pin the GPIO block implements
const MAX_PIN: u8 = 53;

/// Size of the mapped register page
const BLOCK_SIZE: usize = 4096;
const BLOCK_WORDS: usize = BLOCK_SIZE / 4;

const GPFSEL0: usize = 0;
const GPSET0: usize = 7;
const GPCLR0: usize = 10;
const GPLEV0: usize = 13;
const GPPUD: usize = 37;
const GPPUDCLK0: usize = 38;
const GPPUPPDN0: usize = 57;
const GPPUPPDN3: usize = 60;

/// GPPUPPDN3 does not exist before the BCM2711 and reads back as "gpio".
const LEGACY_PULL_MAGIC: u32 = 0x6770_696f;

/// Settle time for the legacy pull clock sequence (>= 150 core cycles)
const PULL_SETTLE: Duration = Duration::from_micros(1);

/// Word-addressed access to a GPIO register block.
trait Registers: Send {
    fn load(&self, word: usize) -> u32;
    fn store(&mut self, word: usize, value: u32);
}

/// A live mapping of the register page.
struct Mapping {
    base: NonNull<u32>,
    // Kept open for the lifetime of the mapping.
    _file: File,
}

// The mapping is only ever touched through `&mut` while holding the bank lock.
unsafe impl Send for Mapping {}

impl Mapping {
    fn open(path: &Path) -> Result<Self, GpioError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| GpioError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        // SAFETY: mapping a fresh shared region backed by a valid fd; the
        // result is checked against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                BLOCK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(GpioError::Map {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        let base = NonNull::new(addr.cast::<u32>()).ok_or_else(|| GpioError::Map {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "mmap returned null"),
        })?;

        Ok(Self { base, _file: file })
    }
}

impl Registers for Mapping {
    fn load(&self, word: usize) -> u32 {
        debug_assert!(word < BLOCK_WORDS);
        // SAFETY: callers only pass indices derived from pins <= MAX_PIN,
        // all below word 61 of the mapped page.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(word)) }
    }

    fn store(&mut self, word: usize, value: u32) {
        debug_assert!(word < BLOCK_WORDS);
        // SAFETY: as above.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(word), value) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/BLOCK_SIZE are exactly what mmap returned.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), BLOCK_SIZE);
        }
        debug!("GPIO registers unmapped");
    }
}

/// Pin operations expressed as register arithmetic.
struct Bank<R> {
    regs: R,
    /// BCM2711 (Pi 4) pull control layout
    bcm2711: bool,
}

impl<R: Registers> Bank<R> {
    fn new(regs: R) -> Self {
        let bcm2711 = regs.load(GPPUPPDN3) != LEGACY_PULL_MAGIC;
        Self { regs, bcm2711 }
    }

    fn bank_bit(pin: u8) -> (usize, u32) {
        ((pin / 32) as usize, 1 << (pin % 32))
    }

    fn set_direction(&mut self, pin: u8, direction: Direction) {
        if pin > MAX_PIN {
            return;
        }

        let word = GPFSEL0 + (pin / 10) as usize;
        let shift = (pin % 10) as u32 * 3;
        let mode = match direction {
            Direction::Input => 0b000,
            Direction::Output => 0b001,
        };

        let value = (self.regs.load(word) & !(0b111 << shift)) | (mode << shift);
        self.regs.store(word, value);
    }

    fn set_pull(&mut self, pin: u8, pull: Pull) {
        if pin > MAX_PIN {
            return;
        }

        if self.bcm2711 {
            let word = GPPUPPDN0 + (pin / 16) as usize;
            let shift = (pin % 16) as u32 * 2;
            let bits = match pull {
                Pull::Off => 0b00,
                Pull::Up => 0b01,
                Pull::Down => 0b10,
            };

            let value = (self.regs.load(word) & !(0b11 << shift)) | (bits << shift);
            self.regs.store(word, value);
            return;
        }

        let bits = match pull {
            Pull::Off => 0b00,
            Pull::Down => 0b01,
            Pull::Up => 0b10,
        };
        let (bank, bit) = Self::bank_bit(pin);
        let clock = GPPUDCLK0 + bank;

        let pud = self.regs.load(GPPUD) & !0b11;
        self.regs.store(GPPUD, pud | bits);
        std::thread::sleep(PULL_SETTLE);
        self.regs.store(clock, bit);
        std::thread::sleep(PULL_SETTLE);
        self.regs.store(GPPUD, pud);
        self.regs.store(clock, 0);
    }

    fn write(&mut self, pin: u8, level: Level) {
        if pin > MAX_PIN {
            return;
        }

        let (bank, bit) = Self::bank_bit(pin);
        let word = match level {
            Level::High => GPSET0 + bank,
            Level::Low => GPCLR0 + bank,
        };
        self.regs.store(word, bit);
    }

    fn toggle(&mut self, pin: u8) {
        if let Some(level) = self.read(pin) {
            self.write(pin, level.inverted());
        }
    }

    fn read(&self, pin: u8) -> Option<Level> {
        if pin > MAX_PIN {
            return None;
        }

        let (bank, bit) = Self::bank_bit(pin);
        if self.regs.load(GPLEV0 + bank) & bit != 0 {
            Some(Level::High)
        } else {
            Some(Level::Low)
        }
    }
}

/// `/dev/gpiomem` backed pin control.
///
/// All register sequences run under one lock, so a `toggle` from one
/// connection never interleaves with another connection's write.
pub struct GpioMem {
    bank: Mutex<Bank<Mapping>>,
    path: PathBuf,
}

impl GpioMem {
    /// Map the GPIO register page from `path` (normally `/dev/gpiomem`).
    pub fn open(path: &Path) -> Result<Self, GpioError> {
        let bank = Bank::new(Mapping::open(path)?);
        info!(
            device = %path.display(),
            bcm2711 = bank.bcm2711,
            "Opened GPIO registers"
        );

        Ok(Self {
            bank: Mutex::new(bank),
            path: path.to_path_buf(),
        })
    }

    fn with_bank<T>(&self, f: impl FnOnce(&mut Bank<Mapping>) -> T) -> T {
        let mut bank = self.bank.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut bank)
    }
}

impl Drop for GpioMem {
    fn drop(&mut self) {
        info!(device = %self.path.display(), "Closing GPIO registers");
    }
}

impl Gpio for GpioMem {
    fn name(&self) -> &'static str {
        "gpiomem"
    }

    fn set_direction(&self, pin: u8, direction: Direction) {
        self.with_bank(|b| b.set_direction(pin, direction));
    }

    fn set_pull(&self, pin: u8, pull: Pull) {
        self.with_bank(|b| b.set_pull(pin, pull));
    }

    fn write(&self, pin: u8, level: Level) {
        self.with_bank(|b| b.write(pin, level));
    }

    fn toggle(&self, pin: u8) {
        self.with_bank(|b| b.toggle(pin));
    }

    fn read(&self, pin: u8) -> Option<Level> {
        self.with_bank(|b| b.read(pin))
    }
}
