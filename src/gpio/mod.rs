//! Pin-control capability.
//!
//! The server only ever talks to pins through the [`Gpio`] trait, addressing
//! them by number and symbolic operation. Backends:
//! - `gpiomem`: memory-mapped BCM283x GPIO registers (Linux only)
//! - `sim`: in-memory pin bank for tests and hardware-less hosts
//!
//! ## Thread safety
//!
//! A single backend instance is shared by every connection task as
//! `Arc<dyn Gpio>`. Implementations must serialize their own multi-step
//! register sequences (toggle, pull configuration) so that concurrent
//! connections cannot interleave inside one operation. Ordering *between*
//! operations from different connections is unspecified.
//!
//! ## Lifecycle
//!
//! A backend is acquired once by [`open`] before the listener starts and
//! released when the last `Arc` is dropped.

#[cfg(target_os = "linux")]
mod gpiomem;
mod sim;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[cfg(target_os = "linux")]
pub use gpiomem::GpioMem;
pub use sim::SimGpio;

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Internal pull resistor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Off,
    Down,
    Up,
}

/// Logical pin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn inverted(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Operations offered by a pin-control backend.
///
/// All calls are synchronous and best-effort: pin numbers are not validated
/// against the hardware and no failure is reported for pins that do not
/// exist.
pub trait Gpio: Send + Sync {
    /// Short backend name for logging.
    fn name(&self) -> &'static str;

    fn set_direction(&self, pin: u8, direction: Direction);

    fn set_pull(&self, pin: u8, pull: Pull);

    fn write(&self, pin: u8, level: Level);

    /// Invert the current output level.
    fn toggle(&self, pin: u8);

    /// Sense the pin level. `None` means the state could not be determined
    /// (e.g. a floating input on the simulator).
    fn read(&self, pin: u8) -> Option<Level>;
}

/// Selectable backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Memory-mapped BCM283x registers via /dev/gpiomem
    Gpiomem,
    /// In-memory simulated pins
    Sim,
}

/// Errors raised while acquiring a backend.
#[derive(Debug, Error)]
pub enum GpioError {
    #[error("failed to open GPIO device '{}': {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map GPIO registers from '{}': {source}", .path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg_attr(target_os = "linux", allow(dead_code))]
    #[error("backend {0:?} is not supported on this platform")]
    Unsupported(Backend),
}

/// Acquire the configured backend.
pub fn open(backend: Backend, device: &Path) -> Result<Arc<dyn Gpio>, GpioError> {
    match backend {
        Backend::Sim => Ok(Arc::new(SimGpio::new())),

        #[cfg(target_os = "linux")]
        Backend::Gpiomem => Ok(Arc::new(GpioMem::open(device)?)),

        #[cfg(not(target_os = "linux"))]
        Backend::Gpiomem => {
            let _ = device;
            Err(GpioError::Unsupported(backend))
        }
    }
}
