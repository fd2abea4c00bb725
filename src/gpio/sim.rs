//! Simulated pin bank.
//!
//! Models the parts of a GPIO block the protocol can observe: direction,
//! pull, and the output latch. An output reads back its latch; an input
//! reads its pull bias, and a floating input (pull off) reads as unknown.

use super::{Direction, Gpio, Level, Pull};
use std::sync::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct PinState {
    direction: Direction,
    pull: Pull,
    latch: Level,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            pull: Pull::Off,
            latch: Level::Low,
        }
    }
}

/// In-memory backend covering the full 0..=255 pin range.
pub struct SimGpio {
    pins: Mutex<[PinState; 256]>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self {
            pins: Mutex::new([PinState::default(); 256]),
        }
    }

    fn with_pin<T>(&self, pin: u8, f: impl FnOnce(&mut PinState) -> T) -> T {
        // A poisoned lock only means another task panicked mid-update; the
        // pin array itself is always in a valid state.
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut pins[pin as usize])
    }
}

impl Default for SimGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpio for SimGpio {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn set_direction(&self, pin: u8, direction: Direction) {
        trace!(pin, ?direction, "sim set_direction");
        self.with_pin(pin, |p| p.direction = direction);
    }

    fn set_pull(&self, pin: u8, pull: Pull) {
        trace!(pin, ?pull, "sim set_pull");
        self.with_pin(pin, |p| p.pull = pull);
    }

    fn write(&self, pin: u8, level: Level) {
        trace!(pin, ?level, "sim write");
        self.with_pin(pin, |p| p.latch = level);
    }

    fn toggle(&self, pin: u8) {
        trace!(pin, "sim toggle");
        self.with_pin(pin, |p| p.latch = p.latch.inverted());
    }

    fn read(&self, pin: u8) -> Option<Level> {
        self.with_pin(pin, |p| match (p.direction, p.pull) {
            (Direction::Output, _) => Some(p.latch),
            (Direction::Input, Pull::Up) => Some(Level::High),
            (Direction::Input, Pull::Down) => Some(Level::Low),
            (Direction::Input, Pull::Off) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_reads_latch() {
        let gpio = SimGpio::new();
        gpio.set_direction(4, Direction::Output);
        assert_eq!(gpio.read(4), Some(Level::Low));

        gpio.write(4, Level::High);
        assert_eq!(gpio.read(4), Some(Level::High));
    }

    #[test]
    fn test_floating_input_is_unknown() {
        let gpio = SimGpio::new();
        assert_eq!(gpio.read(17), None);

        gpio.set_pull(17, Pull::Up);
        assert_eq!(gpio.read(17), Some(Level::High));

        gpio.set_pull(17, Pull::Down);
        assert_eq!(gpio.read(17), Some(Level::Low));

        gpio.set_pull(17, Pull::Off);
        assert_eq!(gpio.read(17), None);
    }

    #[test]
    fn test_toggle_twice_is_noop() {
        let gpio = SimGpio::new();
        gpio.set_direction(2, Direction::Output);
        gpio.write(2, Level::High);

        gpio.toggle(2);
        assert_eq!(gpio.read(2), Some(Level::Low));
        gpio.toggle(2);
        assert_eq!(gpio.read(2), Some(Level::High));
    }

    #[test]
    fn test_pins_are_independent() {
        let gpio = SimGpio::new();
        gpio.set_direction(0, Direction::Output);
        gpio.set_direction(255, Direction::Output);
        gpio.write(255, Level::High);

        assert_eq!(gpio.read(0), Some(Level::Low));
        assert_eq!(gpio.read(255), Some(Level::High));
    }
}
