//! Tick-based time keeping.
//!
//! The stack measures time exclusively in ticks of the periodic PHY timer,
//! which fires every 50 ms (~20 Hz). The counter is 8 bits wide and wraps
//! around freely; all expiry arithmetic is modular.
//!
//! Two kinds of deadlines exist:
//!
//! * Link-layer slot expiries match the counter exactly (`expiry ==
//!   counter`). Slots are inspected on every tick, so an exact match cannot
//!   be missed, and wraparound needs no special handling.
//! * The JOIN/MOVE election windows on the PAN span many ticks and must
//!   survive counter wraparound unambiguously. [`TickWindow`] carries an
//!   explicit overflow flag for that purpose.

use core::fmt;

/// Duration of one timer tick.
pub const TICK_MILLIS: u64 = 50;

/// Converts a duration in whole seconds into timer ticks.
pub fn secs_to_ticks(secs: u16) -> u32 {
    u32::from(secs) * (1000 / TICK_MILLIS as u32)
}

/// The free-running 8-bit tick counter, incremented by the periodic timer.
#[derive(Copy, Clone, Default)]
pub struct TickCounter(u8);

impl TickCounter {
    pub fn new() -> Self {
        TickCounter(0)
    }

    /// Advances the counter by one tick, wrapping at the 8-bit boundary.
    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Returns the current counter value.
    pub fn now(&self) -> u8 {
        self.0
    }

    /// Returns the counter value `ticks` ticks in the future, modulo 256.
    pub fn deadline(&self, ticks: u8) -> u8 {
        self.0.wrapping_add(ticks)
    }
}

impl fmt::Debug for TickCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A deadline several ticks in the future, robust against 8-bit wraparound.
///
/// The window records whether its expiry tick lies past the `0xff -> 0x00`
/// boundary. When it does, the deadline only counts as elapsed once the
/// counter itself has wrapped, which removes the ambiguity of a plain
/// modular comparison over long windows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TickWindow {
    opened_at: u8,
    expires_at: u8,
    /// Expiry lies past the 8-bit wraparound boundary.
    wrapped: bool,
}

impl TickWindow {
    /// Opens a window of `window` ticks starting at tick `now`.
    pub fn after(now: u8, window: u8) -> Self {
        let expires_at = now.wrapping_add(window);
        TickWindow {
            opened_at: now,
            expires_at,
            wrapped: expires_at < now,
        }
    }

    /// Returns whether the expiry tick lies past the wraparound boundary.
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    /// Returns whether the window has elapsed at tick `now`.
    ///
    /// Must be polled at least once per counter period (it is driven from the
    /// tick handler, so it is polled every tick).
    pub fn has_elapsed(&self, now: u8) -> bool {
        if self.wrapped {
            // the counter must first wrap below the opening tick
            now >= self.expires_at && now < self.opened_at
        } else {
            now >= self.expires_at || now < self.opened_at
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_wraps() {
        let mut t = TickCounter::new();
        for _ in 0..250 {
            t.advance();
        }
        assert_eq!(t.now(), 250);
        assert_eq!(t.deadline(10), 4);
    }

    #[test]
    fn window_no_wrap() {
        let w = TickWindow::after(10, 30);
        assert!(!w.wrapped());
        assert!(!w.has_elapsed(10));
        assert!(!w.has_elapsed(39));
        assert!(w.has_elapsed(40));
        assert!(w.has_elapsed(200));
    }

    #[test]
    fn window_wraparound() {
        // opened at 250 with a 30 tick window: expires at (250 + 30) % 256 = 24
        let w = TickWindow::after(250, 30);
        assert!(w.wrapped());
        assert!(!w.has_elapsed(250));
        assert!(!w.has_elapsed(255));
        // counter wrapped, but window not yet over
        assert!(!w.has_elapsed(0));
        assert!(!w.has_elapsed(23));
        assert!(w.has_elapsed(24));
        assert!(w.has_elapsed(100));
    }

    #[test]
    fn secs_conversion() {
        assert_eq!(secs_to_ticks(1), 20);
        assert_eq!(secs_to_ticks(30), 600);
    }
}
