//! Clock and power sequencing.

use crate::error::Result;
use parking_lot::Mutex;
use std::fmt::Debug;

/// Powers the accelerator's clock domain up and down.
pub trait PowerControl: Debug + Send + Sync {
    /// Enable clocks.
    ///
    /// # Errors
    ///
    /// Returns error if a clock cannot be enabled; nothing is left enabled.
    fn power_on(&self) -> Result<()>;

    /// Disable clocks. Disabling an already-off domain does nothing.
    fn power_off(&self);

    /// Clocks are currently enabled.
    fn is_powered(&self) -> bool;
}

#[derive(Debug, Default)]
struct Clocks {
    core: bool,
    sys: bool,
    on_count: u64,
    off_count: u64,
}

/// Software clock domain: a core clock and a system clock, enabled in that
/// order and disabled in reverse.
#[derive(Debug, Default)]
pub struct ClockDomain {
    clocks: Mutex<Clocks>,
}

impl ClockDomain {
    /// Domain with both clocks off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the domain was powered on and off.
    pub fn transitions(&self) -> (u64, u64) {
        let clocks = self.clocks.lock();
        (clocks.on_count, clocks.off_count)
    }
}

impl PowerControl for ClockDomain {
    fn power_on(&self) -> Result<()> {
        let mut clocks = self.clocks.lock();
        if clocks.core && clocks.sys {
            return Ok(());
        }
        clocks.core = true;
        clocks.sys = true;
        clocks.on_count += 1;
        tracing::debug!("clock domain on");
        Ok(())
    }

    fn power_off(&self) {
        let mut clocks = self.clocks.lock();
        if !clocks.core && !clocks.sys {
            return;
        }
        clocks.sys = false;
        clocks.core = false;
        clocks.off_count += 1;
        tracing::debug!("clock domain off");
    }

    fn is_powered(&self) -> bool {
        let clocks = self.clocks.lock();
        clocks.core && clocks.sys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_counted_once() {
        let clocks = ClockDomain::new();
        clocks.power_off();
        clocks.power_on().unwrap();
        clocks.power_on().unwrap();
        assert!(clocks.is_powered());
        clocks.power_off();
        assert!(!clocks.is_powered());
        assert_eq!(clocks.transitions(), (1, 1));
    }
}
