//! Completion status register.
//!
//! ```text
//! bit 31      AXI bus error
//! bit 30      MMU (address translation) exception
//! bits 29..0  non-zero: network completed
//! ```
//!
//! A completion signal carrying `0` is itself a fault: the peer raised the
//! interrupt without reporting anything.

/// Bus error flag.
pub const BUS_ERROR: u32 = 0x8000_0000;

/// Address-translation exception flag.
pub const MMU_EXCEPTION: u32 = 0x4000_0000;

/// Status value the secure peer reports for a clean completion.
pub const COMPLETED: u32 = 0x0000_0001;

/// Default completion timeout in milliseconds.
pub const IRQ_TIMEOUT_MS: u64 = 40_000;

/// Timeout multiplier applied to networks built in profiling mode.
pub const PROFILE_TIMEOUT_FACTOR: u32 = 2;

/// Decoded completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Interrupt raised with an empty status word.
    Invalid,
    /// Bus error during execution.
    BusError,
    /// Address-translation exception during execution.
    MmuException,
    /// Network ran to completion.
    Completed,
}

/// Decode a raw status word. Bus error wins over MMU exception.
pub const fn classify(status: u32) -> StatusKind {
    if status == 0 {
        StatusKind::Invalid
    } else if status & BUS_ERROR != 0 {
        StatusKind::BusError
    } else if status & MMU_EXCEPTION != 0 {
        StatusKind::MmuException
    } else {
        StatusKind::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_words() {
        assert_eq!(classify(0), StatusKind::Invalid);
        assert_eq!(classify(COMPLETED), StatusKind::Completed);
        assert_eq!(classify(0x1234), StatusKind::Completed);
        assert_eq!(classify(BUS_ERROR), StatusKind::BusError);
        assert_eq!(classify(BUS_ERROR | MMU_EXCEPTION), StatusKind::BusError);
        assert_eq!(classify(MMU_EXCEPTION | 1), StatusKind::MmuException);
    }
}
