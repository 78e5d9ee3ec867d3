//! Error types for control-plane operations

use crate::channel::FailureHint;
use crate::engine::FaultKind;
use thiserror::Error;
use tnpu_chip::ta::{result, TaCommand};
use tnpu_models::ModelError;

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Errors that can occur while serving a session
#[derive(Debug, Error)]
pub enum NpuError {
    /// A memory pool could not satisfy an allocation
    #[error("Out of memory: {requested} bytes from {pool}")]
    OutOfMemory {
        /// Requested size
        requested: u64,
        /// Pool that was exhausted
        pool: &'static str,
    },

    /// Caller-supplied handle does not name a live entity
    #[error("{kind} {handle} not found")]
    NotFound {
        /// Entity kind
        kind: &'static str,
        /// Handle that was looked up
        handle: u32,
    },

    /// Request failed validation before any resource was touched
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for rejection
        reason: String,
    },

    /// Offset is not a multiple of the device page
    #[error("Offset {offset:#x} is not aligned to the device page")]
    Misaligned {
        /// Offending offset
        offset: u64,
    },

    /// Every handle in the table's range is in use
    #[error("No free {kind} handle")]
    HandleExhausted {
        /// Entity kind
        kind: &'static str,
    },

    /// Buffer still has attachments
    #[error("IO buffer {bid} is attached {ref_count} time(s)")]
    BufferInUse {
        /// Buffer handle
        bid: u32,
        /// Live attachments
        ref_count: u32,
    },

    /// The hardware reservation does not allow the request
    #[error("Permission denied: {reason}")]
    PermissionDenied {
        /// Reason for refusal
        reason: String,
    },

    /// The secure peer rejected a command
    #[error("Secure peer failed {command}: {} ({code:#010x})", code_name(.code))]
    Peer {
        /// Command that failed
        command: TaCommand,
        /// Result code returned by the peer
        code: u32,
        /// Diagnostic sub-kind
        hint: FailureHint,
    },

    /// The secure peer refused to open a session
    #[error("Secure peer refused the session: {} ({code:#010x})", code_name(.code))]
    SessionRefused {
        /// Result code returned by the peer
        code: u32,
    },

    /// The transport to the secure peer failed
    #[error("Secure channel transport error: {reason}")]
    Transport {
        /// Reason for failure
        reason: String,
    },

    /// Completion signal did not arrive in time
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Execution ended with a fault status
    #[error("Hardware fault: {fault} (status {status:#010x})")]
    HardwareFault {
        /// Decoded fault
        fault: FaultKind,
        /// Raw status word
        status: u32,
    },

    /// The wait was cancelled by the caller
    #[error("Interrupted; retry or abandon")]
    Interrupted,

    /// Object is in an invalid state for the request
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Model image rejected
    #[error("Model rejected: {0}")]
    Model(#[from] ModelError),
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn code_name(code: &u32) -> &'static str {
    result::name(*code)
}

/// The three conditions reported on the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request
    InvalidArgument,
    /// Not found, denied, or any other failure
    Failed,
    /// Cancelled; the caller decides whether to retry
    Cancelled,
}

impl ErrorClass {
    /// Negative errno reported to the caller.
    pub fn errno(self) -> i32 {
        let errno = match self {
            Self::InvalidArgument => rustix::io::Errno::INVAL,
            Self::Failed => rustix::io::Errno::FAULT,
            Self::Cancelled => rustix::io::Errno::INTR,
        };
        -errno.raw_os_error()
    }
}

impl NpuError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(kind: &'static str, handle: u32) -> Self {
        Self::NotFound { kind, handle }
    }

    /// Control-surface class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidArgument { .. } | Self::Misaligned { .. } | Self::Model(_) => {
                ErrorClass::InvalidArgument
            }
            Self::Interrupted => ErrorClass::Cancelled,
            _ => ErrorClass::Failed,
        }
    }
}
