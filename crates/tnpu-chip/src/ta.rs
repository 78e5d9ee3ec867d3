//! Trusted Application protocol constants.
//!
//! Every command is a synchronous invoke carrying up to four parameters.
//! Parameter usage per command:
//!
//! ```text
//! ACTIVATE_NPU                   value{secure}
//! DEACTIVATE_NPU                 -
//! CREATE_NETWORK                 memref header, memref payload, memref resources, value_out{nid}
//! DESTROY_NETWORK                value{nid}
//! START_NETWORK                  value{nid}
//! READ_INTERRUPT_REGISTER        value_out{status}
//! DUMP_STATE                     -
//! CREATE_IO_BUFFER_FROM_SG       memref areas, value{secure, count}, value_out{bid, mem_id}
//! CREATE_IO_BUFFER_FROM_MEM_ID   value{mem_id}, value{offset, size}, value_out{bid}
//! DESTROY_IO_BUFFER              value{bid}
//! ATTACH_IO_BUFFER               value{bid, nid}, value_out{aid}
//! DETACH_IO_BUFFER               value{nid, aid}
//! SET_INPUT / SET_OUTPUT         value{nid, aid}, value{index}
//! ```

/// Trusted Application UUID, in RFC 4122 byte order.
pub const TA_UUID: [u8; 16] = [
    0x13, 0x16, 0xa1, 0x83, 0x89, 0x4d, 0x43, 0xfe, 0x98, 0x93, 0xbb, 0x94, 0x6a, 0xe1, 0x04, 0x2f,
];

/// Number of parameter slots in every invoke.
pub const MAX_PARAMS: usize = 4;

/// Commands understood by the Trusted Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TaCommand {
    /// Power up the execution unit in the requested mode.
    ActivateNpu = 0,
    /// Reset the execution unit.
    DeactivateNpu = 1,
    /// Bind an attachment to an input slot.
    SetInput = 2,
    /// Bind an attachment to an output slot.
    SetOutput = 3,
    /// Register a network from its header, payload and resources.
    CreateNetwork = 4,
    /// Release a network.
    DestroyNetwork = 5,
    /// Kick off one execution of a network.
    StartNetwork = 6,
    /// Read (and clear) the completion status register.
    ReadInterruptRegister = 7,
    /// Emit diagnostic state to the secure log.
    DumpState = 8,
    /// Register an IO buffer from a list of memory areas.
    CreateIoBufferFromSg = 9,
    /// Register an IO buffer sharing memory with an existing one.
    CreateIoBufferFromMemId = 10,
    /// Release an IO buffer.
    DestroyIoBuffer = 11,
    /// Attach an IO buffer to a network.
    AttachIoBuffer = 12,
    /// Detach an IO buffer from a network.
    DetachIoBuffer = 13,
}

impl TaCommand {
    /// All commands in id order.
    pub const ALL: [Self; 14] = [
        Self::ActivateNpu,
        Self::DeactivateNpu,
        Self::SetInput,
        Self::SetOutput,
        Self::CreateNetwork,
        Self::DestroyNetwork,
        Self::StartNetwork,
        Self::ReadInterruptRegister,
        Self::DumpState,
        Self::CreateIoBufferFromSg,
        Self::CreateIoBufferFromMemId,
        Self::DestroyIoBuffer,
        Self::AttachIoBuffer,
        Self::DetachIoBuffer,
    ];

    /// Wire id of this command.
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Decode a wire id.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// Short upper-case name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ActivateNpu => "ACTIVATE_NPU",
            Self::DeactivateNpu => "DEACTIVATE_NPU",
            Self::SetInput => "SET_INPUT",
            Self::SetOutput => "SET_OUTPUT",
            Self::CreateNetwork => "CREATE_NETWORK",
            Self::DestroyNetwork => "DESTROY_NETWORK",
            Self::StartNetwork => "START_NETWORK",
            Self::ReadInterruptRegister => "READ_INTERRUPT_REGISTER",
            Self::DumpState => "DUMP_STATE",
            Self::CreateIoBufferFromSg => "CREATE_IO_BUFFER_FROM_SG",
            Self::CreateIoBufferFromMemId => "CREATE_IO_BUFFER_FROM_MEM_ID",
            Self::DestroyIoBuffer => "DESTROY_IO_BUFFER",
            Self::AttachIoBuffer => "ATTACH_IO_BUFFER",
            Self::DetachIoBuffer => "DETACH_IO_BUFFER",
        }
    }
}

impl std::fmt::Display for TaCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Result codes (GlobalPlatform TEE client API) ────────────────────────────

/// Result codes returned by the secure peer.
pub mod result {
    /// Success.
    pub const SUCCESS: u32 = 0x0000_0000;
    /// Non-specific failure.
    pub const GENERIC: u32 = 0xFFFF_0000;
    /// Access privileges are not sufficient.
    pub const ACCESS_DENIED: u32 = 0xFFFF_0001;
    /// Operation was cancelled.
    pub const CANCEL: u32 = 0xFFFF_0002;
    /// Concurrent access caused a conflict.
    pub const ACCESS_CONFLICT: u32 = 0xFFFF_0003;
    /// Too much data for the requested operation.
    pub const EXCESS_DATA: u32 = 0xFFFF_0004;
    /// Input data has an invalid format.
    pub const BAD_FORMAT: u32 = 0xFFFF_0005;
    /// Input parameters are invalid.
    pub const BAD_PARAMETERS: u32 = 0xFFFF_0006;
    /// Operation is not valid in the current state.
    pub const BAD_STATE: u32 = 0xFFFF_0007;
    /// Requested item was not found.
    pub const ITEM_NOT_FOUND: u32 = 0xFFFF_0008;
    /// Operation exists but is not implemented.
    pub const NOT_IMPLEMENTED: u32 = 0xFFFF_0009;
    /// Operation is not supported by this implementation.
    pub const NOT_SUPPORTED: u32 = 0xFFFF_000A;
    /// Expected data was missing.
    pub const NO_DATA: u32 = 0xFFFF_000B;
    /// System ran out of resources.
    pub const OUT_OF_MEMORY: u32 = 0xFFFF_000C;
    /// System is busy.
    pub const BUSY: u32 = 0xFFFF_000D;
    /// Communication with a remote party failed.
    pub const COMMUNICATION: u32 = 0xFFFF_000E;
    /// A security fault was detected.
    pub const SECURITY: u32 = 0xFFFF_000F;
    /// Supplied buffer is too short.
    pub const SHORT_BUFFER: u32 = 0xFFFF_0010;
    /// MAC check failed.
    pub const MAC_INVALID: u32 = 0xFFFF_3071;

    /// Diagnostic name of a result code.
    pub const fn name(code: u32) -> &'static str {
        match code {
            SUCCESS => "SUCCESS",
            GENERIC => "GENERIC",
            ACCESS_DENIED => "ACCESS_DENIED",
            CANCEL => "CANCEL",
            ACCESS_CONFLICT => "ACCESS_CONFLICT",
            EXCESS_DATA => "EXCESS_DATA",
            BAD_FORMAT => "BAD_FORMAT/INCOMPATIBLE_HW",
            BAD_PARAMETERS => "BAD_PARAMETERS",
            BAD_STATE => "BAD_STATE",
            ITEM_NOT_FOUND => "ITEM_NOT_FOUND",
            NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
            NOT_SUPPORTED => "NOT_SUPPORTED",
            NO_DATA => "NO_DATA",
            OUT_OF_MEMORY => "OUT_OF_MEMORY",
            BUSY => "BUSY",
            COMMUNICATION => "COMMUNICATION",
            SECURITY => "SECURITY",
            SHORT_BUFFER => "SHORT_BUFFER",
            MAC_INVALID => "MAC_INVALID",
            _ => "UNKNOWN",
        }
    }
}

// ── Shared-memory block layout ───────────────────────────────────────────────

/// Bytes per memory area: `addr: u64`, `npage: u32`, reserved `u32`.
pub const MEMORY_AREA_SIZE: usize = 16;

/// Memory areas passed at session open: non-secure then secure driver buffer.
pub const SESSION_AREA_COUNT: usize = 2;

/// User-buffer block header: `areas_count`, `offset`, `size` (`u32` each).
pub const USER_BUFFER_HEADER_SIZE: usize = 12;

/// Network-resources block header: code, page-table, pool and profile area counts.
pub const NETWORK_RESOURCES_HEADER_SIZE: usize = 16;

/// One profiling record written by the peer per executed operation:
/// `layer`, `cycles`, `time_us`, `flags` (`u32` each).
pub const PROFILE_RECORD_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_roundtrip() {
        for cmd in TaCommand::ALL {
            assert_eq!(TaCommand::from_id(cmd.id()), Some(cmd));
        }
        assert_eq!(TaCommand::from_id(99), None);
    }

    #[test]
    fn result_names() {
        assert_eq!(result::name(result::SECURITY), "SECURITY");
        assert_eq!(result::name(result::BAD_FORMAT), "BAD_FORMAT/INCOMPATIBLE_HW");
        assert_eq!(result::name(0x1234), "UNKNOWN");
    }
}
