//! Control-surface ABI.
//!
//! Each command carries one fixed-layout request structure; output fields
//! are written back into the same structure. Command numbers follow the
//! Linux `_IOC` encoding with type `'S'`:
//!
//! ```text
//! bits 31..30  direction (1 write, 2 read, 3 read/write)
//! bits 29..16  argument size
//! bits 15..8   type ('S')
//! bits 7..0    command number
//! ```
//!
//! Command numbers and layouts are a compatibility surface shared with the
//! access-control policy. They are never renumbered; new commands take new
//! numbers and bump [`UAPI_VERSION`].

use std::fmt::Write as _;
use std::mem::size_of;

/// Version of the control-surface ABI.
pub const UAPI_VERSION: u32 = 1;

/// `_IOC` type byte.
pub const IOC_TYPE: u8 = b'S';

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u8, size: usize) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let size = size as u32;
    (dir << 30) | (size << 16) | ((IOC_TYPE as u32) << 8) | nr as u32
}

/// `SET_NETWORK_INPUT` / `SET_NETWORK_OUTPUT` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetNetworkIoData {
    /// Network handle.
    pub nid: u32,
    /// Attachment handle within the network.
    pub aid: u32,
    /// Slot index.
    pub index: u32,
}

/// `CREATE_IO_BUFFER` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateIoBufferData {
    /// Requested size in bytes.
    pub size: u32,
    /// Out: buffer handle.
    pub bid: u32,
    /// Out: memory id for cross-process sharing.
    pub mem_id: u32,
    /// Out: exported memory handle.
    pub fd: i32,
}

/// `CREATE_IO_BUFFER_FROM_DMABUF` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateIoBufferFromDmabufData {
    /// External memory handle.
    pub fd: i32,
    /// Offset into the external memory, page aligned.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
    /// Out: buffer handle.
    pub bid: u32,
    /// Out: memory id for cross-process sharing.
    pub mem_id: u32,
}

/// `CREATE_SECURE_IO_BUFFER_FROM_DMABUF` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateSecureIoBufferFromDmabufData {
    /// Common external-memory fields.
    pub buffer: CreateIoBufferFromDmabufData,
    /// Non-zero when the memory lives in secure address space.
    pub secure: u32,
}

/// `CREATE_IO_BUFFER_FROM_MEM_ID` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateIoBufferFromMemIdData {
    /// Memory id returned by another buffer's creation.
    pub mem_id: u32,
    /// Offset into the shared memory.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
    /// Out: buffer handle.
    pub bid: u32,
}

/// `ATTACH_IO_BUFFER` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachIoBufferData {
    /// Network handle.
    pub nid: u32,
    /// Buffer handle.
    pub bid: u32,
    /// Out: attachment handle.
    pub aid: u32,
}

/// `DETACH_IO_BUFFER` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentData {
    /// Network handle.
    pub nid: u32,
    /// Attachment handle.
    pub aid: u32,
}

/// `CREATE_NETWORK` argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateNetworkData {
    /// Caller address of the model image.
    pub start: u64,
    /// Model image size in bytes.
    pub size: u32,
    /// Out: network handle.
    pub nid: u32,
}

/// Control-surface commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// Bind an attachment to an input slot.
    SetNetworkInput,
    /// Bind an attachment to an output slot.
    SetNetworkOutput,
    /// Wrap external memory as a non-secure IO buffer.
    CreateIoBufferFromDmabuf,
    /// Destroy an IO buffer.
    DestroyIoBuffer,
    /// Attach an IO buffer to a network.
    AttachIoBuffer,
    /// Detach an IO buffer from a network.
    DetachIoBuffer,
    /// Execute a network synchronously.
    RunNetwork,
    /// Upload a model image.
    CreateNetwork,
    /// Destroy a network.
    DestroyNetwork,
    /// Take the execution reservation.
    LockHardware,
    /// Release the execution reservation.
    UnlockHardware,
    /// Ask whether a reservation is held.
    QueryHardwareLock,
    /// Share memory of another buffer by memory id.
    CreateIoBufferFromMemId,
    /// Wrap external memory, secure or not.
    CreateSecureIoBufferFromDmabuf,
    /// Allocate a fresh IO buffer.
    CreateIoBuffer,
}

impl ControlCommand {
    /// Every command, in command-number order.
    pub const ALL: [Self; 15] = [
        Self::SetNetworkInput,
        Self::SetNetworkOutput,
        Self::CreateIoBufferFromDmabuf,
        Self::DestroyIoBuffer,
        Self::AttachIoBuffer,
        Self::DetachIoBuffer,
        Self::RunNetwork,
        Self::CreateNetwork,
        Self::DestroyNetwork,
        Self::LockHardware,
        Self::UnlockHardware,
        Self::QueryHardwareLock,
        Self::CreateIoBufferFromMemId,
        Self::CreateSecureIoBufferFromDmabuf,
        Self::CreateIoBuffer,
    ];

    /// Fixed command number (`nr` field). Never reused.
    pub const fn nr(self) -> u8 {
        match self {
            Self::SetNetworkInput => 1,
            Self::SetNetworkOutput => 2,
            Self::CreateIoBufferFromDmabuf => 3,
            Self::DestroyIoBuffer => 4,
            Self::AttachIoBuffer => 5,
            Self::DetachIoBuffer => 6,
            Self::RunNetwork => 7,
            Self::CreateNetwork => 8,
            Self::DestroyNetwork => 9,
            Self::LockHardware => 10,
            Self::UnlockHardware => 11,
            Self::QueryHardwareLock => 12,
            Self::CreateIoBufferFromMemId => 13,
            Self::CreateSecureIoBufferFromDmabuf => 14,
            Self::CreateIoBuffer => 15,
        }
    }

    /// Full `_IOC` command number.
    pub const fn number(self) -> u32 {
        let rw = IOC_READ | IOC_WRITE;
        match self {
            Self::SetNetworkInput | Self::SetNetworkOutput => {
                ioc(IOC_WRITE, self.nr(), size_of::<SetNetworkIoData>())
            }
            Self::CreateIoBufferFromDmabuf => {
                ioc(rw, self.nr(), size_of::<CreateIoBufferFromDmabufData>())
            }
            Self::DestroyIoBuffer | Self::RunNetwork | Self::DestroyNetwork => {
                ioc(IOC_WRITE, self.nr(), size_of::<u32>())
            }
            Self::AttachIoBuffer => ioc(rw, self.nr(), size_of::<AttachIoBufferData>()),
            Self::DetachIoBuffer => ioc(IOC_WRITE, self.nr(), size_of::<AttachmentData>()),
            Self::CreateNetwork => ioc(rw, self.nr(), size_of::<CreateNetworkData>()),
            Self::LockHardware | Self::UnlockHardware => ioc(IOC_NONE, self.nr(), 0),
            Self::QueryHardwareLock => ioc(IOC_READ, self.nr(), size_of::<u32>()),
            Self::CreateIoBufferFromMemId => {
                ioc(rw, self.nr(), size_of::<CreateIoBufferFromMemIdData>())
            }
            Self::CreateSecureIoBufferFromDmabuf => {
                ioc(rw, self.nr(), size_of::<CreateSecureIoBufferFromDmabufData>())
            }
            Self::CreateIoBuffer => ioc(rw, self.nr(), size_of::<CreateIoBufferData>()),
        }
    }

    /// Decode a full command number.
    pub fn from_number(number: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.number() == number)
    }

    /// Policy-layer symbol name.
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::SetNetworkInput => "TNPU_SET_NETWORK_INPUT",
            Self::SetNetworkOutput => "TNPU_SET_NETWORK_OUTPUT",
            Self::CreateIoBufferFromDmabuf => "TNPU_CREATE_IO_BUFFER_FROM_DMABUF",
            Self::DestroyIoBuffer => "TNPU_DESTROY_IO_BUFFER",
            Self::AttachIoBuffer => "TNPU_ATTACH_IO_BUFFER",
            Self::DetachIoBuffer => "TNPU_DETACH_IO_BUFFER",
            Self::RunNetwork => "TNPU_RUN_NETWORK",
            Self::CreateNetwork => "TNPU_CREATE_NETWORK",
            Self::DestroyNetwork => "TNPU_DESTROY_NETWORK",
            Self::LockHardware => "TNPU_LOCK_HARDWARE",
            Self::UnlockHardware => "TNPU_UNLOCK_HARDWARE",
            Self::QueryHardwareLock => "TNPU_QUERY_HARDWARE_LOCK",
            Self::CreateIoBufferFromMemId => "TNPU_CREATE_IO_BUFFER_FROM_MEM_ID",
            Self::CreateSecureIoBufferFromDmabuf => "TNPU_CREATE_SECURE_IO_BUFFER_FROM_DMABUF",
            Self::CreateIoBuffer => "TNPU_CREATE_IO_BUFFER",
        }
    }
}

/// Render the m4 `define` lines consumed by the access-control policy build.
///
/// ```text
/// define(`TNPU_SET_NETWORK_INPUT', `0x400c5301')
/// ```
pub fn render_policy_defines() -> String {
    let mut out = String::new();
    for cmd in ControlCommand::ALL {
        // Writing into a String cannot fail.
        let _ = writeln!(out, "define(`{}', `0x{:08x}')", cmd.symbol(), cmd.number());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(size_of::<SetNetworkIoData>(), 12);
        assert_eq!(size_of::<CreateIoBufferData>(), 16);
        assert_eq!(size_of::<CreateIoBufferFromDmabufData>(), 20);
        assert_eq!(size_of::<CreateSecureIoBufferFromDmabufData>(), 24);
        assert_eq!(size_of::<CreateIoBufferFromMemIdData>(), 16);
        assert_eq!(size_of::<AttachIoBufferData>(), 12);
        assert_eq!(size_of::<AttachmentData>(), 8);
        assert_eq!(size_of::<CreateNetworkData>(), 16);
    }

    /// These numbers are shipped in policy files. Changing one is a break.
    #[test]
    fn command_numbers_are_pinned() {
        let expected: [(ControlCommand, u32); 15] = [
            (ControlCommand::SetNetworkInput, 0x400c_5301),
            (ControlCommand::SetNetworkOutput, 0x400c_5302),
            (ControlCommand::CreateIoBufferFromDmabuf, 0xc014_5303),
            (ControlCommand::DestroyIoBuffer, 0x4004_5304),
            (ControlCommand::AttachIoBuffer, 0xc00c_5305),
            (ControlCommand::DetachIoBuffer, 0x4008_5306),
            (ControlCommand::RunNetwork, 0x4004_5307),
            (ControlCommand::CreateNetwork, 0xc010_5308),
            (ControlCommand::DestroyNetwork, 0x4004_5309),
            (ControlCommand::LockHardware, 0x0000_530a),
            (ControlCommand::UnlockHardware, 0x0000_530b),
            (ControlCommand::QueryHardwareLock, 0x8004_530c),
            (ControlCommand::CreateIoBufferFromMemId, 0xc010_530d),
            (ControlCommand::CreateSecureIoBufferFromDmabuf, 0xc018_530e),
            (ControlCommand::CreateIoBuffer, 0xc010_530f),
        ];
        for (cmd, number) in expected {
            assert_eq!(cmd.number(), number, "{cmd:?}");
            assert_eq!(ControlCommand::from_number(number), Some(cmd));
        }
    }

    #[test]
    fn policy_defines_format() {
        let text = render_policy_defines();
        assert_eq!(text.lines().count(), ControlCommand::ALL.len());
        assert!(text.starts_with("define(`TNPU_SET_NETWORK_INPUT', `0x400c5301')\n"));
        assert!(text.contains("define(`TNPU_CREATE_IO_BUFFER', `0xc010530f')"));
    }
}
