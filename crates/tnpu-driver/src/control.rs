//! Control-surface dispatch.
//!
//! Each [`ControlRequest`] wraps the fixed-layout structure of one command.
//! [`dispatch`] runs it against a session and writes output fields back into
//! the structure; [`status_code`] reduces the outcome to the value returned
//! to the caller.

use crate::error::{NpuError, Result};
use crate::mem::ExternalHandle;
use crate::session::Session;
use tnpu_chip::uapi::{
    AttachIoBufferData, AttachmentData, ControlCommand, CreateIoBufferData,
    CreateIoBufferFromDmabufData, CreateIoBufferFromMemIdData, CreateNetworkData,
    CreateSecureIoBufferFromDmabufData, SetNetworkIoData,
};
use tracing::debug;

/// One control command with its argument.
#[derive(Debug)]
pub enum ControlRequest<'a> {
    /// Bind an attachment to an input slot
    SetNetworkInput(SetNetworkIoData),
    /// Bind an attachment to an output slot
    SetNetworkOutput(SetNetworkIoData),
    /// Allocate and export a fresh buffer
    CreateIoBuffer(CreateIoBufferData),
    /// Wrap non-secure external memory
    CreateIoBufferFromDmabuf(CreateIoBufferFromDmabufData),
    /// Wrap external memory, secure or not
    CreateSecureIoBufferFromDmabuf(CreateSecureIoBufferFromDmabufData),
    /// Share another buffer's memory by id
    CreateIoBufferFromMemId(CreateIoBufferFromMemIdData),
    /// Destroy a buffer by handle
    DestroyIoBuffer(u32),
    /// Attach a buffer to a network
    AttachIoBuffer(AttachIoBufferData),
    /// Detach an attachment from a network
    DetachIoBuffer(AttachmentData),
    /// Upload a model image
    CreateNetwork {
        /// Model image the request points at
        model: &'a [u8],
        /// Request structure
        data: CreateNetworkData,
    },
    /// Destroy a network by handle
    DestroyNetwork(u32),
    /// Run a network by handle
    RunNetwork(u32),
    /// Reserve the hardware
    LockHardware,
    /// Release the reservation
    UnlockHardware,
    /// Out: 1 if any session holds the reservation
    QueryHardwareLock(u32),
}

impl ControlRequest<'_> {
    /// Command this request carries.
    pub fn command(&self) -> ControlCommand {
        match self {
            Self::SetNetworkInput(_) => ControlCommand::SetNetworkInput,
            Self::SetNetworkOutput(_) => ControlCommand::SetNetworkOutput,
            Self::CreateIoBuffer(_) => ControlCommand::CreateIoBuffer,
            Self::CreateIoBufferFromDmabuf(_) => ControlCommand::CreateIoBufferFromDmabuf,
            Self::CreateSecureIoBufferFromDmabuf(_) => {
                ControlCommand::CreateSecureIoBufferFromDmabuf
            }
            Self::CreateIoBufferFromMemId(_) => ControlCommand::CreateIoBufferFromMemId,
            Self::DestroyIoBuffer(_) => ControlCommand::DestroyIoBuffer,
            Self::AttachIoBuffer(_) => ControlCommand::AttachIoBuffer,
            Self::DetachIoBuffer(_) => ControlCommand::DetachIoBuffer,
            Self::CreateNetwork { .. } => ControlCommand::CreateNetwork,
            Self::DestroyNetwork(_) => ControlCommand::DestroyNetwork,
            Self::RunNetwork(_) => ControlCommand::RunNetwork,
            Self::LockHardware => ControlCommand::LockHardware,
            Self::UnlockHardware => ControlCommand::UnlockHardware,
            Self::QueryHardwareLock(_) => ControlCommand::QueryHardwareLock,
        }
    }
}

fn external(fd: i32) -> Result<ExternalHandle> {
    if fd < 0 {
        return Err(NpuError::invalid_argument(format!("bad memory handle {fd}")));
    }
    Ok(ExternalHandle::from_raw(fd))
}

fn wrap_external(
    session: &Session,
    data: &mut CreateIoBufferFromDmabufData,
    secure: bool,
) -> Result<()> {
    let created = session.create_io_buffer_from_external(
        external(data.fd)?,
        u64::from(data.offset),
        u64::from(data.size),
        secure,
    )?;
    data.bid = created.bid;
    data.mem_id = created.mem_id;
    Ok(())
}

/// Execute `request` on `session`, filling in its output fields.
///
/// # Errors
///
/// Returns whatever the session operation returns.
pub fn dispatch(session: &Session, request: &mut ControlRequest<'_>) -> Result<()> {
    debug!("session {}: {}", session.id(), request.command().symbol());
    match request {
        ControlRequest::SetNetworkInput(io) => session.set_input(io.nid, io.aid, io.index),
        ControlRequest::SetNetworkOutput(io) => session.set_output(io.nid, io.aid, io.index),
        ControlRequest::CreateIoBuffer(data) => {
            let created = session.create_io_buffer(u64::from(data.size))?;
            data.bid = created.bid;
            data.mem_id = created.mem_id;
            data.fd = created.fd.map_or(-1, ExternalHandle::raw);
            Ok(())
        }
        ControlRequest::CreateIoBufferFromDmabuf(data) => wrap_external(session, data, false),
        ControlRequest::CreateSecureIoBufferFromDmabuf(data) => {
            let secure = data.secure != 0;
            wrap_external(session, &mut data.buffer, secure)
        }
        ControlRequest::CreateIoBufferFromMemId(data) => {
            data.bid = session.create_io_buffer_from_mem_id(data.mem_id, data.offset, data.size)?;
            Ok(())
        }
        ControlRequest::DestroyIoBuffer(bid) => session.destroy_io_buffer(*bid),
        ControlRequest::AttachIoBuffer(data) => {
            data.aid = session.attach_io_buffer(data.nid, data.bid)?;
            Ok(())
        }
        ControlRequest::DetachIoBuffer(data) => session.detach_io_buffer(data.nid, data.aid),
        ControlRequest::CreateNetwork { model, data } => {
            let image = model.get(..data.size as usize).ok_or_else(|| {
                NpuError::invalid_argument(format!(
                    "model size {} exceeds the {} bytes supplied",
                    data.size,
                    model.len()
                ))
            })?;
            data.nid = session.create_network(image)?;
            Ok(())
        }
        ControlRequest::DestroyNetwork(nid) => session.destroy_network(*nid),
        ControlRequest::RunNetwork(nid) => session.run_network(*nid).map(|_| ()),
        ControlRequest::LockHardware => session.lock_hardware(),
        ControlRequest::UnlockHardware => session.unlock_hardware(),
        ControlRequest::QueryHardwareLock(locked) => {
            *locked = u32::from(session.query_hardware_lock());
            Ok(())
        }
    }
}

/// Value returned to the caller: `0`, `-EINVAL`, `-EFAULT` or `-EINTR`.
pub fn status_code(outcome: &Result<()>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(e) => e.class().errno(),
    }
}
