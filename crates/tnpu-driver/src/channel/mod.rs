//! Secure channel to the Trusted Application.
//!
//! [`SecureChannel`] is the transport-independent command set the rest of
//! the control plane uses. [`TaClient`] implements it once: it marshals
//! every command into [`Param`] slots and [`wire`] blocks, then hands them to
//! a [`Transport`]. The two transports differ only in how they talk to the
//! secure world:
//!
//! ```text
//! GpTransport      generic TEE client   tee_param[] + invoke_arg, i32 + ret
//! VendorTransport  vendor TEEC client   TEEC_Operation, packed param types
//! ```
//!
//! Because marshalling lives above the transport, both backends put
//! identical requests in front of the peer.

pub mod gp;
pub mod peer;
pub mod vendor;
pub mod wire;

pub use gp::{GpContext, GpTransport};
pub use peer::{Param, Params, PeerCall, RecordingPeer, SecurePeer};
pub use vendor::{TeecContext, VendorTransport};

use crate::error::{NpuError, Result};
use crate::mem::Region;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tnpu_chip::ta::{result, TaCommand};
use tracing::{debug, error};

/// Mode the execution unit is activated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    /// Networks on non-secure memory
    NonSecure,
    /// Networks whose code and pool live in secure memory
    Secure,
}

/// Diagnostic sub-kind of a peer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHint {
    /// Model signed or encrypted for a different key set
    KeyMismatch,
    /// Model compiled for incompatible hardware
    IncompatibleHardware,
    /// Anything else
    General,
}

/// Sub-kind of a failed `command` returning `code`.
pub fn classify_failure(command: TaCommand, code: u32) -> FailureHint {
    match (command, code) {
        (_, result::SECURITY) => FailureHint::KeyMismatch,
        (TaCommand::StartNetwork, result::BAD_FORMAT) => FailureHint::IncompatibleHardware,
        _ => FailureHint::General,
    }
}

/// Map a peer result code to success, logging failures.
///
/// # Errors
///
/// Returns [`NpuError::Peer`] for any code other than `SUCCESS`.
pub fn check_result(command: TaCommand, code: u32) -> Result<()> {
    if code == result::SUCCESS {
        return Ok(());
    }
    let hint = classify_failure(command, code);
    match hint {
        FailureHint::KeyMismatch => error!(
            "{command} failed: model signed/encrypted for a different key set ({code:#010x})"
        ),
        FailureHint::IncompatibleHardware => error!(
            "{command} failed: model compiled for incompatible hardware ({code:#010x})"
        ),
        FailureHint::General => error!(
            "{command} failed: {} ({code:#010x})",
            result::name(code)
        ),
    }
    Err(NpuError::Peer {
        command,
        code,
        hint,
    })
}

/// Peer-side identifiers of a new IO buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerBuffer {
    /// Peer buffer id
    pub bid: u32,
    /// Memory id other sessions can share
    pub mem_id: u32,
}

/// Regions uploaded when creating a network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkUpload<'a> {
    /// Public data (header and metadata)
    pub header: &'a Region,
    /// Remainder of the model image
    pub payload: &'a Region,
    /// Code region
    pub code: &'a Region,
    /// Page-table region
    pub page_table: &'a Region,
    /// Constant pool, if any
    pub pool: Option<&'a Region>,
    /// Profiling records, if any
    pub profile: Option<&'a Region>,
}

/// Transport-independent command set of the Trusted Application.
pub trait SecureChannel: Debug + Send + Sync {
    /// Backend in use
    fn backend_type(&self) -> BackendType;

    /// Make the Trusted Application image available to the secure world.
    ///
    /// # Errors
    ///
    /// Returns error if the secure world refuses the image.
    fn load_ta(&self, image: &[u8]) -> Result<()>;

    /// Open the session, handing over the driver buffers.
    ///
    /// # Errors
    ///
    /// Returns error if a buffer is scattered or the peer refuses.
    fn open_session(&self, non_secure: &Region, secure: &Region) -> Result<()>;

    /// Close the session.
    ///
    /// # Errors
    ///
    /// Returns error if no session is open.
    fn close_session(&self) -> Result<()>;

    /// Activate the execution unit.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn activate(&self, mode: ActivationMode) -> Result<()>;

    /// Reset the execution unit.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn deactivate(&self) -> Result<()>;

    /// Register a network; returns the peer network id.
    ///
    /// # Errors
    ///
    /// Returns error if marshalling fails or the peer rejects the model.
    fn create_network(&self, upload: &NetworkUpload<'_>) -> Result<u32>;

    /// Release a network.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn destroy_network(&self, nid: u32) -> Result<()>;

    /// Start one execution; completion arrives as an interrupt.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn start_network(&self, nid: u32) -> Result<()>;

    /// Read and clear the completion status register.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn read_interrupt_status(&self) -> Result<u32>;

    /// Ask the peer to log its state.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn dump_state(&self) -> Result<()>;

    /// Register an IO buffer from the region's segments, clipped to its window.
    ///
    /// # Errors
    ///
    /// Returns error if the window is misaligned or the peer rejects it.
    fn create_io_buffer(&self, region: &Region, secure: bool) -> Result<PeerBuffer>;

    /// Register an IO buffer sharing another buffer's memory.
    ///
    /// # Errors
    ///
    /// Returns error if the peer does not know `mem_id` or the range is invalid.
    fn create_io_buffer_from_mem_id(&self, mem_id: u32, offset: u32, size: u32) -> Result<u32>;

    /// Release an IO buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn destroy_io_buffer(&self, bid: u32) -> Result<()>;

    /// Attach a buffer to a network; returns the peer attachment id.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn attach_io_buffer(&self, nid: u32, bid: u32) -> Result<u32>;

    /// Detach a buffer from a network.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn detach_io_buffer(&self, nid: u32, aid: u32) -> Result<()>;

    /// Use an attachment as input slot `index`.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn set_input(&self, nid: u32, aid: u32, index: u32) -> Result<()>;

    /// Use an attachment as output slot `index`.
    ///
    /// # Errors
    ///
    /// Returns error if the peer rejects the command.
    fn set_output(&self, nid: u32, aid: u32, index: u32) -> Result<()>;
}

/// Raw invoke path to the secure world.
pub trait Transport: Debug + Send + Sync {
    /// Backend identifier
    fn backend_type(&self) -> BackendType;

    /// Register the Trusted Application image, if the secure world needs it.
    ///
    /// # Errors
    ///
    /// Returns error if registration fails.
    fn load_ta(&self, image: &[u8]) -> Result<()>;

    /// Open the session with `params`.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails or the peer refuses.
    fn open_session(&self, params: &mut Params) -> Result<()>;

    /// Invoke `command`; `ValueOut` slots are filled on success.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails or the peer returns a failure code.
    fn invoke(&self, command: TaCommand, params: &mut Params) -> Result<()>;

    /// Close the session.
    ///
    /// # Errors
    ///
    /// Returns error if no session is open.
    fn close_session(&self) -> Result<()>;
}

/// [`SecureChannel`] over any [`Transport`].
#[derive(Debug)]
pub struct TaClient<T> {
    transport: T,
}

/// Channel over the generic TEE client.
pub type GpTeeChannel = TaClient<GpTransport>;

/// Channel over the vendor TEEC client.
pub type VendorTeeChannel = TaClient<VendorTransport>;

impl<T: Transport> TaClient<T> {
    /// Client speaking through `transport`.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    fn call(&self, command: TaCommand, mut params: Params) -> Result<Params> {
        debug!("{command} via {}", self.transport.backend_type());
        self.transport.invoke(command, &mut params)?;
        Ok(params)
    }

    fn output(params: &Params, slot: usize) -> Result<(u32, u32)> {
        match params[slot] {
            Param::ValueOut { a, b } => Ok((a, b)),
            _ => Err(NpuError::transport(format!("slot {slot} lost its output value"))),
        }
    }
}

fn value(a: u32, b: u32) -> Param {
    Param::ValueIn { a, b }
}

impl<T: Transport> SecureChannel for TaClient<T> {
    fn backend_type(&self) -> BackendType {
        self.transport.backend_type()
    }

    fn load_ta(&self, image: &[u8]) -> Result<()> {
        self.transport.load_ta(image)
    }

    fn open_session(&self, non_secure: &Region, secure: &Region) -> Result<()> {
        let block = wire::session_block(non_secure, secure)?;
        let mut params = [Param::MemrefIn(block), Param::None, Param::None, Param::None];
        self.transport.open_session(&mut params)
    }

    fn close_session(&self) -> Result<()> {
        self.transport.close_session()
    }

    fn activate(&self, mode: ActivationMode) -> Result<()> {
        let secure = u32::from(mode == ActivationMode::Secure);
        self.call(
            TaCommand::ActivateNpu,
            [value(secure, 0), Param::None, Param::None, Param::None],
        )?;
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        self.call(TaCommand::DeactivateNpu, Params::default())?;
        Ok(())
    }

    fn create_network(&self, upload: &NetworkUpload<'_>) -> Result<u32> {
        let header = wire::user_buffer_block(upload.header)?;
        let payload = wire::user_buffer_block(upload.payload)?;
        let resources = wire::network_resources_block(
            upload.code,
            upload.page_table,
            upload.pool,
            upload.profile,
        )?;
        debug!(
            "create network: header {} B, payload {} B, resources {} B",
            header.len(),
            payload.len(),
            resources.len()
        );
        let params = self.call(
            TaCommand::CreateNetwork,
            [
                Param::MemrefIn(header),
                Param::MemrefIn(payload),
                Param::MemrefIn(resources),
                Param::output(),
            ],
        )?;
        Ok(Self::output(&params, 3)?.0)
    }

    fn destroy_network(&self, nid: u32) -> Result<()> {
        self.call(
            TaCommand::DestroyNetwork,
            [value(nid, 0), Param::None, Param::None, Param::None],
        )?;
        Ok(())
    }

    fn start_network(&self, nid: u32) -> Result<()> {
        self.call(
            TaCommand::StartNetwork,
            [value(nid, 0), Param::None, Param::None, Param::None],
        )?;
        Ok(())
    }

    fn read_interrupt_status(&self) -> Result<u32> {
        let params = self.call(
            TaCommand::ReadInterruptRegister,
            [Param::output(), Param::None, Param::None, Param::None],
        )?;
        Ok(Self::output(&params, 0)?.0)
    }

    fn dump_state(&self) -> Result<()> {
        self.call(TaCommand::DumpState, Params::default())?;
        Ok(())
    }

    fn create_io_buffer(&self, region: &Region, secure: bool) -> Result<PeerBuffer> {
        let (areas, count) = wire::io_buffer_block(region)?;
        let params = self.call(
            TaCommand::CreateIoBufferFromSg,
            [
                Param::MemrefIn(areas),
                value(u32::from(secure), count),
                Param::output(),
                Param::None,
            ],
        )?;
        let (bid, mem_id) = Self::output(&params, 2)?;
        Ok(PeerBuffer { bid, mem_id })
    }

    fn create_io_buffer_from_mem_id(&self, mem_id: u32, offset: u32, size: u32) -> Result<u32> {
        let params = self.call(
            TaCommand::CreateIoBufferFromMemId,
            [value(mem_id, 0), value(offset, size), Param::output(), Param::None],
        )?;
        Ok(Self::output(&params, 2)?.0)
    }

    fn destroy_io_buffer(&self, bid: u32) -> Result<()> {
        self.call(
            TaCommand::DestroyIoBuffer,
            [value(bid, 0), Param::None, Param::None, Param::None],
        )?;
        Ok(())
    }

    fn attach_io_buffer(&self, nid: u32, bid: u32) -> Result<u32> {
        let params = self.call(
            TaCommand::AttachIoBuffer,
            [value(bid, nid), Param::output(), Param::None, Param::None],
        )?;
        Ok(Self::output(&params, 1)?.0)
    }

    fn detach_io_buffer(&self, nid: u32, aid: u32) -> Result<()> {
        self.call(
            TaCommand::DetachIoBuffer,
            [value(nid, aid), Param::None, Param::None, Param::None],
        )?;
        Ok(())
    }

    fn set_input(&self, nid: u32, aid: u32, index: u32) -> Result<()> {
        self.call(
            TaCommand::SetInput,
            [value(nid, aid), value(index, 0), Param::None, Param::None],
        )?;
        Ok(())
    }

    fn set_output(&self, nid: u32, aid: u32, index: u32) -> Result<()> {
        self.call(
            TaCommand::SetOutput,
            [value(nid, aid), value(index, 0), Param::None, Param::None],
        )?;
        Ok(())
    }
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Generic TEE client (tee_param / invoke_arg)
    Generic,
    /// Vendor TEEC client (packed parameter types)
    Vendor,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generic => write!(f, "Generic TEE client"),
            Self::Vendor => write!(f, "Vendor TEEC client"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// Generic TEE client
    #[default]
    Generic,
    /// Vendor TEEC client
    Vendor,
}

impl FromStr for BackendSelection {
    type Err = NpuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "gp" | "optee" => Ok(Self::Generic),
            "vendor" | "teec" | "tzk" => Ok(Self::Vendor),
            other => Err(NpuError::invalid_argument(format!(
                "unknown secure channel backend '{other}'"
            ))),
        }
    }
}

/// Build the channel chosen by `selection`, talking to `peer`.
pub fn select_channel(selection: BackendSelection, peer: Arc<dyn SecurePeer>) -> Arc<dyn SecureChannel> {
    match selection {
        BackendSelection::Generic => {
            tracing::info!("Using generic TEE client backend");
            Arc::new(GpTeeChannel::new(GpTransport::new(GpContext::new(peer))))
        }
        BackendSelection::Vendor => {
            tracing::info!("Using vendor TEEC client backend");
            Arc::new(VendorTeeChannel::new(VendorTransport::new(TeecContext::new(peer))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_hints() {
        assert_eq!(
            classify_failure(TaCommand::CreateNetwork, result::SECURITY),
            FailureHint::KeyMismatch
        );
        assert_eq!(
            classify_failure(TaCommand::StartNetwork, result::BAD_FORMAT),
            FailureHint::IncompatibleHardware
        );
        assert_eq!(
            classify_failure(TaCommand::CreateNetwork, result::BAD_FORMAT),
            FailureHint::General
        );
        assert!(check_result(TaCommand::DumpState, result::SUCCESS).is_ok());
        assert!(matches!(
            check_result(TaCommand::StartNetwork, result::BAD_FORMAT),
            Err(NpuError::Peer { hint: FailureHint::IncompatibleHardware, .. })
        ));
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("GP".parse::<BackendSelection>().unwrap(), BackendSelection::Generic);
        assert_eq!("vendor".parse::<BackendSelection>().unwrap(), BackendSelection::Vendor);
        assert!("serial".parse::<BackendSelection>().is_err());
    }
}
