//! Generic TEE client transport.
//!
//! Mirrors the kernel TEE client interface: parameters are an array of
//! attribute-tagged [`TeeParam`] records, memrefs point into shared-memory
//! objects by id, and every call reports twice: an `i32` transport result
//! and the Trusted Application's `ret` code in the argument block.

use super::peer::{Param, Params, SecurePeer};
use super::{check_result, BackendType, Transport};
use crate::error::{NpuError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tnpu_chip::ta::{result, TaCommand, MAX_PARAMS, TA_UUID};

/// Unused parameter.
pub const TEE_IOCTL_PARAM_ATTR_TYPE_NONE: u64 = 0;
/// Value parameter read by the Trusted Application.
pub const TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_INPUT: u64 = 1;
/// Value parameter written by the Trusted Application.
pub const TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_OUTPUT: u64 = 2;
/// Shared memory read by the Trusted Application.
pub const TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INPUT: u64 = 5;

/// Login method for sessions opened by the kernel.
pub const TEE_IOCTL_LOGIN_REE_KERNEL: u32 = 0x8000_0000;

/// Result originates from the Trusted Application.
pub const TEEC_ORIGIN_TRUSTED_APP: u32 = 4;

/// One parameter. For memrefs `a` is the offset into the shared memory,
/// `b` the size and `c` the shared-memory id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeeParam {
    /// Attribute (parameter type)
    pub attr: u64,
    /// First word
    pub a: u64,
    /// Second word
    pub b: u64,
    /// Third word
    pub c: u64,
}

/// Invoke argument block.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvokeArg {
    /// Command id
    pub func: u32,
    /// Session id
    pub session: u32,
    /// Cancellation id
    pub cancel_id: u32,
    /// Trusted Application result code
    pub ret: u32,
    /// Where `ret` originated
    pub ret_origin: u32,
    /// Parameters in use
    pub num_params: u32,
}

/// Open-session argument block.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSessionArg {
    /// Trusted Application UUID
    pub uuid: [u8; 16],
    /// Login method
    pub clnt_login: u32,
    /// Out: session id
    pub session: u32,
    /// Trusted Application result code
    pub ret: u32,
    /// Where `ret` originated
    pub ret_origin: u32,
    /// Parameters in use
    pub num_params: u32,
}

#[derive(Debug, Default)]
struct ShmTable {
    next: u64,
    blocks: HashMap<u64, Bytes>,
}

/// Client context: owns the shared-memory objects and the peer connection.
#[derive(Debug)]
pub struct GpContext {
    peer: Arc<dyn SecurePeer>,
    shm: Mutex<ShmTable>,
}

/// Shared-memory object, freed on drop.
#[derive(Debug)]
pub struct TeeShm<'c> {
    ctx: &'c GpContext,
    id: u64,
    size: usize,
}

impl TeeShm<'_> {
    /// Shared-memory id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for TeeShm<'_> {
    fn drop(&mut self) {
        self.ctx.shm.lock().blocks.remove(&self.id);
    }
}

fn einval() -> i32 {
    -rustix::io::Errno::INVAL.raw_os_error()
}

impl GpContext {
    /// Context connected to `peer`.
    pub fn new(peer: Arc<dyn SecurePeer>) -> Self {
        Self {
            peer,
            shm: Mutex::new(ShmTable::default()),
        }
    }

    /// Allocate a shared-memory object holding `contents`.
    pub fn shm_alloc(&self, contents: Bytes) -> TeeShm<'_> {
        let mut table = self.shm.lock();
        table.next += 1;
        let id = table.next;
        let size = contents.len();
        table.blocks.insert(id, contents);
        TeeShm {
            ctx: self,
            id,
            size,
        }
    }

    /// Live shared-memory objects.
    pub fn shm_count(&self) -> usize {
        self.shm.lock().blocks.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decode(&self, params: &[TeeParam]) -> std::result::Result<Params, i32> {
        if params.len() > MAX_PARAMS {
            return Err(einval());
        }
        let table = self.shm.lock();
        let mut out = Params::default();
        for (slot, p) in out.iter_mut().zip(params) {
            *slot = match p.attr {
                TEE_IOCTL_PARAM_ATTR_TYPE_NONE => Param::None,
                TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_INPUT => Param::ValueIn {
                    a: p.a as u32,
                    b: p.b as u32,
                },
                TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_OUTPUT => Param::output(),
                TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INPUT => {
                    let block = table.blocks.get(&p.c).ok_or_else(einval)?;
                    let start = p.a as usize;
                    let end = start.checked_add(p.b as usize).ok_or_else(einval)?;
                    if end > block.len() {
                        return Err(einval());
                    }
                    Param::MemrefIn(block.slice(start..end))
                }
                _ => return Err(einval()),
            };
        }
        Ok(out)
    }

    fn write_back(params: &mut [TeeParam], decoded: &Params) {
        for (p, d) in params.iter_mut().zip(decoded) {
            if let Param::ValueOut { a, b } = *d {
                p.a = u64::from(a);
                p.b = u64::from(b);
            }
        }
    }

    /// Open a session. Returns a negative errno on transport failure.
    pub fn open_session(&self, arg: &mut OpenSessionArg, params: &mut [TeeParam]) -> i32 {
        let Some(used) = params.get(..arg.num_params as usize) else {
            return einval();
        };
        let mut decoded = match self.decode(used) {
            Ok(d) => d,
            Err(e) => return e,
        };
        match self.peer.open_session(&arg.uuid, &mut decoded) {
            Ok(session) => {
                arg.session = session;
                arg.ret = result::SUCCESS;
            }
            Err(code) => {
                arg.ret = code;
                arg.ret_origin = TEEC_ORIGIN_TRUSTED_APP;
            }
        }
        Self::write_back(params, &decoded);
        0
    }

    /// Invoke a command. Returns a negative errno on transport failure.
    pub fn invoke_func(&self, arg: &mut InvokeArg, params: &mut [TeeParam]) -> i32 {
        let Some(used) = params.get(..arg.num_params as usize) else {
            return einval();
        };
        let mut decoded = match self.decode(used) {
            Ok(d) => d,
            Err(e) => return e,
        };
        arg.ret = self.peer.invoke(arg.session, arg.func, &mut decoded);
        if arg.ret != result::SUCCESS {
            arg.ret_origin = TEEC_ORIGIN_TRUSTED_APP;
        }
        Self::write_back(params, &decoded);
        0
    }

    /// Close a session.
    pub fn close_session(&self, session: u32) -> i32 {
        self.peer.close_session(session);
        0
    }
}

/// [`Transport`] over a [`GpContext`].
#[derive(Debug)]
pub struct GpTransport {
    ctx: GpContext,
    session: Mutex<Option<u32>>,
}

impl GpTransport {
    /// Transport using `ctx`.
    pub fn new(ctx: GpContext) -> Self {
        Self {
            ctx,
            session: Mutex::new(None),
        }
    }

    /// Underlying client context.
    pub fn context(&self) -> &GpContext {
        &self.ctx
    }

    /// Native parameter array plus the shared memory it points into.
    fn marshal(&self, params: &Params) -> (Vec<TeeParam>, Vec<TeeShm<'_>>) {
        let used = params
            .iter()
            .rposition(|p| *p != Param::None)
            .map_or(0, |i| i + 1);
        let mut native = Vec::with_capacity(used);
        let mut shms = Vec::new();
        for p in &params[..used] {
            native.push(match p {
                Param::None => TeeParam::default(),
                Param::ValueIn { a, b } => TeeParam {
                    attr: TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_INPUT,
                    a: u64::from(*a),
                    b: u64::from(*b),
                    c: 0,
                },
                Param::ValueOut { .. } => TeeParam {
                    attr: TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_OUTPUT,
                    ..TeeParam::default()
                },
                Param::MemrefIn(bytes) => {
                    let shm = self.ctx.shm_alloc(bytes.clone());
                    let param = TeeParam {
                        attr: TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INPUT,
                        a: 0,
                        b: shm.size() as u64,
                        c: shm.id(),
                    };
                    shms.push(shm);
                    param
                }
            });
        }
        (native, shms)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unmarshal(params: &mut Params, native: &[TeeParam]) {
        for (p, n) in params.iter_mut().zip(native) {
            if let Param::ValueOut { a, b } = p {
                *a = n.a as u32;
                *b = n.b as u32;
            }
        }
    }
}

impl Transport for GpTransport {
    fn backend_type(&self) -> BackendType {
        BackendType::Generic
    }

    fn load_ta(&self, _image: &[u8]) -> Result<()> {
        // The supplicant loads Trusted Applications on demand.
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn open_session(&self, params: &mut Params) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(NpuError::invalid_state("secure session already open"));
        }
        let (mut native, shms) = self.marshal(params);
        let mut arg = OpenSessionArg {
            uuid: TA_UUID,
            clnt_login: TEE_IOCTL_LOGIN_REE_KERNEL,
            num_params: native.len() as u32,
            ..OpenSessionArg::default()
        };
        let rc = self.ctx.open_session(&mut arg, &mut native);
        drop(shms);
        if rc < 0 || arg.ret != result::SUCCESS {
            tracing::error!(
                "Error while opening session Error={rc} Return={:#010x} ({})",
                arg.ret,
                result::name(arg.ret)
            );
            if rc < 0 {
                return Err(NpuError::transport(format!("open session failed with {rc}")));
            }
            return Err(NpuError::SessionRefused { code: arg.ret });
        }
        Self::unmarshal(params, &native);
        *session = Some(arg.session);
        tracing::info!("secure session {} open", arg.session);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn invoke(&self, command: TaCommand, params: &mut Params) -> Result<()> {
        let session = (*self.session.lock())
            .ok_or_else(|| NpuError::invalid_state("no secure session"))?;
        let (mut native, shms) = self.marshal(params);
        let mut arg = InvokeArg {
            func: command.id(),
            session,
            num_params: native.len() as u32,
            ..InvokeArg::default()
        };
        let rc = self.ctx.invoke_func(&mut arg, &mut native);
        drop(shms);
        if rc < 0 {
            tracing::error!("{command}: transport Error={rc}");
            return Err(NpuError::transport(format!("{command} invoke failed with {rc}")));
        }
        check_result(command, arg.ret)?;
        Self::unmarshal(params, &native);
        Ok(())
    }

    fn close_session(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .take()
            .ok_or_else(|| NpuError::invalid_state("no secure session"))?;
        let rc = self.ctx.close_session(session);
        if rc < 0 {
            return Err(NpuError::transport(format!("close session failed with {rc}")));
        }
        Ok(())
    }
}
