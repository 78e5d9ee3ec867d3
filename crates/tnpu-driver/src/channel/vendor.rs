//! Vendor TEEC client transport.
//!
//! Mirrors the vendor client library: a `TeecOperation` carries four
//! parameter unions whose types are packed into one word, four bits per
//! slot, and `TeecContext::invoke_command` returns the result code directly.
//! Trusted Applications must be registered with the context before a
//! session can name them.

use super::peer::{Param, Params, SecurePeer};
use super::{check_result, BackendType, Transport};
use crate::error::{NpuError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tnpu_chip::ta::{result, TaCommand, MAX_PARAMS, TA_UUID};

/// Unused slot.
pub const TEEC_NONE: u32 = 0x0;
/// Value read by the Trusted Application.
pub const TEEC_VALUE_INPUT: u32 = 0x1;
/// Value written by the Trusted Application.
pub const TEEC_VALUE_OUTPUT: u32 = 0x2;
/// Part of a registered shared memory, read by the Trusted Application.
pub const TEEC_MEMREF_PARTIAL_INPUT: u32 = 0xD;

/// Login as the calling user.
pub const TEEC_LOGIN_USER: u32 = 0x1;

/// Result originates from the client API.
pub const TEEC_ORIGIN_API: u32 = 1;
/// Result originates from the Trusted Application.
pub const TEEC_ORIGIN_TRUSTED_APP: u32 = 4;

/// Pack four parameter types into one word.
pub const fn teec_param_types(t0: u32, t1: u32, t2: u32, t3: u32) -> u32 {
    (t0 & 0xF) | ((t1 & 0xF) << 4) | ((t2 & 0xF) << 8) | ((t3 & 0xF) << 12)
}

/// Type of slot `index` in a packed word.
pub const fn teec_param_type_get(types: u32, index: usize) -> u32 {
    (types >> (index * 4)) & 0xF
}

/// Value parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeecValue {
    /// First word
    pub a: u32,
    /// Second word
    pub b: u32,
}

/// Shared memory registered with the context.
#[derive(Debug, Clone)]
pub struct TeecSharedMemory {
    /// Contents
    pub buffer: Bytes,
    /// Size in bytes
    pub size: usize,
}

/// Window into registered shared memory.
#[derive(Debug, Clone, Default)]
pub struct TeecRegisteredMemoryReference {
    /// Backing shared memory
    pub parent: Option<TeecSharedMemory>,
    /// Window size
    pub size: usize,
    /// Window offset
    pub offset: usize,
}

/// One parameter slot; which field is meaningful depends on the packed type.
#[derive(Debug, Clone, Default)]
pub struct TeecParameter {
    /// Value view
    pub value: TeecValue,
    /// Memory reference view
    pub memref: TeecRegisteredMemoryReference,
}

/// Operation block passed to open and invoke.
#[derive(Debug, Clone, Default)]
pub struct TeecOperation {
    /// Set once the operation has been started
    pub started: u32,
    /// Packed parameter types
    pub param_types: u32,
    /// Parameter slots
    pub params: [TeecParameter; MAX_PARAMS],
}

/// Open session handle.
#[derive(Debug)]
pub struct TeecSession {
    id: u32,
}

/// Client context.
#[derive(Debug)]
pub struct TeecContext {
    peer: Arc<dyn SecurePeer>,
    registered: Mutex<HashSet<[u8; 16]>>,
}

impl TeecContext {
    /// Context connected to `peer`.
    pub fn new(peer: Arc<dyn SecurePeer>) -> Self {
        Self {
            peer,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Register a Trusted Application image under `uuid`.
    ///
    /// Returns `ACCESS_CONFLICT` if it is already registered.
    pub fn register_ta(&self, uuid: &[u8; 16], image: &[u8]) -> u32 {
        tracing::debug!("registering TA image of {} bytes", image.len());
        if self.registered.lock().insert(*uuid) {
            result::SUCCESS
        } else {
            result::ACCESS_CONFLICT
        }
    }

    /// Copy `contents` into shared memory.
    pub fn allocate_shared_memory(&self, contents: Bytes) -> TeecSharedMemory {
        TeecSharedMemory {
            size: contents.len(),
            buffer: contents,
        }
    }

    fn decode(op: &TeecOperation) -> std::result::Result<Params, u32> {
        let mut out = Params::default();
        for (index, (slot, p)) in out.iter_mut().zip(&op.params).enumerate() {
            *slot = match teec_param_type_get(op.param_types, index) {
                TEEC_NONE => Param::None,
                TEEC_VALUE_INPUT => Param::ValueIn {
                    a: p.value.a,
                    b: p.value.b,
                },
                TEEC_VALUE_OUTPUT => Param::output(),
                TEEC_MEMREF_PARTIAL_INPUT => {
                    let parent = p.memref.parent.as_ref().ok_or(result::BAD_PARAMETERS)?;
                    let end = p
                        .memref
                        .offset
                        .checked_add(p.memref.size)
                        .filter(|&end| end <= parent.size)
                        .ok_or(result::BAD_PARAMETERS)?;
                    Param::MemrefIn(parent.buffer.slice(p.memref.offset..end))
                }
                _ => return Err(result::BAD_PARAMETERS),
            };
        }
        Ok(out)
    }

    fn write_back(op: &mut TeecOperation, decoded: &Params) {
        for (p, d) in op.params.iter_mut().zip(decoded) {
            if let Param::ValueOut { a, b } = *d {
                p.value = TeecValue { a, b };
            }
        }
    }

    /// Open a session on a registered Trusted Application.
    pub fn open_session(
        &self,
        uuid: &[u8; 16],
        _login: u32,
        op: &mut TeecOperation,
        origin: &mut u32,
    ) -> (u32, Option<TeecSession>) {
        if !self.registered.lock().contains(uuid) {
            *origin = TEEC_ORIGIN_API;
            return (result::ITEM_NOT_FOUND, None);
        }
        let mut decoded = match Self::decode(op) {
            Ok(d) => d,
            Err(code) => {
                *origin = TEEC_ORIGIN_API;
                return (code, None);
            }
        };
        op.started = 1;
        let outcome = match self.peer.open_session(uuid, &mut decoded) {
            Ok(id) => (result::SUCCESS, Some(TeecSession { id })),
            Err(code) => {
                *origin = TEEC_ORIGIN_TRUSTED_APP;
                (code, None)
            }
        };
        Self::write_back(op, &decoded);
        outcome
    }

    /// Invoke command `cmd`.
    pub fn invoke_command(
        &self,
        session: &TeecSession,
        cmd: u32,
        op: &mut TeecOperation,
        origin: &mut u32,
    ) -> u32 {
        let mut decoded = match Self::decode(op) {
            Ok(d) => d,
            Err(code) => {
                *origin = TEEC_ORIGIN_API;
                return code;
            }
        };
        op.started = 1;
        let code = self.peer.invoke(session.id, cmd, &mut decoded);
        *origin = TEEC_ORIGIN_TRUSTED_APP;
        Self::write_back(op, &decoded);
        code
    }

    /// Close a session.
    pub fn close_session(&self, session: TeecSession) {
        self.peer.close_session(session.id);
    }
}

/// [`Transport`] over a [`TeecContext`].
#[derive(Debug)]
pub struct VendorTransport {
    ctx: TeecContext,
    session: Mutex<Option<TeecSession>>,
}

impl VendorTransport {
    /// Transport using `ctx`.
    pub fn new(ctx: TeecContext) -> Self {
        Self {
            ctx,
            session: Mutex::new(None),
        }
    }

    fn operation(&self, params: &Params) -> TeecOperation {
        let mut op = TeecOperation::default();
        let mut types = [TEEC_NONE; MAX_PARAMS];
        for (i, p) in params.iter().enumerate() {
            match p {
                Param::None => {}
                Param::ValueIn { a, b } => {
                    types[i] = TEEC_VALUE_INPUT;
                    op.params[i].value = TeecValue { a: *a, b: *b };
                }
                Param::ValueOut { .. } => types[i] = TEEC_VALUE_OUTPUT,
                Param::MemrefIn(bytes) => {
                    types[i] = TEEC_MEMREF_PARTIAL_INPUT;
                    let shm = self.ctx.allocate_shared_memory(bytes.clone());
                    op.params[i].memref = TeecRegisteredMemoryReference {
                        size: shm.size,
                        offset: 0,
                        parent: Some(shm),
                    };
                }
            }
        }
        op.param_types = teec_param_types(types[0], types[1], types[2], types[3]);
        op
    }

    fn read_outputs(params: &mut Params, op: &TeecOperation) {
        for (p, n) in params.iter_mut().zip(&op.params) {
            if let Param::ValueOut { a, b } = p {
                *a = n.value.a;
                *b = n.value.b;
            }
        }
    }
}

impl Transport for VendorTransport {
    fn backend_type(&self) -> BackendType {
        BackendType::Vendor
    }

    fn load_ta(&self, image: &[u8]) -> Result<()> {
        match self.ctx.register_ta(&TA_UUID, image) {
            result::SUCCESS => Ok(()),
            result::ACCESS_CONFLICT => {
                tracing::debug!("TA already registered");
                Ok(())
            }
            code => {
                tracing::error!("cannot register TA: {} ({code:#010x})", result::name(code));
                Err(NpuError::SessionRefused { code })
            }
        }
    }

    fn open_session(&self, params: &mut Params) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(NpuError::invalid_state("secure session already open"));
        }
        let mut op = self.operation(params);
        let mut origin = 0;
        let (code, opened) = self
            .ctx
            .open_session(&TA_UUID, TEEC_LOGIN_USER, &mut op, &mut origin);
        let Some(opened) = opened.filter(|_| code == result::SUCCESS) else {
            tracing::error!(
                "Error while opening session Return={code:#010x} ({}) origin={origin}",
                result::name(code)
            );
            return Err(NpuError::SessionRefused { code });
        };
        Self::read_outputs(params, &op);
        tracing::info!("secure session {} open", opened.id);
        *session = Some(opened);
        Ok(())
    }

    fn invoke(&self, command: TaCommand, params: &mut Params) -> Result<()> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| NpuError::invalid_state("no secure session"))?;
        let mut op = self.operation(params);
        let mut origin = 0;
        let code = self
            .ctx
            .invoke_command(session, command.id(), &mut op, &mut origin);
        drop(guard);
        if origin == TEEC_ORIGIN_API && code != result::SUCCESS {
            return Err(NpuError::transport(format!(
                "{command} rejected by client API: {}",
                result::name(code)
            )));
        }
        check_result(command, code)?;
        Self::read_outputs(params, &op);
        Ok(())
    }

    fn close_session(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .take()
            .ok_or_else(|| NpuError::invalid_state("no secure session"))?;
        self.ctx.close_session(session);
        Ok(())
    }
}
