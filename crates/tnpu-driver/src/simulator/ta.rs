//! Software Trusted Application.
//!
//! Validates every block it is handed, keeps the peer-side view of networks,
//! IO buffers and attachments, and completes started networks from a
//! separate thread the way the execution unit raises its interrupt.

use crate::channel::peer::{Param, Params, SecurePeer};
use crate::channel::wire::{self, MemoryArea};
use crate::mem::DmaHeap;
use crate::signal::InterruptHandler;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tnpu_chip::page::{is_aligned, NPU_PAGE_SIZE};
use tnpu_chip::status::{classify, StatusKind, COMPLETED};
use tnpu_chip::ta::{result, TaCommand, PROFILE_RECORD_SIZE, SESSION_AREA_COUNT, TA_UUID};
use tnpu_models::{ModelHeader, ResourceDescriptor, ResourceSizing, SecurityType};
use tracing::{debug, info, warn};

type Reply<T = ()> = std::result::Result<T, u32>;

/// When a started network raises its completion interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Right away, with this status word
    Immediate(u32),
    /// After a delay, with this status word
    Delayed(Duration, u32),
    /// Never; the run times out
    Never,
}

/// Identity and behaviour of the simulated peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaConfig {
    /// Key set secured models must be signed for
    pub key_set: u32,
    /// Hardware revision models must target
    pub hardware_target: u16,
    /// Completion behaviour of started networks
    pub completion: CompletionMode,
    /// Cycles reported per operation of layer 0; layer `n` costs `n + 1` times that
    pub cycles_per_operation: u32,
}

impl Default for TaConfig {
    fn default() -> Self {
        Self {
            key_set: 0,
            hardware_target: 0,
            completion: CompletionMode::Immediate(COMPLETED),
            cycles_per_operation: 100,
        }
    }
}

#[derive(Debug)]
struct TaNetwork {
    header: ModelHeader,
    descriptor: ResourceDescriptor,
    profile: Vec<MemoryArea>,
    attachments: HashMap<u32, u32>,
    next_aid: u32,
    inputs: HashMap<u32, u32>,
    outputs: HashMap<u32, u32>,
}

#[derive(Debug)]
struct TaBuffer {
    areas: Vec<MemoryArea>,
    mem_id: u32,
    size: u64,
    secure: bool,
    attached: u32,
}

#[derive(Debug, Default)]
struct TaState {
    config: TaConfig,
    session: Option<u32>,
    next_session: u32,
    driver_buffers: Vec<MemoryArea>,
    active: Option<bool>,
    generation: u64,
    interrupt: u32,
    networks: HashMap<u32, TaNetwork>,
    next_nid: u32,
    buffers: HashMap<u32, TaBuffer>,
    next_bid: u32,
    next_mem_id: u32,
    injected: HashMap<TaCommand, u32>,
    starts: u64,
}

struct Inner {
    heap: Arc<dyn DmaHeap>,
    state: Mutex<TaState>,
    handler: Mutex<Option<InterruptHandler>>,
}

/// Software secure peer operating on a [`DmaHeap`].
pub struct SimulatedTa {
    inner: Arc<Inner>,
}

impl fmt::Debug for SimulatedTa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SimulatedTa")
            .field("config", &state.config)
            .field("session", &state.session)
            .field("networks", &state.networks.len())
            .field("buffers", &state.buffers.len())
            .finish_non_exhaustive()
    }
}

fn value_in(params: &Params, slot: usize) -> Reply<(u32, u32)> {
    match params[slot] {
        Param::ValueIn { a, b } => Ok((a, b)),
        _ => Err(result::BAD_PARAMETERS),
    }
}

fn memref(params: &Params, slot: usize) -> Reply<Bytes> {
    params[slot].memref().cloned().ok_or(result::BAD_PARAMETERS)
}

fn set_output(params: &mut Params, slot: usize, a: u32, b: u32) -> Reply {
    match &mut params[slot] {
        Param::ValueOut { a: out_a, b: out_b } => {
            *out_a = a;
            *out_b = b;
            Ok(())
        }
        _ => Err(result::BAD_PARAMETERS),
    }
}

fn check_areas(areas: &[MemoryArea]) -> Reply {
    if areas.iter().all(|a| a.npage > 0 && is_aligned(a.addr)) {
        Ok(())
    } else {
        Err(result::BAD_PARAMETERS)
    }
}

fn area_bytes(areas: &[MemoryArea]) -> u64 {
    areas.iter().map(|a| u64::from(a.npage) * NPU_PAGE_SIZE).sum()
}

fn profile_records(net: &TaNetwork, cycles_per_operation: u32) -> Vec<u8> {
    let operations = net.descriptor.operation_count();
    let mut out = Vec::new();
    for op in 0..operations {
        let layer = net.descriptor.layer_of_operation(op).unwrap_or_default();
        let cycles = cycles_per_operation.saturating_mul(layer + 1);
        for word in [layer, cycles, cycles / 100, 0] {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    debug_assert_eq!(out.len() as u64, operations * PROFILE_RECORD_SIZE as u64);
    out
}

impl Inner {
    #[allow(clippy::cast_possible_truncation)]
    fn read_areas(&self, areas: &[MemoryArea], offset: u64, size: u64) -> Reply<Vec<u8>> {
        let mut out = Vec::with_capacity(size as usize);
        let mut skip = offset;
        let mut remaining = size;
        for area in areas {
            if remaining == 0 {
                break;
            }
            let len = u64::from(area.npage) * NPU_PAGE_SIZE;
            if skip >= len {
                skip -= len;
                continue;
            }
            let take = (len - skip).min(remaining);
            let mut chunk = vec![0u8; take as usize];
            self.heap
                .read(area.addr + skip, &mut chunk)
                .map_err(|_| result::BAD_PARAMETERS)?;
            out.extend_from_slice(&chunk);
            remaining -= take;
            skip = 0;
        }
        if remaining > 0 {
            return Err(result::BAD_PARAMETERS);
        }
        Ok(out)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_areas(&self, areas: &[MemoryArea], data: &[u8]) -> Reply {
        let mut done = 0usize;
        for area in areas {
            if done == data.len() {
                break;
            }
            let len = (u64::from(area.npage) * NPU_PAGE_SIZE) as usize;
            let take = len.min(data.len() - done);
            self.heap
                .write(area.addr, &data[done..done + take])
                .map_err(|_| result::SHORT_BUFFER)?;
            done += take;
        }
        if done < data.len() {
            return Err(result::SHORT_BUFFER);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, state: &mut TaState, command: TaCommand, params: &mut Params) -> Reply {
        match command {
            TaCommand::ActivateNpu => {
                let (secure, _) = value_in(params, 0)?;
                state.active = Some(secure != 0);
                Ok(())
            }
            TaCommand::DeactivateNpu => {
                state.active = None;
                state.generation += 1;
                state.interrupt = 0;
                Ok(())
            }
            TaCommand::CreateNetwork => self.create_network(state, params),
            TaCommand::DestroyNetwork => {
                let (nid, _) = value_in(params, 0)?;
                let net = state.networks.remove(&nid).ok_or(result::ITEM_NOT_FOUND)?;
                for bid in net.attachments.values() {
                    if let Some(buffer) = state.buffers.get_mut(bid) {
                        buffer.attached = buffer.attached.saturating_sub(1);
                    }
                }
                Ok(())
            }
            TaCommand::StartNetwork => self.start_network(state, params),
            TaCommand::ReadInterruptRegister => {
                set_output(params, 0, state.interrupt, 0)?;
                state.interrupt = 0;
                Ok(())
            }
            TaCommand::DumpState => {
                info!(
                    "TA state: active={:?} networks={} buffers={} starts={} irq={:#010x}",
                    state.active,
                    state.networks.len(),
                    state.buffers.len(),
                    state.starts,
                    state.interrupt
                );
                Ok(())
            }
            TaCommand::CreateIoBufferFromSg => {
                let areas = wire::decode_areas(&memref(params, 0)?).ok_or(result::BAD_PARAMETERS)?;
                let (secure, count) = value_in(params, 1)?;
                if areas.is_empty() || count as usize != areas.len() {
                    return Err(result::BAD_PARAMETERS);
                }
                check_areas(&areas)?;
                let bid = state.next_bid + 1;
                let mem_id = state.next_mem_id + 1;
                set_output(params, 2, bid, mem_id)?;
                state.next_bid = bid;
                state.next_mem_id = mem_id;
                state.buffers.insert(
                    bid,
                    TaBuffer {
                        size: area_bytes(&areas),
                        areas,
                        mem_id,
                        secure: secure != 0,
                        attached: 0,
                    },
                );
                Ok(())
            }
            TaCommand::CreateIoBufferFromMemId => {
                let (mem_id, _) = value_in(params, 0)?;
                let (offset, size) = value_in(params, 1)?;
                let source = state
                    .buffers
                    .values()
                    .find(|b| b.mem_id == mem_id)
                    .ok_or(result::ITEM_NOT_FOUND)?;
                if size == 0 || u64::from(offset) + u64::from(size) > source.size {
                    return Err(result::BAD_PARAMETERS);
                }
                let shared = TaBuffer {
                    areas: source.areas.clone(),
                    mem_id,
                    size: u64::from(size),
                    secure: source.secure,
                    attached: 0,
                };
                let bid = state.next_bid + 1;
                set_output(params, 2, bid, 0)?;
                state.next_bid = bid;
                state.buffers.insert(bid, shared);
                Ok(())
            }
            TaCommand::DestroyIoBuffer => {
                let (bid, _) = value_in(params, 0)?;
                let buffer = state.buffers.get(&bid).ok_or(result::ITEM_NOT_FOUND)?;
                if buffer.attached > 0 {
                    return Err(result::BAD_STATE);
                }
                state.buffers.remove(&bid);
                Ok(())
            }
            TaCommand::AttachIoBuffer => {
                let (bid, nid) = value_in(params, 0)?;
                let TaState {
                    networks, buffers, ..
                } = state;
                let buffer = buffers.get_mut(&bid).ok_or(result::ITEM_NOT_FOUND)?;
                let net = networks.get_mut(&nid).ok_or(result::ITEM_NOT_FOUND)?;
                let aid = net.next_aid + 1;
                set_output(params, 1, aid, 0)?;
                net.next_aid = aid;
                net.attachments.insert(aid, bid);
                buffer.attached += 1;
                Ok(())
            }
            TaCommand::DetachIoBuffer => {
                let (nid, aid) = value_in(params, 0)?;
                let net = state.networks.get_mut(&nid).ok_or(result::ITEM_NOT_FOUND)?;
                let bid = net.attachments.remove(&aid).ok_or(result::ITEM_NOT_FOUND)?;
                net.inputs.retain(|_, a| *a != aid);
                net.outputs.retain(|_, a| *a != aid);
                if let Some(buffer) = state.buffers.get_mut(&bid) {
                    buffer.attached = buffer.attached.saturating_sub(1);
                }
                Ok(())
            }
            TaCommand::SetInput | TaCommand::SetOutput => {
                let (nid, aid) = value_in(params, 0)?;
                let (index, _) = value_in(params, 1)?;
                let net = state.networks.get_mut(&nid).ok_or(result::ITEM_NOT_FOUND)?;
                if !net.attachments.contains_key(&aid) {
                    return Err(result::ITEM_NOT_FOUND);
                }
                let slots = if command == TaCommand::SetInput {
                    &mut net.inputs
                } else {
                    &mut net.outputs
                };
                slots.insert(index, aid);
                Ok(())
            }
        }
    }

    fn create_network(&self, state: &mut TaState, params: &mut Params) -> Reply {
        let header_ub =
            wire::decode_user_buffer(&memref(params, 0)?).ok_or(result::BAD_PARAMETERS)?;
        let payload_ub =
            wire::decode_user_buffer(&memref(params, 1)?).ok_or(result::BAD_PARAMETERS)?;
        let resources =
            wire::decode_network_resources(&memref(params, 2)?).ok_or(result::BAD_PARAMETERS)?;

        check_areas(&header_ub.areas)?;
        check_areas(&payload_ub.areas)?;
        for group in [
            &resources.code,
            &resources.page_table,
            &resources.pool,
            &resources.profile,
        ] {
            check_areas(group)?;
        }
        if resources.code.is_empty() || resources.page_table.is_empty() || payload_ub.size == 0 {
            return Err(result::BAD_PARAMETERS);
        }

        let public = self.read_areas(
            &header_ub.areas,
            u64::from(header_ub.offset),
            u64::from(header_ub.size),
        )?;
        let header = ModelHeader::parse(&public).map_err(|e| {
            warn!("TA: rejecting model header: {e}");
            result::BAD_FORMAT
        })?;
        let descriptor = ResourceDescriptor::from_public_data(&public).map_err(|e| {
            warn!("TA: rejecting model metadata: {e}");
            result::BAD_FORMAT
        })?;
        if header.security != SecurityType::Plain && header.key_set != state.config.key_set {
            warn!(
                "TA: model key set {} does not match {}",
                header.key_set, state.config.key_set
            );
            return Err(result::SECURITY);
        }
        if u64::from(payload_ub.size) < u64::from(header.code_length) {
            return Err(result::BAD_PARAMETERS);
        }

        let sizing = ResourceSizing::plan(&header, &descriptor);
        if area_bytes(&resources.code) < sizing.code_size
            || area_bytes(&resources.page_table) < sizing.page_table_size
            || area_bytes(&resources.pool) < sizing.pool_size
            || area_bytes(&resources.profile) < sizing.profile_size
            || (sizing.profile_size > 0) == resources.profile.is_empty()
        {
            return Err(result::BAD_PARAMETERS);
        }

        let nid = state.next_nid + 1;
        set_output(params, 3, nid, 0)?;
        state.next_nid = nid;
        state.networks.insert(
            nid,
            TaNetwork {
                header,
                descriptor,
                profile: resources.profile,
                attachments: HashMap::new(),
                next_aid: 0,
                inputs: HashMap::new(),
                outputs: HashMap::new(),
            },
        );
        debug!("TA: network {nid} created");
        Ok(())
    }

    fn start_network(self: &Arc<Self>, state: &mut TaState, params: &Params) -> Reply {
        let (nid, _) = value_in(params, 0)?;
        let net = state.networks.get(&nid).ok_or(result::ITEM_NOT_FOUND)?;
        let secure_mode = state.active.ok_or(result::BAD_STATE)?;
        if net.header.is_secure() && !secure_mode {
            return Err(result::ACCESS_DENIED);
        }
        if net.header.hardware_target != state.config.hardware_target {
            warn!(
                "TA: network {nid} targets hardware {}, this is {}",
                net.header.hardware_target, state.config.hardware_target
            );
            return Err(result::BAD_FORMAT);
        }
        state.starts += 1;

        let (delay, status) = match state.config.completion {
            CompletionMode::Immediate(status) => (Duration::ZERO, status),
            CompletionMode::Delayed(delay, status) => (delay, status),
            CompletionMode::Never => return Ok(()),
        };
        let generation = state.generation;
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name("tnpu-sim-irq".into())
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                inner.complete(generation, nid, status);
            })
            .map(drop)
            .map_err(|e| {
                warn!("TA: cannot spawn completion thread: {e}");
                result::OUT_OF_MEMORY
            })
    }

    fn complete(&self, generation: u64, nid: u32, status: u32) {
        let handler = {
            let mut state = self.state.lock();
            if state.generation != generation || state.active.is_none() {
                debug!("TA: dropping completion of network {nid} after reset");
                return;
            }
            if classify(status) == StatusKind::Completed {
                if let Some(net) = state.networks.get(&nid) {
                    if !net.profile.is_empty() {
                        let records = profile_records(net, state.config.cycles_per_operation);
                        if let Err(code) = self.write_areas(&net.profile, &records) {
                            warn!("TA: profile records lost: {}", result::name(code));
                        }
                    }
                }
            }
            state.interrupt = status;
            self.handler.lock().clone()
        };
        match handler {
            Some(handler) => handler(),
            None => debug!("TA: interrupt raised with no handler connected"),
        }
    }
}

impl SimulatedTa {
    /// Peer operating on `heap`.
    pub fn new(heap: Arc<dyn DmaHeap>, config: TaConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                heap,
                state: Mutex::new(TaState {
                    config,
                    ..TaState::default()
                }),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Route completion interrupts to `handler`.
    pub fn connect_interrupt(&self, handler: InterruptHandler) {
        *self.inner.handler.lock() = Some(handler);
    }

    /// Fail the next `command` with `code` without executing it.
    pub fn fail_next(&self, command: TaCommand, code: u32) {
        self.inner.state.lock().injected.insert(command, code);
    }

    /// Change how later starts complete.
    pub fn set_completion(&self, completion: CompletionMode) {
        self.inner.state.lock().config.completion = completion;
    }

    /// Current configuration.
    pub fn config(&self) -> TaConfig {
        self.inner.state.lock().config
    }

    /// A session is open.
    pub fn has_session(&self) -> bool {
        self.inner.state.lock().session.is_some()
    }

    /// Execution unit mode: `Some(true)` secure, `Some(false)` non-secure.
    pub fn active(&self) -> Option<bool> {
        self.inner.state.lock().active
    }

    /// Networks known to the peer.
    pub fn network_count(&self) -> usize {
        self.inner.state.lock().networks.len()
    }

    /// IO buffers known to the peer.
    pub fn buffer_count(&self) -> usize {
        self.inner.state.lock().buffers.len()
    }

    /// Attachments across all networks.
    pub fn attachment_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .networks
            .values()
            .map(|n| n.attachments.len())
            .sum()
    }

    /// Networks started so far.
    pub fn starts(&self) -> u64 {
        self.inner.state.lock().starts
    }
}

impl SecurePeer for SimulatedTa {
    fn open_session(&self, uuid: &[u8; 16], params: &mut Params) -> Reply<u32> {
        if uuid != &TA_UUID {
            return Err(result::ITEM_NOT_FOUND);
        }
        let areas = wire::decode_areas(&memref(params, 0)?).ok_or(result::BAD_PARAMETERS)?;
        if areas.len() != SESSION_AREA_COUNT {
            return Err(result::BAD_PARAMETERS);
        }
        check_areas(&areas)?;
        let mut state = self.inner.state.lock();
        if state.session.is_some() {
            return Err(result::BUSY);
        }
        state.next_session += 1;
        let session = state.next_session;
        state.session = Some(session);
        state.driver_buffers = areas;
        info!("TA: session {session} open");
        Ok(session)
    }

    fn invoke(&self, session: u32, func: u32, params: &mut Params) -> u32 {
        let Some(command) = TaCommand::from_id(func) else {
            return result::NOT_SUPPORTED;
        };
        let mut state = self.inner.state.lock();
        if state.session != Some(session) {
            return result::BAD_STATE;
        }
        if let Some(code) = state.injected.remove(&command) {
            debug!("TA: injected {} for {command}", result::name(code));
            return code;
        }
        match self.inner.dispatch(&mut state, command, params) {
            Ok(()) => result::SUCCESS,
            Err(code) => {
                debug!("TA: {command} -> {}", result::name(code));
                code
            }
        }
    }

    fn close_session(&self, session: u32) {
        let mut state = self.inner.state.lock();
        if state.session != Some(session) {
            return;
        }
        let config = state.config;
        let next_session = state.next_session;
        *state = TaState {
            config,
            next_session,
            generation: state.generation + 1,
            ..TaState::default()
        };
        info!("TA: session {session} closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{HeapConfig, MemoryKind, MemoryManager, SimulatedHeap};

    fn setup() -> (MemoryManager, SimulatedTa, u32) {
        let heap = Arc::new(SimulatedHeap::new(HeapConfig::default()));
        let mm = MemoryManager::new(heap.clone());
        let ta = SimulatedTa::new(heap, TaConfig::default());
        let ns = mm.allocate(MemoryKind::DriverBuffer, false, 4096).unwrap();
        let sec = mm.allocate(MemoryKind::DriverBuffer, true, 4096).unwrap();
        let mut params = [
            Param::MemrefIn(wire::session_block(&ns, &sec).unwrap()),
            Param::None,
            Param::None,
            Param::None,
        ];
        let session = ta.open_session(&TA_UUID, &mut params).unwrap();
        (mm, ta, session)
    }

    #[test]
    fn session_requires_known_uuid_and_two_areas() {
        let heap = Arc::new(SimulatedHeap::default());
        let ta = SimulatedTa::new(heap, TaConfig::default());
        let mut params = Params::default();
        assert_eq!(ta.open_session(&[0; 16], &mut params), Err(result::ITEM_NOT_FOUND));
        assert_eq!(ta.open_session(&TA_UUID, &mut params), Err(result::BAD_PARAMETERS));
        assert!(!ta.has_session());
    }

    #[test]
    fn start_requires_active_unit() {
        let (_mm, ta, session) = setup();
        let mut params = [Param::ValueIn { a: 1, b: 0 }, Param::None, Param::None, Param::None];
        assert_eq!(
            ta.invoke(session, TaCommand::StartNetwork.id(), &mut params),
            result::ITEM_NOT_FOUND
        );
        assert_eq!(ta.invoke(session + 1, TaCommand::DumpState.id(), &mut params), result::BAD_STATE);
        assert_eq!(ta.invoke(session, 99, &mut params), result::NOT_SUPPORTED);
    }

    #[test]
    fn io_buffers_share_by_mem_id() {
        let (mm, ta, session) = setup();
        let region = mm.allocate(MemoryKind::IoBuffer, false, 8192).unwrap();
        let (block, count) = wire::io_buffer_block(&region).unwrap();
        let mut params = [
            Param::MemrefIn(block),
            Param::ValueIn { a: 0, b: count },
            Param::output(),
            Param::None,
        ];
        assert_eq!(
            ta.invoke(session, TaCommand::CreateIoBufferFromSg.id(), &mut params),
            result::SUCCESS
        );
        let (bid, mem_id) = params[2].values().unwrap();
        assert_eq!(bid, 1);

        let mut params = [
            Param::ValueIn { a: mem_id, b: 0 },
            Param::ValueIn { a: 4096, b: 8192 },
            Param::output(),
            Param::None,
        ];
        assert_eq!(
            ta.invoke(session, TaCommand::CreateIoBufferFromMemId.id(), &mut params),
            result::BAD_PARAMETERS
        );
        params[1] = Param::ValueIn { a: 4096, b: 4096 };
        assert_eq!(
            ta.invoke(session, TaCommand::CreateIoBufferFromMemId.id(), &mut params),
            result::SUCCESS
        );
        assert_eq!(ta.buffer_count(), 2);
    }

    #[test]
    fn injected_failure_applies_once() {
        let (_mm, ta, session) = setup();
        ta.fail_next(TaCommand::DumpState, result::BUSY);
        let mut params = Params::default();
        assert_eq!(ta.invoke(session, TaCommand::DumpState.id(), &mut params), result::BUSY);
        assert_eq!(ta.invoke(session, TaCommand::DumpState.id(), &mut params), result::SUCCESS);
    }
}
