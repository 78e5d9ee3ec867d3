//! Execution engine: one synchronous network run.
//!
//! ```text
//! Idle ──start──▶ Submitted ──┬─ status ok ──────▶ Completed
//!                             ├─ status fault ───▶ Faulted     (dump, reset)
//!                             ├─ no interrupt ───▶ TimedOut    (dump, reset)
//!                             └─ caller cancel ──▶ Interrupted (reset, sync irq)
//! ```
//!
//! Every outcome except `Completed` leaves the execution unit reset, so the
//! next run re-activates it from a known state.

use crate::channel::{ActivationMode, SecureChannel};
use crate::error::{NpuError, Result};
use crate::mem::Region;
use crate::signal::{CompletionSignal, IrqLine, WaitResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tnpu_chip::status::{classify, StatusKind, PROFILE_TIMEOUT_FACTOR};
use tnpu_chip::ta::PROFILE_RECORD_SIZE;
use tracing::{debug, error, info, warn};

/// Fault reported in the completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Interrupt raised with an empty status word
    InvalidStatus,
    /// Bus error
    BusError,
    /// Address-translation exception
    MmuException,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatus => write!(f, "invalid status"),
            Self::BusError => write!(f, "AXI bus error"),
            Self::MmuException => write!(f, "MMU exception"),
        }
    }
}

/// Terminal state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Network ran to completion
    Completed,
    /// No completion signal within the timeout
    TimedOut,
    /// Caller cancelled the wait
    Interrupted,
    /// Completion status reported a fault
    Faulted(FaultKind),
}

impl ExecutionOutcome {
    /// Classify how a wait ended.
    pub fn from_wait(result: WaitResult) -> Self {
        match result {
            WaitResult::Signalled(status) => match classify(status) {
                StatusKind::Completed => Self::Completed,
                StatusKind::Invalid => Self::Faulted(FaultKind::InvalidStatus),
                StatusKind::BusError => Self::Faulted(FaultKind::BusError),
                StatusKind::MmuException => Self::Faulted(FaultKind::MmuException),
            },
            WaitResult::TimedOut => Self::TimedOut,
            WaitResult::Cancelled => Self::Interrupted,
        }
    }
}

/// Timing of one layer from a profiling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerProfile {
    /// Layer index
    pub layer: u32,
    /// Operations executed in the layer
    pub operations: u32,
    /// Device cycles
    pub cycles: u64,
    /// Wall time in microseconds
    pub time_us: u64,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
    /// Raw completion status
    pub status: u32,
    /// Host-measured execution time in microseconds
    pub elapsed_us: u64,
    /// Per-layer timings, profiling networks only
    pub layers: Vec<LayerProfile>,
}

/// What the engine needs to know about the network it runs.
#[derive(Debug, Clone, Copy)]
pub struct RunTarget<'a> {
    /// Peer network id
    pub nid: u32,
    /// Mode the execution unit must be in
    pub mode: ActivationMode,
    /// Built in profiling mode
    pub profiling: bool,
    /// Profiling records region, if the network has one
    pub profile: Option<&'a Region>,
    /// Operations per layer, in execution order
    pub layer_operations: &'a [u32],
}

/// Device-wide execution counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Completed runs
    pub inferences: u64,
    /// Cumulative execution time of completed runs
    pub total_us: u64,
    /// Execution time of the last completed run
    pub last_us: u64,
}

#[derive(Debug, Default)]
struct Hardware {
    active: Option<ActivationMode>,
    stats: EngineStats,
}

/// Drives runs on the single execution unit.
///
/// The internal hardware lock is held for the whole of a run, so at most one
/// network executes at a time across every session.
#[derive(Debug)]
pub struct ExecutionEngine {
    channel: Arc<dyn SecureChannel>,
    signal: Arc<CompletionSignal>,
    irq: Arc<IrqLine>,
    irq_timeout: Duration,
    hw: Mutex<Hardware>,
}

impl ExecutionEngine {
    /// Engine issuing commands on `channel` and waiting on `signal`.
    pub fn new(
        channel: Arc<dyn SecureChannel>,
        signal: Arc<CompletionSignal>,
        irq: Arc<IrqLine>,
        irq_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            signal,
            irq,
            irq_timeout,
            hw: Mutex::new(Hardware::default()),
        }
    }

    /// Mode the execution unit is currently activated in.
    pub fn active_mode(&self) -> Option<ActivationMode> {
        self.hw.lock().active
    }

    /// Device-wide counters.
    pub fn stats(&self) -> EngineStats {
        self.hw.lock().stats
    }

    /// Timeout applied to a run of `target`.
    pub fn timeout_for(&self, target: &RunTarget<'_>) -> Duration {
        if target.profiling {
            self.irq_timeout * PROFILE_TIMEOUT_FACTOR
        } else {
            self.irq_timeout
        }
    }

    /// Reset the execution unit if it is active.
    pub fn reset(&self) {
        let mut hw = self.hw.lock();
        if hw.active.is_some() {
            self.deactivate(&mut hw);
        }
    }

    /// Deactivate the unit, then run `then` before any other run can start.
    pub fn quiesce(&self, then: impl FnOnce()) {
        let mut hw = self.hw.lock();
        if hw.active.is_some() {
            self.deactivate(&mut hw);
        }
        then();
    }

    fn deactivate(&self, hw: &mut Hardware) {
        if let Err(e) = self.channel.deactivate() {
            warn!("Deactivating execution unit failed: {e}");
        }
        hw.active = None;
    }

    fn ensure_active(&self, hw: &mut Hardware, mode: ActivationMode) -> Result<()> {
        match hw.active {
            Some(current) if current == mode => return Ok(()),
            Some(current) => {
                debug!("execution unit active in {current:?}, switching to {mode:?}");
                self.deactivate(hw);
            }
            None => {}
        }
        self.channel.activate(mode)?;
        hw.active = Some(mode);
        info!("Execution unit activated ({mode:?})");
        Ok(())
    }

    /// Run `target` once and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Timeout`], [`NpuError::HardwareFault`] or
    /// [`NpuError::Interrupted`] for the non-completed outcomes, or the
    /// channel error if activation or start is refused.
    pub fn run(&self, target: &RunTarget<'_>) -> Result<RunReport> {
        let mut hw = self.hw.lock();
        self.ensure_active(&mut hw, target.mode)?;

        let timeout = self.timeout_for(target);
        self.signal.arm();
        let started = Instant::now();
        if let Err(e) = self.channel.start_network(target.nid) {
            self.signal.disarm();
            return Err(e);
        }
        let waited = self.signal.wait(timeout);
        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let status = match waited {
            WaitResult::Signalled(status) => status,
            WaitResult::TimedOut | WaitResult::Cancelled => 0,
        };

        match ExecutionOutcome::from_wait(waited) {
            ExecutionOutcome::Completed => {
                let layers = match target.profile {
                    Some(region) if target.profiling => {
                        read_layer_profile(region, target.layer_operations).unwrap_or_else(|e| {
                            warn!("network {}: profiling records unreadable: {e}", target.nid);
                            Vec::new()
                        })
                    }
                    _ => Vec::new(),
                };
                hw.stats.inferences += 1;
                hw.stats.total_us = hw.stats.total_us.saturating_add(elapsed_us);
                hw.stats.last_us = elapsed_us;
                debug!("network {} completed in {elapsed_us}us", target.nid);
                Ok(RunReport {
                    status,
                    elapsed_us,
                    layers,
                })
            }
            ExecutionOutcome::Faulted(fault) => {
                error!("network {} faulted: {fault} (status {status:#010x})", target.nid);
                self.dump_and_reset(&mut hw);
                Err(NpuError::HardwareFault { fault, status })
            }
            ExecutionOutcome::TimedOut => {
                let duration_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                error!("network {} timed out after {duration_ms}ms", target.nid);
                self.dump_and_reset(&mut hw);
                Err(NpuError::Timeout { duration_ms })
            }
            ExecutionOutcome::Interrupted => {
                warn!("run of network {} interrupted", target.nid);
                self.deactivate(&mut hw);
                self.irq.synchronize();
                Err(NpuError::Interrupted)
            }
        }
    }

    fn dump_and_reset(&self, hw: &mut Hardware) {
        if let Err(e) = self.channel.dump_state() {
            warn!("State dump failed: {e}");
        }
        self.deactivate(hw);
    }
}

/// Fold per-operation profiling records into per-layer totals.
///
/// # Errors
///
/// Returns error if the region cannot hold the records.
#[allow(clippy::cast_possible_truncation)]
pub fn read_layer_profile(region: &Region, layer_operations: &[u32]) -> Result<Vec<LayerProfile>> {
    let operations: u64 = layer_operations.iter().map(|&n| u64::from(n)).sum();
    if operations == 0 {
        return Ok(Vec::new());
    }
    let mut raw = vec![0u8; operations as usize * PROFILE_RECORD_SIZE];
    region.read(0, &mut raw)?;

    let mut layers: Vec<LayerProfile> = layer_operations
        .iter()
        .enumerate()
        .map(|(layer, &ops)| LayerProfile {
            layer: layer as u32,
            operations: ops,
            ..LayerProfile::default()
        })
        .collect();
    for record in raw.chunks_exact(PROFILE_RECORD_SIZE) {
        let word = |i: usize| {
            u32::from_le_bytes([record[i], record[i + 1], record[i + 2], record[i + 3]])
        };
        if let Some(entry) = layers.get_mut(word(0) as usize) {
            entry.cycles += u64::from(word(4));
            entry.time_us += u64::from(word(8));
        }
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tnpu_chip::status::{BUS_ERROR, COMPLETED, MMU_EXCEPTION};

    #[test]
    fn outcomes_from_wait() {
        assert_eq!(
            ExecutionOutcome::from_wait(WaitResult::Signalled(COMPLETED)),
            ExecutionOutcome::Completed
        );
        assert_eq!(
            ExecutionOutcome::from_wait(WaitResult::Signalled(0)),
            ExecutionOutcome::Faulted(FaultKind::InvalidStatus)
        );
        assert_eq!(
            ExecutionOutcome::from_wait(WaitResult::Signalled(BUS_ERROR | MMU_EXCEPTION)),
            ExecutionOutcome::Faulted(FaultKind::BusError)
        );
        assert_eq!(
            ExecutionOutcome::from_wait(WaitResult::Signalled(MMU_EXCEPTION | 1)),
            ExecutionOutcome::Faulted(FaultKind::MmuException)
        );
        assert_eq!(ExecutionOutcome::from_wait(WaitResult::TimedOut), ExecutionOutcome::TimedOut);
        assert_eq!(
            ExecutionOutcome::from_wait(WaitResult::Cancelled),
            ExecutionOutcome::Interrupted
        );
    }

    #[test]
    fn profile_records_fold_per_layer() {
        use crate::mem::{MemoryKind, MemoryManager, SimulatedHeap};

        let mm = MemoryManager::new(Arc::new(SimulatedHeap::default()));
        let region = mm.allocate(MemoryKind::ProfileOperations, false, 4096).unwrap();
        let mut raw = Vec::new();
        for (layer, cycles) in [(0u32, 10u32), (1, 20), (1, 30)] {
            for word in [layer, cycles, cycles / 10, 0] {
                raw.extend_from_slice(&word.to_le_bytes());
            }
        }
        region.write(0, &raw).unwrap();

        let layers = read_layer_profile(&region, &[1, 2]).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].cycles, 10);
        assert_eq!(layers[1].operations, 2);
        assert_eq!(layers[1].cycles, 50);
        assert_eq!(layers[1].time_us, 5);
    }
}
