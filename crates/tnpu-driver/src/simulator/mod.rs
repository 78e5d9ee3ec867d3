//! Software platform: simulated heap, secure peer and clocks wired to a
//! [`Device`].
//!
//! Used by the integration tests and the CLI `simulate` command; no
//! accelerator or secure world is needed.
//!
//! ```no_run
//! use tnpu_driver::simulator::SimulatedPlatform;
//!
//! let platform = SimulatedPlatform::builder().build()?;
//! let session = platform.device().open_session(std::process::id())?;
//! # Ok::<(), tnpu_driver::NpuError>(())
//! ```

pub mod ta;

pub use ta::{CompletionMode, SimulatedTa, TaConfig};

use crate::channel::{select_channel, BackendSelection, RecordingPeer, SecurePeer};
use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::Result;
use crate::mem::{HeapConfig, MemoryManager, SimulatedHeap};
use crate::power::ClockDomain;
use std::sync::Arc;

/// Simulated heap, peer and clocks plus the device attached to them.
#[derive(Debug)]
pub struct SimulatedPlatform {
    heap: Arc<SimulatedHeap>,
    ta: Arc<SimulatedTa>,
    recorder: Option<Arc<RecordingPeer>>,
    clocks: Arc<ClockDomain>,
    device: Device,
}

impl SimulatedPlatform {
    /// Builder with default heap, peer and device settings.
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::default()
    }

    /// Attached device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Simulated DMA heap.
    pub fn heap(&self) -> &Arc<SimulatedHeap> {
        &self.heap
    }

    /// Simulated secure peer.
    pub fn ta(&self) -> &Arc<SimulatedTa> {
        &self.ta
    }

    /// Request recorder, if enabled with [`PlatformBuilder::record`].
    pub fn recorder(&self) -> Option<&Arc<RecordingPeer>> {
        self.recorder.as_ref()
    }

    /// Clock domain.
    pub fn clocks(&self) -> &Arc<ClockDomain> {
        &self.clocks
    }
}

/// Builder for [`SimulatedPlatform`].
#[derive(Debug, Clone, Default)]
pub struct PlatformBuilder {
    heap: HeapConfig,
    ta: TaConfig,
    device: DeviceConfig,
    record: bool,
}

impl PlatformBuilder {
    /// Builder whose device settings come from [`DeviceConfig::from_env`].
    ///
    /// # Errors
    ///
    /// Returns error if a `TNPU_*` variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Ok(Self::default().device(DeviceConfig::from_env()?))
    }

    /// Heap pool sizes.
    #[must_use]
    pub fn heap(mut self, config: HeapConfig) -> Self {
        self.heap = config;
        self
    }

    /// Secure peer identity and completion behaviour.
    #[must_use]
    pub fn ta(mut self, config: TaConfig) -> Self {
        self.ta = config;
        self
    }

    /// Device settings.
    #[must_use]
    pub fn device(mut self, config: DeviceConfig) -> Self {
        self.device = config;
        self
    }

    /// Secure channel backend.
    #[must_use]
    pub fn backend(mut self, backend: BackendSelection) -> Self {
        self.device.backend = backend;
        self
    }

    /// Record every request sent to the peer.
    #[must_use]
    pub fn record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Wire everything together and attach the device.
    ///
    /// # Errors
    ///
    /// Returns error if the device fails to attach.
    pub fn build(self) -> Result<SimulatedPlatform> {
        let heap = Arc::new(SimulatedHeap::new(self.heap));
        let ta = Arc::new(SimulatedTa::new(heap.clone(), self.ta));
        let recorder = self
            .record
            .then(|| Arc::new(RecordingPeer::new(ta.clone())));
        let peer: Arc<dyn SecurePeer> = match &recorder {
            Some(recorder) => recorder.clone(),
            None => ta.clone(),
        };
        let channel = select_channel(self.device.backend, peer);
        let clocks = Arc::new(ClockDomain::new());
        let device = Device::attach(
            self.device,
            channel,
            MemoryManager::new(heap.clone()),
            clocks.clone(),
        )?;
        ta.connect_interrupt(device.interrupt_handler());

        Ok(SimulatedPlatform {
            heap,
            ta,
            recorder,
            clocks,
            device,
        })
    }
}
