//! Control plane for the trusted NPU.
//!
//! Sits between untrusted client sessions and a Trusted Application running
//! in the secure world. It owns device memory, speaks the Trusted
//! Application's command protocol over one of two client backends, keeps the
//! per-session handle tables, and runs networks one at a time on the single
//! execution unit.
//!
//! # Layers
//!
//! ```text
//! control ──▶ Session ──▶ Network / IoBuffer / Attachment
//!                │               │
//!                ▼               ▼
//!             Device ──▶ ExecutionEngine ──▶ SecureChannel ──▶ SecurePeer
//!                │                                 │
//!                ▼                                 ▼
//!           PowerControl                    MemoryManager ──▶ DmaHeap
//! ```
//!
//! Production ports implement [`SecurePeer`](channel::SecurePeer),
//! [`DmaHeap`](mem::DmaHeap) and [`PowerControl`]. The [`simulator`] module
//! provides software versions of all three.
//!
//! # Quick start
//!
//! ```no_run
//! use tnpu_driver::simulator::SimulatedPlatform;
//! use tnpu_models::ModelBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let platform = SimulatedPlatform::builder().build()?;
//! let session = platform.device().open_session(std::process::id())?;
//!
//! let nid = session.create_network(&ModelBuilder::new().build())?;
//! let input = session.create_io_buffer(256)?;
//! let aid = session.attach_io_buffer(nid, input.bid)?;
//! session.set_input(nid, aid, 0)?;
//!
//! let report = session.run_network(nid)?;
//! println!("status {:#x} in {}us", report.status, report.elapsed_us);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod buffer;
pub mod channel;
mod config;
pub mod control;
mod device;
mod engine;
mod error;
mod handle;
pub mod mem;
mod network;
mod power;
mod session;
mod signal;
pub mod simulator;

pub use buffer::{BufferOrigin, IoBuffer};
pub use channel::{
    select_channel, ActivationMode, BackendSelection, BackendType, FailureHint, SecureChannel,
};
pub use config::{DeviceConfig, ENV_BACKEND, ENV_IRQ_TIMEOUT_MS, ENV_MAX_HANDLES};
pub use control::{dispatch, status_code, ControlRequest};
pub use device::{Device, DeviceSnapshot};
pub use engine::{
    read_layer_profile, EngineStats, ExecutionEngine, ExecutionOutcome, FaultKind, LayerProfile,
    RunReport, RunTarget,
};
pub use error::{ErrorClass, NpuError, Result};
pub use handle::{HandleKey, HandleTable, MAX_HANDLE};
pub use network::{Attachment, Network, NetworkStats, SlotRole};
pub use power::{ClockDomain, PowerControl};
pub use session::{CreatedBuffer, Session, SessionId, SessionSnapshot};
pub use signal::{CompletionSignal, InterruptHandler, IrqLine, RunInterrupter, WaitResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BackendSelection, CreatedBuffer, Device, DeviceConfig, ExecutionOutcome, NpuError,
        NetworkStats, Result, RunReport, Session,
    };
    pub use crate::simulator::{PlatformBuilder, SimulatedPlatform};
}
