//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use std::time::Duration;
use tnpu_driver::simulator::{PlatformBuilder, SimulatedPlatform, TaConfig};
use tnpu_driver::{BackendSelection, DeviceConfig};
use tnpu_models::ModelBuilder;

/// Both secure channel backends, in the order every scenario runs them.
pub const BACKENDS: [BackendSelection; 2] = [BackendSelection::Generic, BackendSelection::Vendor];

/// Completion timeout short enough for timeout scenarios.
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(50);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn builder(backend: BackendSelection) -> PlatformBuilder {
    init_tracing();
    SimulatedPlatform::builder().backend(backend)
}

pub fn platform(backend: BackendSelection) -> SimulatedPlatform {
    builder(backend).build().expect("platform attaches")
}

pub fn platform_with(backend: BackendSelection, ta: TaConfig, irq_timeout: Duration) -> SimulatedPlatform {
    builder(backend)
        .ta(ta)
        .device(DeviceConfig {
            irq_timeout,
            backend,
            ..DeviceConfig::default()
        })
        .build()
        .expect("platform attaches")
}

/// 4 KiB of code and a 64 KiB page table.
pub fn small_model() -> Bytes {
    ModelBuilder::new()
        .code(vec![0xA5; 4096])
        .page_table_pages(16)
        .build()
}
