//! `TNPU_*` environment settings reach an attached device.
//!
//! Kept in its own test binary: it mutates the process environment.

mod common;

use common::{init_tracing, small_model};
use std::time::Duration;
use tnpu_driver::simulator::{CompletionMode, PlatformBuilder, TaConfig};
use tnpu_driver::{BackendType, NpuError, ENV_BACKEND, ENV_IRQ_TIMEOUT_MS, ENV_MAX_HANDLES};

#[test]
fn environment_overrides_device_settings() {
    init_tracing();
    std::env::set_var(ENV_IRQ_TIMEOUT_MS, "30");
    std::env::set_var(ENV_MAX_HANDLES, "2");
    std::env::set_var(ENV_BACKEND, "vendor");

    let platform = PlatformBuilder::from_env()
        .unwrap()
        .ta(TaConfig {
            completion: CompletionMode::Never,
            ..TaConfig::default()
        })
        .build()
        .unwrap();
    let device = platform.device();
    assert_eq!(device.config().irq_timeout, Duration::from_millis(30));
    assert_eq!(device.channel().backend_type(), BackendType::Vendor);

    let session = device.open_session(1).unwrap();
    let nid = session.create_network(&small_model()).unwrap();
    assert!(matches!(
        session.run_network(nid),
        Err(NpuError::Timeout { duration_ms: 30 })
    ));

    session.create_network(&small_model()).unwrap();
    assert!(matches!(
        session.create_network(&small_model()),
        Err(NpuError::HandleExhausted { kind: "network" })
    ));

    std::env::set_var(ENV_MAX_HANDLES, "lots");
    assert!(PlatformBuilder::from_env().is_err());

    for name in [ENV_IRQ_TIMEOUT_MS, ENV_MAX_HANDLES, ENV_BACKEND] {
        std::env::remove_var(name);
    }
}
