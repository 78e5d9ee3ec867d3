//! End-to-end scenarios against the simulated platform.
//!
//! Every scenario that talks to the secure peer runs once per channel
//! backend.

mod common;

use common::{platform, platform_with, small_model, BACKENDS, SHORT_TIMEOUT};
use std::thread;
use std::time::Duration;
use tnpu_chip::status::{BUS_ERROR, COMPLETED, MMU_EXCEPTION};
use tnpu_chip::ta::TaCommand;
use tnpu_driver::mem::{DmaHeap, HeapConfig};
use tnpu_driver::simulator::{CompletionMode, TaConfig};
use tnpu_driver::{ActivationMode, FailureHint, FaultKind, NpuError};
use tnpu_models::{ModelBuilder, SecurityType};

#[test]
fn create_attach_run_destroy() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let session = platform.device().open_session(100).unwrap();

        let nid = session.create_network(&small_model()).unwrap();
        assert_eq!(nid, 1);
        let input = session.create_io_buffer(256).unwrap();
        let output = session.create_io_buffer(256).unwrap();
        assert!(input.fd.is_some());

        let in_aid = session.attach_io_buffer(nid, input.bid).unwrap();
        let out_aid = session.attach_io_buffer(nid, output.bid).unwrap();
        assert_eq!((in_aid, out_aid), (1, 2), "{backend:?}");
        session.set_input(nid, in_aid, 0).unwrap();
        session.set_output(nid, out_aid, 0).unwrap();
        assert_eq!(session.buffer_ref_count(input.bid).unwrap(), 1);

        let report = session.run_network(nid).unwrap();
        assert_eq!(report.status, COMPLETED);
        let stats = session.network_stats(nid).unwrap();
        assert_eq!(stats.inferences, 1);
        assert_eq!(stats.io_buffer_count, 2);
        assert_eq!(stats.io_buffer_bytes, 512);
        assert_eq!(platform.device().stats().inferences, 1);

        session.destroy_network(nid).unwrap();
        assert_eq!(session.buffer_ref_count(input.bid).unwrap(), 0);
        assert_eq!(session.buffer_ref_count(output.bid).unwrap(), 0);
        session.destroy_io_buffer(input.bid).unwrap();
        session.destroy_io_buffer(output.bid).unwrap();
        assert_eq!(platform.ta().network_count(), 0);
        assert_eq!(platform.ta().buffer_count(), 0);
    }
}

#[test]
fn attached_buffer_cannot_be_destroyed() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let session = platform.device().open_session(1).unwrap();
        let nid = session.create_network(&small_model()).unwrap();
        let buffer = session.create_io_buffer(4096).unwrap();
        let aid = session.attach_io_buffer(nid, buffer.bid).unwrap();

        assert!(matches!(
            session.destroy_io_buffer(buffer.bid),
            Err(NpuError::BufferInUse { ref_count: 1, .. })
        ));
        session.detach_io_buffer(nid, aid).unwrap();
        session.destroy_io_buffer(buffer.bid).unwrap();
        assert!(session.attachments(nid).unwrap().is_empty());
    }
}

#[test]
fn unknown_handles_are_not_found() {
    let platform = platform(BACKENDS[0]);
    let session = platform.device().open_session(1).unwrap();
    assert!(matches!(
        session.run_network(9),
        Err(NpuError::NotFound { kind: "network", handle: 9 })
    ));
    assert!(matches!(
        session.destroy_io_buffer(3),
        Err(NpuError::NotFound { kind: "io buffer", .. })
    ));
    let nid = session.create_network(&small_model()).unwrap();
    assert!(matches!(
        session.set_input(nid, 4, 0),
        Err(NpuError::NotFound { kind: "attachment", handle: 4 })
    ));
    assert!(session.attach_io_buffer(nid, 0).is_err());
}

#[test]
fn handles_reuse_smallest_free() {
    let platform = platform(BACKENDS[1]);
    let session = platform.device().open_session(1).unwrap();
    let bids: Vec<u32> = (0..3)
        .map(|_| session.create_io_buffer(128).unwrap().bid)
        .collect();
    assert_eq!(bids, vec![1, 2, 3]);
    session.destroy_io_buffer(2).unwrap();
    assert_eq!(session.create_io_buffer(128).unwrap().bid, 2);
    assert_eq!(session.create_io_buffer(128).unwrap().bid, 4);
}

#[test]
fn truncated_upload_is_rejected_before_allocation() {
    let platform = platform(BACKENDS[0]);
    let session = platform.device().open_session(1).unwrap();
    let used = platform.heap().used();
    let image = small_model();

    let err = session.create_network(&image[..image.len() - 1]).unwrap_err();
    assert!(matches!(err, NpuError::Model(_)));
    assert!(session.create_network(&image[..10]).is_err());
    assert_eq!(platform.heap().used(), used);
    assert!(session.networks().is_empty());
}

#[test]
fn pool_exhaustion_unwinds_everything() {
    for backend in BACKENDS {
        let platform = common::builder(backend)
            .heap(HeapConfig {
                scatter_capacity: 8 * 4096,
                ..HeapConfig::default()
            })
            .build()
            .unwrap();
        let session = platform.device().open_session(1).unwrap();
        let used = platform.heap().used();

        let model = ModelBuilder::new()
            .code(vec![1; 4096])
            .pool(64 * 1024)
            .build();
        assert!(matches!(
            session.create_network(&model),
            Err(NpuError::OutOfMemory { .. })
        ));
        assert_eq!(platform.heap().used(), used);
        assert_eq!(platform.ta().network_count(), 0);

        // The failed handle went back to the table.
        assert_eq!(session.create_network(&small_model()).unwrap(), 1);
    }
}

#[test]
fn key_set_mismatch_is_reported() {
    for backend in BACKENDS {
        let ta = TaConfig {
            key_set: 7,
            ..TaConfig::default()
        };
        let platform = platform_with(backend, ta, SHORT_TIMEOUT);
        let session = platform.device().open_session(1).unwrap();
        let used = platform.heap().used();

        let model = ModelBuilder::new()
            .security(SecurityType::Signed, 3)
            .build();
        let err = session.create_network(&model).unwrap_err();
        assert!(matches!(
            err,
            NpuError::Peer {
                command: TaCommand::CreateNetwork,
                hint: FailureHint::KeyMismatch,
                ..
            }
        ));
        assert_eq!(platform.heap().used(), used);

        let signed = ModelBuilder::new().security(SecurityType::Signed, 7).build();
        assert!(session.create_network(&signed).is_ok());
    }
}

#[test]
fn incompatible_hardware_fails_start() {
    for backend in BACKENDS {
        let ta = TaConfig {
            hardware_target: 2,
            ..TaConfig::default()
        };
        let platform = platform_with(backend, ta, SHORT_TIMEOUT);
        let session = platform.device().open_session(1).unwrap();
        let nid = session
            .create_network(&ModelBuilder::new().hardware_target(1).build())
            .unwrap();

        let err = session.run_network(nid).unwrap_err();
        assert!(matches!(
            err,
            NpuError::Peer {
                command: TaCommand::StartNetwork,
                hint: FailureHint::IncompatibleHardware,
                ..
            }
        ));
        assert_eq!(session.network_stats(nid).unwrap().inferences, 0);
        assert_eq!(platform.ta().starts(), 0);
    }
}

#[test]
fn timeout_resets_then_next_run_succeeds() {
    for backend in BACKENDS {
        let ta = TaConfig {
            completion: CompletionMode::Never,
            ..TaConfig::default()
        };
        let platform = platform_with(backend, ta, SHORT_TIMEOUT);
        let session = platform.device().open_session(1).unwrap();
        let nid = session.create_network(&small_model()).unwrap();

        assert!(matches!(
            session.run_network(nid),
            Err(NpuError::Timeout { duration_ms: 50 })
        ));
        assert_eq!(platform.device().active_mode(), None);
        assert_eq!(platform.ta().active(), None);

        platform
            .ta()
            .set_completion(CompletionMode::Delayed(Duration::from_millis(5), COMPLETED));
        session.run_network(nid).unwrap();
        assert_eq!(session.network_stats(nid).unwrap().inferences, 1);
        assert_eq!(platform.device().active_mode(), Some(ActivationMode::NonSecure));
    }
}

#[test]
fn fault_status_is_classified() {
    let cases = [
        (0, FaultKind::InvalidStatus),
        (BUS_ERROR, FaultKind::BusError),
        (MMU_EXCEPTION | COMPLETED, FaultKind::MmuException),
    ];
    for backend in BACKENDS {
        let platform = platform_with(backend, TaConfig::default(), Duration::from_secs(5));
        let session = platform.device().open_session(1).unwrap();
        let nid = session.create_network(&small_model()).unwrap();

        for (status, expected) in cases {
            platform.ta().set_completion(CompletionMode::Immediate(status));
            match session.run_network(nid) {
                Err(NpuError::HardwareFault { fault, status: got }) => {
                    assert_eq!(fault, expected);
                    assert_eq!(got, status);
                }
                other => panic!("{backend:?} status {status:#x}: {other:?}"),
            }
            assert_eq!(platform.device().active_mode(), None);
        }
        assert_eq!(session.network_stats(nid).unwrap().inferences, 0);
    }
}

#[test]
fn cancellation_interrupts_the_wait() {
    for backend in BACKENDS {
        let ta = TaConfig {
            completion: CompletionMode::Never,
            ..TaConfig::default()
        };
        let platform = platform_with(backend, ta, Duration::from_secs(30));
        let session = platform.device().open_session(1).unwrap();
        let nid = session.create_network(&small_model()).unwrap();

        let interrupter = platform.device().run_interrupter();
        let canceller = thread::spawn(move || {
            while !interrupter.interrupt() {
                thread::sleep(Duration::from_millis(1));
            }
        });
        let outcome = session.run_network(nid).map(|_| ());
        canceller.join().unwrap();

        assert!(matches!(outcome, Err(NpuError::Interrupted)));
        assert_eq!(tnpu_driver::status_code(&outcome), -4);
        assert_eq!(platform.device().active_mode(), None);
    }
}

#[test]
fn profiling_reports_layers() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let session = platform.device().open_session(1).unwrap();
        let model = ModelBuilder::new().profiling(vec![2, 3]).build();
        let nid = session.create_network(&model).unwrap();

        let report = session.run_network(nid).unwrap();
        assert_eq!(report.layers.len(), 2);
        assert_eq!(report.layers[0].operations, 2);
        assert_eq!(report.layers[0].cycles, 200);
        assert_eq!(report.layers[1].cycles, 3 * 200);
        assert_eq!(session.last_profile(nid).unwrap(), report.layers);
    }
}

#[test]
fn activation_follows_network_security() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let session = platform.device().open_session(1).unwrap();
        let secure = session
            .create_network(&ModelBuilder::new().security(SecurityType::Secure, 0).build())
            .unwrap();
        let plain = session.create_network(&small_model()).unwrap();
        assert_eq!(platform.device().active_mode(), None);

        session.run_network(secure).unwrap();
        assert_eq!(platform.device().active_mode(), Some(ActivationMode::Secure));
        session.run_network(plain).unwrap();
        assert_eq!(platform.device().active_mode(), Some(ActivationMode::NonSecure));
        assert_eq!(platform.device().stats().inferences, 2);
    }
}

#[test]
fn buffers_share_memory_by_id_across_sessions() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let owner = platform.device().open_session(1).unwrap();
        let other = platform.device().open_session(2).unwrap();

        let created = owner.create_io_buffer(8192).unwrap();
        let bid = other
            .create_io_buffer_from_mem_id(created.mem_id, 4096, 4096)
            .unwrap();
        assert_eq!(bid, 1);
        assert!(other
            .create_io_buffer_from_mem_id(created.mem_id, 4096, 8192)
            .is_err());
        assert!(other.create_io_buffer_from_mem_id(created.mem_id, 0, 0).is_err());
    }
}

#[test]
fn external_memory_is_wrapped() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let session = platform.device().open_session(1).unwrap();
        let memory = platform.device().memory();
        let plain = memory.import_foreign(4 * 4096, false).unwrap();
        let secure = memory.import_foreign(4096, true).unwrap();

        let wrapped = session
            .create_io_buffer_from_external(plain, 4096, 1000, false)
            .unwrap();
        assert!(wrapped.fd.is_none());
        assert!(matches!(
            session.create_io_buffer_from_external(plain, 100, 1000, false),
            Err(NpuError::Misaligned { offset: 100 })
        ));
        assert!(session
            .create_io_buffer_from_external(plain, 0, 1000, true)
            .is_err());
        assert!(session
            .create_io_buffer_from_external(secure, 0, 4096, true)
            .is_ok());
        assert_eq!(session.buffers().len(), 2);
    }
}

#[test]
fn close_cascades_and_is_idempotent() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let used = platform.heap().used();
        let session = platform.device().open_session(1).unwrap();

        for _ in 0..2 {
            let nid = session.create_network(&small_model()).unwrap();
            let buffer = session.create_io_buffer(1024).unwrap();
            session.attach_io_buffer(nid, buffer.bid).unwrap();
        }
        assert_eq!(platform.ta().attachment_count(), 2);

        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(platform.ta().network_count(), 0);
        assert_eq!(platform.ta().buffer_count(), 0);
        assert_eq!(platform.heap().used(), used);
        assert_eq!(platform.device().session_count(), 0);
        assert!(matches!(
            session.create_io_buffer(64),
            Err(NpuError::InvalidState { .. })
        ));
    }
}

#[test]
fn dropping_a_session_releases_its_resources() {
    let platform = platform(BACKENDS[0]);
    let used = platform.heap().used();
    {
        let session = platform.device().open_session(1).unwrap();
        session.create_network(&small_model()).unwrap();
        session.create_io_buffer(4096).unwrap();
    }
    assert_eq!(platform.heap().used(), used);
    assert_eq!(platform.ta().network_count(), 0);
}

#[test]
fn snapshot_lists_sessions_and_networks() {
    let platform = platform(BACKENDS[0]);
    let session = platform.device().open_session(42).unwrap();
    let nid = session.create_network(&small_model()).unwrap();
    session.run_network(nid).unwrap();
    session.lock_hardware().unwrap();

    let snapshot = platform.device().snapshot();
    assert!(snapshot.powered);
    assert_eq!(snapshot.reservation, Some(session.id()));
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(snapshot.sessions[0].pid, 42);
    assert_eq!(snapshot.sessions[0].networks[0].1.inferences, 1);

    let text = snapshot.to_string();
    assert!(text.contains("pid 42"));
    assert!(text.contains("network 1: 1 inference(s)"));
}
