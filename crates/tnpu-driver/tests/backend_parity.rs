//! The generic and vendor backends must put identical requests on the wire.
//!
//! Each test drives the same session script through both backends with a
//! recording peer in front of the simulated Trusted Application, then
//! compares what the peer received.

mod common;

use common::builder;
use tnpu_chip::ta::TaCommand;
use tnpu_driver::channel::{Param, PeerCall};
use tnpu_driver::simulator::SimulatedPlatform;
use tnpu_driver::{BackendSelection, BackendType};
use tnpu_models::ModelBuilder;

fn recorded_platform(backend: BackendSelection) -> SimulatedPlatform {
    builder(backend).record(true).build().unwrap()
}

/// The model payload is described in place, at whatever host address the
/// image happens to live; only its length is comparable between runs.
fn normalize(mut calls: Vec<PeerCall>) -> Vec<PeerCall> {
    for call in &mut calls {
        if let PeerCall::Invoke { func, params } = call {
            if *func == TaCommand::CreateNetwork.id() {
                let len = params[1].memref().map_or(0, |b| b.len());
                params[1] = Param::ValueIn {
                    a: u32::try_from(len).unwrap(),
                    b: 0,
                };
            }
        }
    }
    calls
}

fn script(platform: &SimulatedPlatform) -> Vec<PeerCall> {
    let session = platform.device().open_session(1).unwrap();
    let model = ModelBuilder::new()
        .code(vec![3; 4096])
        .page_table_pages(16)
        .pool(5000)
        .profiling(vec![1, 2])
        .build();
    let nid = session.create_network(&model).unwrap();
    let input = session.create_io_buffer(3 * 4096).unwrap();
    let output = session.create_io_buffer(256).unwrap();
    let shared = session
        .create_io_buffer_from_mem_id(input.mem_id, 4096, 4096)
        .unwrap();
    let in_aid = session.attach_io_buffer(nid, input.bid).unwrap();
    let out_aid = session.attach_io_buffer(nid, output.bid).unwrap();
    session.set_input(nid, in_aid, 0).unwrap();
    session.set_output(nid, out_aid, 0).unwrap();
    session.run_network(nid).unwrap();
    session.detach_io_buffer(nid, out_aid).unwrap();
    session.destroy_io_buffer(shared).unwrap();
    session.close();

    normalize(platform.recorder().unwrap().calls())
}

#[test]
fn backends_report_their_type() {
    let generic = recorded_platform(BackendSelection::Generic);
    let vendor = recorded_platform(BackendSelection::Vendor);
    assert_eq!(generic.device().channel().backend_type(), BackendType::Generic);
    assert_eq!(vendor.device().channel().backend_type(), BackendType::Vendor);
}

#[test]
fn session_open_is_identical() {
    let generic = recorded_platform(BackendSelection::Generic);
    let vendor = recorded_platform(BackendSelection::Vendor);
    let generic_calls = generic.recorder().unwrap().calls();
    let vendor_calls = vendor.recorder().unwrap().calls();

    assert_eq!(generic_calls.len(), 1);
    assert_eq!(generic_calls, vendor_calls);
    let PeerCall::Open(params) = &generic_calls[0] else {
        panic!("expected a session open, got {:?}", generic_calls[0]);
    };
    assert!(matches!(params[0], Param::MemrefIn(_)));
}

#[test]
fn full_script_is_identical() {
    let generic = script(&recorded_platform(BackendSelection::Generic));
    let vendor = script(&recorded_platform(BackendSelection::Vendor));

    assert_eq!(generic.len(), vendor.len());
    for (i, (g, v)) in generic.iter().zip(&vendor).enumerate() {
        assert_eq!(g, v, "request {i} differs");
    }

    let commands: Vec<TaCommand> = generic
        .iter()
        .filter_map(|call| match call {
            PeerCall::Invoke { func, .. } => TaCommand::from_id(*func),
            _ => None,
        })
        .collect();
    for expected in [
        TaCommand::CreateNetwork,
        TaCommand::CreateIoBufferFromSg,
        TaCommand::CreateIoBufferFromMemId,
        TaCommand::AttachIoBuffer,
        TaCommand::ActivateNpu,
        TaCommand::StartNetwork,
        TaCommand::ReadInterruptRegister,
        TaCommand::DetachIoBuffer,
        TaCommand::DestroyNetwork,
        TaCommand::DestroyIoBuffer,
    ] {
        assert!(commands.contains(&expected), "{expected} never sent");
    }
}
