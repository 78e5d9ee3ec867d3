//! Control-surface dispatch: output fields and status codes.

mod common;

use common::{platform, small_model, BACKENDS};
use tnpu_chip::uapi::{
    AttachIoBufferData, AttachmentData, ControlCommand, CreateIoBufferData,
    CreateIoBufferFromDmabufData, CreateIoBufferFromMemIdData, CreateNetworkData,
    CreateSecureIoBufferFromDmabufData, SetNetworkIoData,
};
use tnpu_driver::{dispatch, status_code, ControlRequest};

#[test]
fn full_command_sequence() {
    for backend in BACKENDS {
        let platform = platform(backend);
        let session = platform.device().open_session(7).unwrap();
        let model = small_model();

        let mut create = ControlRequest::CreateNetwork {
            model: &model,
            data: CreateNetworkData {
                start: 0,
                size: u32::try_from(model.len()).unwrap(),
                nid: 0,
            },
        };
        assert_eq!(status_code(&dispatch(&session, &mut create)), 0);
        let ControlRequest::CreateNetwork { data, .. } = create else {
            unreachable!()
        };
        let nid = data.nid;
        assert_eq!(nid, 1);

        let mut buffer = ControlRequest::CreateIoBuffer(CreateIoBufferData {
            size: 256,
            ..CreateIoBufferData::default()
        });
        dispatch(&session, &mut buffer).unwrap();
        let ControlRequest::CreateIoBuffer(buffer) = buffer else {
            unreachable!()
        };
        assert_eq!(buffer.bid, 1);
        assert!(buffer.fd >= 0);

        let mut shared = ControlRequest::CreateIoBufferFromMemId(CreateIoBufferFromMemIdData {
            mem_id: buffer.mem_id,
            offset: 0,
            size: 128,
            bid: 0,
        });
        dispatch(&session, &mut shared).unwrap();
        assert!(matches!(
            shared,
            ControlRequest::CreateIoBufferFromMemId(CreateIoBufferFromMemIdData { bid: 2, .. })
        ));

        let mut attach = ControlRequest::AttachIoBuffer(AttachIoBufferData {
            nid,
            bid: buffer.bid,
            aid: 0,
        });
        dispatch(&session, &mut attach).unwrap();
        let ControlRequest::AttachIoBuffer(attach) = attach else {
            unreachable!()
        };
        assert_eq!(attach.aid, 1);

        let io = SetNetworkIoData {
            nid,
            aid: attach.aid,
            index: 0,
        };
        dispatch(&session, &mut ControlRequest::SetNetworkInput(io)).unwrap();
        dispatch(&session, &mut ControlRequest::SetNetworkOutput(io)).unwrap();
        dispatch(&session, &mut ControlRequest::RunNetwork(nid)).unwrap();
        assert_eq!(session.network_stats(nid).unwrap().inferences, 1);

        dispatch(&session, &mut ControlRequest::LockHardware).unwrap();
        let mut query = ControlRequest::QueryHardwareLock(0);
        dispatch(&session, &mut query).unwrap();
        assert!(matches!(query, ControlRequest::QueryHardwareLock(1)));
        dispatch(&session, &mut ControlRequest::UnlockHardware).unwrap();

        let mut detach = ControlRequest::DetachIoBuffer(AttachmentData { nid, aid: attach.aid });
        dispatch(&session, &mut detach).unwrap();
        dispatch(&session, &mut ControlRequest::DestroyIoBuffer(buffer.bid)).unwrap();
        dispatch(&session, &mut ControlRequest::DestroyNetwork(nid)).unwrap();
        assert!(session.networks().is_empty());
    }
}

#[test]
fn external_memory_commands() {
    let platform = platform(BACKENDS[0]);
    let session = platform.device().open_session(1).unwrap();
    let fd = platform.device().memory().import_foreign(8192, false).unwrap().raw();

    let mut plain = ControlRequest::CreateIoBufferFromDmabuf(CreateIoBufferFromDmabufData {
        fd,
        offset: 4096,
        size: 4096,
        ..CreateIoBufferFromDmabufData::default()
    });
    dispatch(&session, &mut plain).unwrap();
    assert!(matches!(
        plain,
        ControlRequest::CreateIoBufferFromDmabuf(CreateIoBufferFromDmabufData { bid: 1, .. })
    ));

    let mut secure = ControlRequest::CreateSecureIoBufferFromDmabuf(
        CreateSecureIoBufferFromDmabufData {
            buffer: CreateIoBufferFromDmabufData {
                fd,
                size: 4096,
                ..CreateIoBufferFromDmabufData::default()
            },
            secure: 1,
        },
    );
    assert_eq!(status_code(&dispatch(&session, &mut secure)), -22);

    let mut bad_fd = ControlRequest::CreateIoBufferFromDmabuf(CreateIoBufferFromDmabufData {
        fd: -1,
        size: 4096,
        ..CreateIoBufferFromDmabufData::default()
    });
    assert_eq!(status_code(&dispatch(&session, &mut bad_fd)), -22);
    assert_eq!(bad_fd.command(), ControlCommand::CreateIoBufferFromDmabuf);
}

#[test]
fn failures_map_to_status_codes() {
    let platform = platform(BACKENDS[1]);
    let session = platform.device().open_session(1).unwrap();
    let other = platform.device().open_session(2).unwrap();

    // Unknown handles and refused reservations are both plain failures.
    assert_eq!(
        status_code(&dispatch(&session, &mut ControlRequest::RunNetwork(5))),
        -14
    );
    assert_eq!(
        status_code(&dispatch(&session, &mut ControlRequest::UnlockHardware)),
        -14
    );
    dispatch(&other, &mut ControlRequest::LockHardware).unwrap();
    assert_eq!(
        status_code(&dispatch(&session, &mut ControlRequest::LockHardware)),
        -14
    );

    let model = small_model();
    let mut oversized = ControlRequest::CreateNetwork {
        model: &model,
        data: CreateNetworkData {
            size: u32::try_from(model.len()).unwrap() + 1,
            ..CreateNetworkData::default()
        },
    };
    assert_eq!(status_code(&dispatch(&session, &mut oversized)), -22);

    let mut zero = ControlRequest::CreateIoBuffer(CreateIoBufferData::default());
    assert_eq!(status_code(&dispatch(&session, &mut zero)), -22);
}
