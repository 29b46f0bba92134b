//! End-to-end tests: requests go through the loopback transport, the worker
//! pool and the dispatcher, and replies are read back off the transport.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{test_config, TestMds, DEVICE, REMOTE, SERVICE};
use metafs_mds::backend::{AttrChanges, OpenFlags};
use metafs_mds::reint::{UpdateOp, UpdateRecord};
use metafs_mds::wire::VALID_ALL;
use metafs_mds::{
    status, FailPoint, FileIdentifier, InodeId, MdsError, MdsFilesystem, MdsOpcode, MdsReply,
    MdsRequest,
};
use metafs_transport::protocol::encode_request;
use metafs_transport::transport::BulkMode;
use metafs_transport::{
    new_cancel_pair, CancelReason, CancelToken, IncomingRequest, Niobuf, Peer,
};

const GETATTR: u32 = MdsOpcode::Getattr as u32;
const OPEN: u32 = MdsOpcode::Open as u32;
const CLOSE: u32 = MdsOpcode::Close as u32;
const READPAGE: u32 = MdsOpcode::Readpage as u32;
const REINT: u32 = MdsOpcode::Reint as u32;

fn root() -> FileIdentifier {
    FileIdentifier::new(InodeId::ROOT.as_u64(), 1)
}

fn readpage_req(fid: FileIdentifier, offset: u64) -> MdsRequest {
    MdsRequest {
        fid1: fid,
        size: offset,
        tgt: Niobuf {
            addr: 0xdead_0000,
            len: 4096,
        }
        .encode(),
        ..Default::default()
    }
}

fn reint_req(ops: Vec<UpdateOp>) -> MdsRequest {
    MdsRequest {
        tgt: UpdateRecord::new(ops).encode(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_getattr_live_file() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", &[0x5a; 1024]);

    let reply = mds
        .call(REMOTE, GETATTR, &MdsRequest::for_fid(FileIdentifier::new(42, 7)))
        .await;
    assert_eq!(reply.status, status::OK);
    let body = MdsReply::decode(&reply.payload).unwrap();
    assert_eq!(body.ino, 42);
    assert_eq!(body.generation, 7);
    assert_eq!(body.size, 1024);
    assert_eq!(body.valid, VALID_ALL);
    mds.stop().await;
}

#[tokio::test]
async fn test_getattr_stale_generation_is_not_found() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"");

    let reply = mds
        .call(REMOTE, GETATTR, &MdsRequest::for_fid(FileIdentifier::new(42, 6)))
        .await;
    assert_eq!(reply.status, status::ENOENT);
    assert!(reply.payload.is_empty());
    mds.stop().await;
}

#[tokio::test]
async fn test_open_close_and_double_close() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"hello");
    let fid = FileIdentifier::new(42, 7);

    let open = MdsRequest {
        fid1: fid,
        flags: OpenFlags::READ_WRITE.bits(),
        ..Default::default()
    };
    let reply = mds.call(REMOTE, OPEN, &open).await;
    assert_eq!(reply.status, status::OK);
    let body = MdsReply::decode(&reply.payload).unwrap();
    assert_eq!(body.ino, 42);
    assert_eq!(body.generation, 7);
    assert_ne!(body.objid, 0);
    assert_eq!(mds.volume.open_handle_count(), 1);

    let close = MdsRequest {
        fid1: fid,
        objid: body.objid,
        ..Default::default()
    };
    assert_eq!(mds.call(REMOTE, CLOSE, &close).await.status, status::OK);
    assert_eq!(mds.volume.open_handle_count(), 0);
    assert_eq!(mds.call(REMOTE, CLOSE, &close).await.status, status::EBADF);
    mds.stop().await;
}

#[tokio::test]
async fn test_open_invalid_mode_is_einval() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"");
    let open = MdsRequest {
        fid1: FileIdentifier::new(42, 7),
        flags: 3,
        ..Default::default()
    };
    assert_eq!(mds.call(REMOTE, OPEN, &open).await.status, status::EINVAL);
    assert_eq!(mds.volume.open_handle_count(), 0);
    mds.stop().await;
}

#[tokio::test]
async fn test_readpage_local_peer_inline() {
    let mds = TestMds::start().await;
    let contents: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    mds.seed_file(42, 7, "data", &contents);

    let reply = mds
        .call(Peer::LOCAL, READPAGE, &readpage_req(FileIdentifier::new(42, 7), 4096))
        .await;
    assert_eq!(reply.status, status::OK);
    let body = MdsReply::decode(&reply.payload).unwrap();
    assert_eq!(body.size, 6000 - 4096);
    assert_eq!(&body.data[..], &contents[4096..]);
    assert!(mds.transport.bulk_deliveries().is_empty());
    assert_eq!(mds.volume.open_handle_count(), 0);
    mds.stop().await;
}

#[tokio::test]
async fn test_readpage_remote_peer_uses_bulk() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", &[7u8; 4096]);

    let xid = mds
        .send(
            REMOTE,
            READPAGE,
            &readpage_req(FileIdentifier::new(42, 7), 0),
            CancelToken::never(),
        )
        .await;
    let reply = mds.reply(xid).await;
    assert_eq!(reply.status, status::OK);
    let body = MdsReply::decode(&reply.payload).unwrap();
    assert_eq!(body.size, 4096);
    assert!(body.data.is_empty());

    let bulk = mds.transport.bulk_deliveries();
    assert_eq!(bulk.len(), 1);
    assert_eq!(bulk[0].xid, xid);
    assert_eq!(bulk[0].peer, REMOTE);
    assert_eq!(bulk[0].dst.addr, 0xdead_0000);
    assert_eq!(&bulk[0].data[..], &[7u8; 4096][..]);
    assert_eq!(mds.service.stats().snapshot().bulk_sent, 1);
    mds.stop().await;
}

#[tokio::test]
async fn test_readpage_stale_handle_keeps_estale() {
    let mds = TestMds::start().await;
    let reply = mds
        .call(REMOTE, READPAGE, &readpage_req(FileIdentifier::new(99, 1), 0))
        .await;
    assert_eq!(reply.status, status::ESTALE);
    mds.stop().await;
}

#[tokio::test]
async fn test_bulk_interruption_releases_page() {
    let mut config = test_config();
    config.service.page_buffers = 1;
    let mds = TestMds::start_with(config).await;
    mds.seed_file(42, 7, "data", &[1u8; 100]);
    let req = readpage_req(FileIdentifier::new(42, 7), 0);

    mds.transport.set_bulk_mode(BulkMode::Interrupt);
    assert_eq!(mds.call(REMOTE, READPAGE, &req).await.status, status::EINTR);
    assert_eq!(mds.service.stats().snapshot().bulk_interrupted, 1);

    // With a single page buffer this only succeeds if the first was returned.
    mds.transport.set_bulk_mode(BulkMode::Ack);
    assert_eq!(mds.call(REMOTE, READPAGE, &req).await.status, status::OK);
    assert_eq!(mds.volume.open_handle_count(), 0);
    mds.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_aborts_bulk_wait() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", &[1u8; 100]);
    mds.transport.set_bulk_mode(BulkMode::Hang);

    let (token, handle) = new_cancel_pair();
    let xid = mds
        .send(REMOTE, READPAGE, &readpage_req(FileIdentifier::new(42, 7), 0), token)
        .await;
    while mds.transport.bulk_deliveries().is_empty() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    handle.cancel(CancelReason::ClientDisconnected);

    assert_eq!(mds.reply(xid).await.status, status::EINTR);
    assert_eq!(mds.volume.open_handle_count(), 0);
    mds.stop().await;
}

#[tokio::test]
async fn test_bulk_timeout_is_eintr() {
    let mut config = test_config();
    config.service.bulk_timeout_ms = 50;
    let mds = TestMds::start_with(config).await;
    mds.seed_file(42, 7, "data", &[1u8; 10]);
    mds.transport.set_bulk_mode(BulkMode::Hang);

    let reply = mds
        .call(REMOTE, READPAGE, &readpage_req(FileIdentifier::new(42, 7), 0))
        .await;
    assert_eq!(reply.status, status::EINTR);
    mds.stop().await;
}

#[tokio::test]
async fn test_reint_applies_until_first_failure() {
    let mds = TestMds::start().await;
    let ops = vec![
        UpdateOp::Create {
            parent: root(),
            name: "first".to_string(),
            mode: 0o100644,
            uid: 10,
            gid: 10,
        },
        UpdateOp::Unlink {
            parent: root(),
            name: "missing".to_string(),
        },
        UpdateOp::Create {
            parent: root(),
            name: "third".to_string(),
            mode: 0o100644,
            uid: 10,
            gid: 10,
        },
    ];

    let reply = mds.call(REMOTE, REINT, &reint_req(ops)).await;
    assert_eq!(reply.status, status::ENOENT);
    assert!(mds.volume.lookup_name(InodeId::ROOT, "first").is_ok());
    assert!(mds.volume.lookup_name(InodeId::ROOT, "third").is_err());
    mds.stop().await;
}

#[tokio::test]
async fn test_reint_rename_and_link() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "old", b"x");
    let ops = vec![
        UpdateOp::Rename {
            src_parent: root(),
            src_name: "old".to_string(),
            dst_parent: root(),
            dst_name: "new".to_string(),
        },
        UpdateOp::Link {
            fid: FileIdentifier::new(42, 7),
            parent: root(),
            name: "alias".to_string(),
        },
    ];
    assert_eq!(mds.call(REMOTE, REINT, &reint_req(ops)).await.status, status::OK);
    assert_eq!(
        mds.volume.lookup_name(InodeId::ROOT, "new").unwrap(),
        InodeId::new(42)
    );
    assert_eq!(
        mds.volume.lookup_name(InodeId::ROOT, "alias").unwrap(),
        InodeId::new(42)
    );
    assert!(mds.volume.lookup_name(InodeId::ROOT, "old").is_err());
    mds.stop().await;
}

#[tokio::test]
async fn test_reint_oversized_setattr_is_rejected() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"abc");
    let ops = vec![UpdateOp::SetAttr {
        fid: FileIdentifier::new(42, 7),
        changes: AttrChanges {
            valid: AttrChanges::ATTR_SIZE,
            size: u64::MAX,
            ..Default::default()
        },
    }];

    let reply = mds.call(REMOTE, REINT, &reint_req(ops)).await;
    assert_eq!(reply.status, status::EINVAL);

    let reply = mds
        .call(REMOTE, GETATTR, &MdsRequest::for_fid(FileIdentifier::new(42, 7)))
        .await;
    assert_eq!(reply.status, status::OK);
    let body = MdsReply::decode(&reply.payload).unwrap();
    assert_eq!(body.size, 3);
    mds.stop().await;
}

#[tokio::test]
async fn test_reint_garbage_record_is_einval() {
    let mds = TestMds::start().await;
    let req = MdsRequest {
        tgt: Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 99]),
        ..Default::default()
    };
    assert_eq!(mds.call(REMOTE, REINT, &req).await.status, status::EINVAL);
    mds.stop().await;
}

#[tokio::test]
async fn test_unknown_opcode_gets_eproto() {
    let mds = TestMds::start().await;
    let reply = mds.call(REMOTE, 77, &MdsRequest::default()).await;
    assert_eq!(reply.status, status::EPROTO);
    assert_eq!(reply.opcode, 77);
    let stats = mds.service.stats().snapshot();
    assert_eq!(stats.unknown_opcodes, 1);
    assert_eq!(stats.error_replies, 1);
    mds.stop().await;
}

#[tokio::test]
async fn test_malformed_packets_get_no_reply() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"");

    mds.send_raw(REMOTE, Bytes::from_static(b"garbage"), CancelToken::never())
        .await;
    // Valid header, body too short for a request.
    mds.send_raw(
        REMOTE,
        encode_request(5, GETATTR, &[0u8; 4]),
        CancelToken::never(),
    )
    .await;
    let reply = mds
        .call(REMOTE, GETATTR, &MdsRequest::for_fid(FileIdentifier::new(42, 7)))
        .await;
    assert_eq!(reply.status, status::OK);

    mds.stop().await;
    assert_eq!(mds.transport.replies().len(), 1);
    let stats = mds.service.stats().snapshot();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.received, 3);
}

#[tokio::test]
async fn test_configured_pack_fault_fires_once() {
    let mut config = test_config();
    config.fault.fail_loc = FailPoint::GetattrPack.id();
    config.fault.once = true;
    let mds = TestMds::start_with(config).await;
    mds.seed_file(42, 7, "data", b"");
    let req = MdsRequest::for_fid(FileIdentifier::new(42, 7));

    assert_eq!(mds.call(REMOTE, GETATTR, &req).await.status, status::ENOMEM);
    assert_eq!(mds.call(REMOTE, GETATTR, &req).await.status, status::OK);
    assert_eq!(mds.service.faults().hits(), 1);
    mds.stop().await;
}

#[tokio::test]
async fn test_open_pack_fault_opens_nothing() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"");
    mds.service.faults().arm(FailPoint::OpenPack, true, None);
    let open = MdsRequest::for_fid(FileIdentifier::new(42, 7));

    assert_eq!(mds.call(REMOTE, OPEN, &open).await.status, status::ENOMEM);
    assert_eq!(mds.volume.open_handle_count(), 0);
    assert_eq!(mds.call(REMOTE, OPEN, &open).await.status, status::OK);
    assert_eq!(mds.volume.open_handle_count(), 1);
    mds.stop().await;
}

#[tokio::test]
async fn test_forced_net_status() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"");
    mds.service
        .faults()
        .arm(FailPoint::OpenNet, false, Some(status::EBUSY));
    let open = MdsRequest::for_fid(FileIdentifier::new(42, 7));
    assert_eq!(mds.call(REMOTE, OPEN, &open).await.status, status::EBUSY);
    assert_eq!(mds.volume.open_handle_count(), 0);
    mds.service.faults().clear();
    assert_eq!(mds.call(REMOTE, OPEN, &open).await.status, status::OK);
    mds.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_all_replied() {
    let mds = TestMds::start().await;
    for i in 0..8u64 {
        mds.seed_file(100 + i, 1, &format!("f{}", i), &[i as u8; 64]);
    }
    let mut xids = Vec::new();
    for round in 0..4u64 {
        for i in 0..8u64 {
            let fid = FileIdentifier::new(100 + i, 1);
            let (op, req) = if round % 2 == 0 {
                (GETATTR, MdsRequest::for_fid(fid))
            } else {
                (READPAGE, readpage_req(fid, 0))
            };
            xids.push(mds.send(REMOTE, op, &req, CancelToken::never()).await);
        }
    }
    for xid in xids {
        assert_eq!(mds.reply(xid).await.status, status::OK);
    }
    let stats = mds.service.stats().snapshot();
    assert_eq!(stats.replied, 32);
    assert_eq!(stats.handled["getattr"], 16);
    assert_eq!(stats.handled["readpage"], 16);
    mds.stop().await;
}

#[tokio::test]
async fn test_teardown_drains_queued_requests() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"");
    for _ in 0..20 {
        mds.send(
            REMOTE,
            GETATTR,
            &MdsRequest::for_fid(FileIdentifier::new(42, 7)),
            CancelToken::never(),
        )
        .await;
    }
    mds.stop().await;
    assert_eq!(mds.transport.replies().len(), 20);
    assert!(!mds.transport.is_registered(SERVICE));
}

#[tokio::test]
async fn test_teardown_refused_while_clients_attached() {
    let mds = TestMds::start().await;
    let client = mds.service.connect_client();
    let err = mds.service.teardown().await.unwrap_err();
    assert!(matches!(err, MdsError::Busy(1)));
    assert_eq!(err.status(), status::EBUSY);

    // Still serving.
    let reply = mds
        .call(REMOTE, GETATTR, &MdsRequest::for_fid(root()))
        .await;
    assert_eq!(reply.status, status::OK);

    mds.service.disconnect_client(&client).unwrap();
    mds.stop().await;
    assert!(!mds.mounter.is_mounted(DEVICE));
}

#[tokio::test]
async fn test_unsupported_fstype_releases_mount() {
    let mut config = test_config();
    config.mount.fstype = "reiserfs".to_string();
    let mds = TestMds::new(config);
    let err = mds.service.setup().await.unwrap_err();
    assert!(matches!(err, MdsError::UnsupportedFsType(_)));
    assert!(!mds.mounter.is_mounted(DEVICE));
    assert!(!mds.volume.has_delete_hook());
    assert!(!mds.transport.is_registered(SERVICE));
}

#[tokio::test]
async fn test_delete_hook_clears_object_id_and_is_removed() {
    let mds = TestMds::start().await;
    assert!(mds.volume.has_delete_hook());
    mds.seed_file(50, 3, "victim", b"bye");
    mds.volume.set_object_id(InodeId::new(50), 0x99).unwrap();

    let ops = vec![UpdateOp::Unlink {
        parent: root(),
        name: "victim".to_string(),
    }];
    assert_eq!(mds.call(REMOTE, REINT, &reint_req(ops)).await.status, status::OK);
    assert_eq!(mds.volume.reclaimed_count(), 1);
    let hook = mds.service.delete_hook().await.unwrap();
    assert_eq!(hook.invocations(), 1);

    mds.stop().await;
    assert!(!mds.volume.has_delete_hook());
}

#[tokio::test]
async fn test_requests_refused_when_not_running() {
    let mds = TestMds::new(test_config());
    let request = IncomingRequest {
        peer: REMOTE,
        packet: encode_request(1, GETATTR, &MdsRequest::for_fid(root()).encode()),
        cancel: CancelToken::never(),
    };
    assert!(matches!(
        mds.service.submit(request.clone()).await,
        Err(MdsError::NotRunning)
    ));

    mds.service.setup().await.unwrap();
    mds.service.submit(request.clone()).await.unwrap();
    assert_eq!(mds.reply(1).await.status, status::OK);
    mds.stop().await;

    assert!(matches!(
        mds.service.submit(request).await,
        Err(MdsError::NotRunning)
    ));
    assert!(mds
        .transport
        .deliver(SERVICE, REMOTE, Bytes::new(), CancelToken::never())
        .await
        .is_err());
}

#[tokio::test]
async fn test_restart_after_teardown() {
    let mds = TestMds::start().await;
    mds.seed_file(42, 7, "data", b"persist");
    mds.stop().await;

    mds.service.setup().await.unwrap();
    let reply = mds
        .call(REMOTE, GETATTR, &MdsRequest::for_fid(FileIdentifier::new(42, 7)))
        .await;
    assert_eq!(reply.status, status::OK);
    assert_eq!(MdsReply::decode(&reply.payload).unwrap().size, 7);
    mds.stop().await;
}
