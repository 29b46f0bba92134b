//! Common fixtures for MDS integration tests: a service on a loopback
//! transport backed by an in-memory volume.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metafs_mds::types::S_IFREG;
use metafs_mds::{InodeId, MdsConfig, MdsFilesystem, MdsRequest, MdsService, MemoryFs, MemoryMounter};
use metafs_transport::protocol::{decode_reply, encode_request};
use metafs_transport::{CancelToken, LoopbackTransport, Peer, ReplyEnvelope};

/// Device the test volume is registered under.
pub const DEVICE: &str = "/dev/mdstest";

/// Service name used by the default config.
pub const SERVICE: &str = "metafs_mds";

/// A remote client peer.
pub const REMOTE: Peer = Peer { nid: 12, conn: 4 };

/// Service plus the pieces tests poke at directly.
pub struct TestMds {
    pub service: MdsService,
    pub transport: Arc<LoopbackTransport>,
    pub mounter: Arc<MemoryMounter>,
    pub volume: Arc<MemoryFs>,
    next_xid: AtomicU64,
}

/// Default test configuration: ext3 on the test device, short bulk timeout.
pub fn test_config() -> MdsConfig {
    let mut config = MdsConfig::default();
    config.mount.device = DEVICE.to_string();
    config.service.workers = 4;
    config.service.bulk_timeout_ms = 2000;
    config
}

impl TestMds {
    /// Builds a stopped service from `config`.
    pub fn new(config: MdsConfig) -> Self {
        let mounter = Arc::new(MemoryMounter::new());
        let volume = Arc::new(MemoryFs::new(DEVICE));
        mounter.add_device(DEVICE, volume.clone());
        let transport = Arc::new(LoopbackTransport::new());
        let service = MdsService::new(config, mounter.clone(), transport.clone());
        Self {
            service,
            transport,
            mounter,
            volume,
            next_xid: AtomicU64::new(100),
        }
    }

    /// Builds and sets up a service with the default test config.
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    /// Builds and sets up a service.
    pub async fn start_with(config: MdsConfig) -> Self {
        let mds = Self::new(config);
        mds.service.setup().await.expect("setup");
        mds
    }

    /// Adds a regular file under the root with the given contents.
    pub fn seed_file(&self, ino: u64, generation: u32, name: &str, data: &[u8]) {
        let ino = InodeId::new(ino);
        self.volume
            .insert_inode(ino, generation, S_IFREG | 0o644, Some((InodeId::ROOT, name)))
            .expect("insert inode");
        if !data.is_empty() {
            self.volume.write_at(ino, 0, data).expect("write");
        }
    }

    /// Delivers a request and returns its xid without waiting.
    pub async fn send(&self, peer: Peer, opcode: u32, req: &MdsRequest, cancel: CancelToken) -> u64 {
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        self.send_raw(peer, encode_request(xid, opcode, &req.encode()), cancel)
            .await;
        xid
    }

    /// Delivers an arbitrary packet.
    pub async fn send_raw(&self, peer: Peer, packet: Bytes, cancel: CancelToken) {
        self.transport
            .deliver(SERVICE, peer, packet, cancel)
            .await
            .expect("deliver");
    }

    /// Sends a request and waits for its reply.
    pub async fn call(&self, peer: Peer, opcode: u32, req: &MdsRequest) -> ReplyEnvelope {
        let xid = self.send(peer, opcode, req, CancelToken::never()).await;
        self.reply(xid).await
    }

    /// Waits for the reply to `xid`.
    pub async fn reply(&self, xid: u64) -> ReplyEnvelope {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let found = self
                .transport
                .replies()
                .iter()
                .filter_map(|r| decode_reply(&r.packet).ok())
                .find(|r| r.xid == xid);
            if let Some(reply) = found {
                return reply;
            }
            assert!(Instant::now() < deadline, "no reply for xid {}", xid);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stops the service.
    pub async fn stop(&self) {
        self.service.teardown().await.expect("teardown");
    }
}
