//! Transport adapter seam.
//!
//! The metadata server never touches sockets directly. It registers an intake
//! queue with a [`Transport`], receives [`IncomingRequest`]s from it, sends
//! encoded replies back through it, and posts bulk data to a remote
//! [`Niobuf`]. [`LoopbackTransport`] is the in-process implementation used by
//! tests and single-node setups; [`crate::tcp::TcpTransport`] speaks framed
//! packets over TCP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Result, TransportError};

/// Address of a remote (or local) peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Network id; 0 is the local node.
    pub nid: u64,
    /// Connection id, used to route replies back.
    pub conn: u64,
}

impl Peer {
    /// The local peer: requests issued in-process, served without bulk.
    pub const LOCAL: Peer = Peer { nid: 0, conn: 0 };

    /// Creates a remote peer address.
    pub fn new(nid: u64, conn: u64) -> Self {
        Self { nid, conn }
    }

    /// True for the local node.
    pub fn is_local(&self) -> bool {
        self.nid == 0
    }
}

/// Encoded size of a [`Niobuf`].
pub const NIOBUF_SIZE: usize = 12;

/// Where bulk data should land on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Niobuf {
    /// Opaque destination address.
    pub addr: u64,
    /// Destination length in bytes.
    pub len: u32,
}

impl Niobuf {
    /// Decodes a niobuf from its 12-byte wire form.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < NIOBUF_SIZE {
            return Err(TransportError::malformed(format!(
                "niobuf needs {} bytes, got {}",
                NIOBUF_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            addr: buf.get_u64(),
            len: buf.get_u32(),
        })
    }

    /// Encodes the niobuf.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(NIOBUF_SIZE);
        out.put_u64(self.addr);
        out.put_u32(self.len);
        out.freeze()
    }
}

/// A raw packet handed to the service by the transport.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Sender.
    pub peer: Peer,
    /// Undecoded packet.
    pub packet: Bytes,
    /// Fires when the sender goes away.
    pub cancel: CancelToken,
}

/// Completion of a posted bulk transfer.
pub struct BulkCompletion {
    xid: u64,
    rx: oneshot::Receiver<Result<()>>,
}

/// Transport side of a [`BulkCompletion`].
pub struct BulkCompleter {
    tx: oneshot::Sender<Result<()>>,
}

impl BulkCompletion {
    /// Creates a linked completer/completion pair.
    pub fn channel(xid: u64) -> (BulkCompleter, BulkCompletion) {
        let (tx, rx) = oneshot::channel();
        (BulkCompleter { tx }, BulkCompletion { xid, rx })
    }

    /// Transaction id of the transfer.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Waits for the transport to acknowledge or fail the transfer.
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(TransportError::TransportFailure {
                reason: format!("bulk {} abandoned by transport", self.xid),
            }),
        }
    }
}

impl BulkCompleter {
    /// Resolves the paired completion.
    pub fn complete(self, res: Result<()>) {
        let _ = self.tx.send(res);
    }
}

/// Token returned by [`Transport::register_service`].
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Service name.
    pub name: String,
    /// Registration id, unique per transport.
    pub id: u64,
}

/// Send/receive primitive consumed by the metadata server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts delivering requests for `name` into `intake`.
    async fn register_service(
        &self,
        name: &str,
        intake: mpsc::Sender<IncomingRequest>,
    ) -> Result<ServiceRegistration>;

    /// Stops delivering requests for a registration. Dropping the intake
    /// sender closes the service queue once queued requests drain.
    async fn unregister_service(&self, registration: ServiceRegistration);

    /// Sends an encoded reply packet to a peer.
    async fn send_reply(&self, peer: Peer, packet: Bytes) -> Result<()>;

    /// Posts bulk data for `dst` on `peer`. The data is copied before this
    /// returns; the completion resolves once the peer has it.
    fn post_bulk(&self, peer: Peer, xid: u64, dst: Niobuf, data: &[u8])
        -> Result<BulkCompletion>;
}

/// How the loopback transport completes posted bulk transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulkMode {
    /// Acknowledge immediately.
    #[default]
    Ack,
    /// Report an interruption.
    Interrupt,
    /// Report a transport failure.
    Fail,
    /// Never complete.
    Hang,
    /// Acknowledge after a delay.
    Delay(Duration),
}

/// A reply captured by the loopback transport.
#[derive(Debug, Clone)]
pub struct SentReply {
    /// Destination.
    pub peer: Peer,
    /// Encoded reply packet.
    pub packet: Bytes,
}

/// Bulk data captured by the loopback transport.
#[derive(Debug, Clone)]
pub struct BulkDelivery {
    /// Destination peer.
    pub peer: Peer,
    /// Transaction id.
    pub xid: u64,
    /// Destination buffer description.
    pub dst: Niobuf,
    /// Data that was posted.
    pub data: Bytes,
}

/// In-process transport that records replies and bulk transfers.
#[derive(Default)]
pub struct LoopbackTransport {
    next_id: AtomicU64,
    services: Mutex<HashMap<String, (u64, mpsc::Sender<IncomingRequest>)>>,
    replies: Mutex<Vec<SentReply>>,
    reply_notify: Notify,
    bulk: Mutex<Vec<BulkDelivery>>,
    bulk_mode: Mutex<BulkMode>,
    parked: Mutex<Vec<BulkCompleter>>,
}

impl LoopbackTransport {
    /// Creates an empty loopback transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes how subsequent bulk transfers complete.
    pub fn set_bulk_mode(&self, mode: BulkMode) {
        if let Ok(mut m) = self.bulk_mode.lock() {
            *m = mode;
        }
    }

    /// Delivers a packet to a registered service, as a peer would.
    pub async fn deliver(
        &self,
        service: &str,
        peer: Peer,
        packet: Bytes,
        cancel: CancelToken,
    ) -> Result<()> {
        let intake = self
            .services
            .lock()
            .ok()
            .and_then(|s| s.get(service).map(|(_, tx)| tx.clone()))
            .ok_or(TransportError::NotConnected {
                nid: peer.nid,
                conn: peer.conn,
            })?;
        intake
            .send(IncomingRequest {
                peer,
                packet,
                cancel,
            })
            .await
            .map_err(|_| TransportError::TransportFailure {
                reason: format!("service {} intake closed", service),
            })
    }

    /// True if `service` is currently registered.
    pub fn is_registered(&self, service: &str) -> bool {
        self.services
            .lock()
            .map(|s| s.contains_key(service))
            .unwrap_or(false)
    }

    /// Replies sent so far.
    pub fn replies(&self) -> Vec<SentReply> {
        self.replies.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Waits until at least `count` replies were sent, or `timeout` elapses.
    pub async fn wait_for_replies(&self, count: usize, timeout: Duration) -> Vec<SentReply> {
        let wait = async {
            loop {
                let notified = self.reply_notify.notified();
                if self.replies.lock().map(|r| r.len()).unwrap_or(0) >= count {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.replies()
    }

    /// Bulk transfers posted so far.
    pub fn bulk_deliveries(&self) -> Vec<BulkDelivery> {
        self.bulk.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn register_service(
        &self,
        name: &str,
        intake: mpsc::Sender<IncomingRequest>,
    ) -> Result<ServiceRegistration> {
        let mut services = self
            .services
            .lock()
            .map_err(|_| TransportError::TransportFailure {
                reason: "service table poisoned".to_string(),
            })?;
        if services.contains_key(name) {
            return Err(TransportError::ServiceExists(name.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        services.insert(name.to_string(), (id, intake));
        debug!(service = name, id, "loopback service registered");
        Ok(ServiceRegistration {
            name: name.to_string(),
            id,
        })
    }

    async fn unregister_service(&self, registration: ServiceRegistration) {
        if let Ok(mut services) = self.services.lock() {
            if services
                .get(&registration.name)
                .is_some_and(|(id, _)| *id == registration.id)
            {
                services.remove(&registration.name);
            }
        }
    }

    async fn send_reply(&self, peer: Peer, packet: Bytes) -> Result<()> {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(SentReply { peer, packet });
        }
        self.reply_notify.notify_waiters();
        Ok(())
    }

    fn post_bulk(
        &self,
        peer: Peer,
        xid: u64,
        dst: Niobuf,
        data: &[u8],
    ) -> Result<BulkCompletion> {
        let mode = self.bulk_mode.lock().map(|m| *m).unwrap_or_default();
        if let Ok(mut bulk) = self.bulk.lock() {
            bulk.push(BulkDelivery {
                peer,
                xid,
                dst,
                data: Bytes::copy_from_slice(data),
            });
        }

        let (completer, completion) = BulkCompletion::channel(xid);
        match mode {
            BulkMode::Ack => completer.complete(Ok(())),
            BulkMode::Interrupt => completer.complete(Err(TransportError::Interrupted { xid })),
            BulkMode::Fail => completer.complete(Err(TransportError::TransportFailure {
                reason: "loopback bulk failure".to_string(),
            })),
            BulkMode::Hang => {
                if let Ok(mut parked) = self.parked.lock() {
                    parked.push(completer);
                }
            }
            BulkMode::Delay(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    completer.complete(Ok(()));
                });
            }
        }
        Ok(completion)
    }
}
