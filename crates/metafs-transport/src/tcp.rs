//! TCP transport: length-prefixed packets over tokio sockets.
//!
//! Each accepted connection gets its own nid (never 0, which is reserved for
//! the local node), a writer task fed by an unbounded queue, and a cancel
//! pair that fires when the connection drops so pending bulk waits for that
//! peer are interrupted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::error::{Result, TransportError};
use crate::protocol::{encode_bulk, HEADER_SIZE, MAX_PAYLOAD};
use crate::transport::{
    BulkCompleter, BulkCompletion, IncomingRequest, Niobuf, Peer, ServiceRegistration, Transport,
};

struct Outbound {
    packet: Bytes,
    done: Option<BulkCompleter>,
}

struct Registration {
    accept: JoinHandle<()>,
    shutdown: CancelHandle,
}

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    listen_addr: String,
    next_id: Arc<AtomicU64>,
    conns: Arc<DashMap<u64, mpsc::UnboundedSender<Outbound>>>,
    registrations: Mutex<HashMap<u64, Registration>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpTransport {
    /// Creates a transport that will listen on `listen_addr` once a service
    /// registers.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            next_id: Arc::new(AtomicU64::new(1)),
            conns: Arc::new(DashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            local_addr: Mutex::new(None),
        }
    }

    /// Address actually bound, once a service is registered.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn queue(&self, peer: Peer, out: Outbound) -> Result<()> {
        let tx = self
            .conns
            .get(&peer.conn)
            .map(|c| c.value().clone())
            .ok_or(TransportError::NotConnected {
                nid: peer.nid,
                conn: peer.conn,
            })?;
        tx.send(out).map_err(|_| TransportError::NotConnected {
            nid: peer.nid,
            conn: peer.conn,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    intake: mpsc::Sender<IncomingRequest>,
    conns: Arc<DashMap<u64, mpsc::UnboundedSender<Outbound>>>,
    next_id: Arc<AtomicU64>,
    shutdown: CancelToken,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.cancelled() => break,
        };
        let (stream, addr) = match accepted {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let conn = next_id.fetch_add(1, Ordering::Relaxed);
        let peer = Peer::new(conn, conn);
        debug!(%addr, nid = peer.nid, "accepted connection");
        tokio::spawn(serve_connection(
            stream,
            peer,
            intake.clone(),
            conns.clone(),
            shutdown.clone(),
        ));
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: Peer,
    intake: mpsc::Sender<IncomingRequest>,
    conns: Arc<DashMap<u64, mpsc::UnboundedSender<Outbound>>>,
    shutdown: CancelToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    conns.insert(peer.conn, out_tx);

    let writer_task = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let res = write_packet(&mut writer, &out.packet).await;
            let failed = res.is_err();
            if let Some(done) = out.done {
                done.complete(res);
            } else if let Err(e) = res {
                warn!(error = %e, nid = peer.nid, "reply write failed");
            }
            if failed {
                break;
            }
        }
    });

    let (token, handle) = new_cancel_pair();
    loop {
        let packet = tokio::select! {
            res = read_packet(&mut reader) => res,
            _ = shutdown.cancelled() => break,
        };
        match packet {
            Ok(packet) => {
                let req = IncomingRequest {
                    peer,
                    packet,
                    cancel: token.clone(),
                };
                if intake.send(req).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, nid = peer.nid, "connection closed");
                break;
            }
        }
    }

    handle.cancel(CancelReason::ClientDisconnected);
    conns.remove(&peer.conn);
    writer_task.abort();
}

async fn read_packet(reader: &mut tokio::net::tcp::OwnedReadHalf) -> Result<Bytes> {
    let len = reader.read_u32().await? as usize;
    if len < HEADER_SIZE || len > HEADER_SIZE + MAX_PAYLOAD {
        return Err(TransportError::MalformedPacket {
            reason: format!("frame length {} out of range", len),
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_packet(writer: &mut tokio::net::tcp::OwnedWriteHalf, packet: &[u8]) -> Result<()> {
    writer.write_u32(packet.len() as u32).await?;
    writer.write_all(packet).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn register_service(
        &self,
        name: &str,
        intake: mpsc::Sender<IncomingRequest>,
    ) -> Result<ServiceRegistration> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        if let Ok(mut local) = self.local_addr.lock() {
            *local = Some(addr);
        }
        let (shutdown_token, shutdown) = new_cancel_pair();
        let accept = tokio::spawn(accept_loop(
            listener,
            intake,
            self.conns.clone(),
            self.next_id.clone(),
            shutdown_token,
        ));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .lock()
            .map_err(|_| TransportError::TransportFailure {
                reason: "registration table poisoned".to_string(),
            })?
            .insert(id, Registration { accept, shutdown });
        info!(service = name, %addr, "tcp service listening");
        Ok(ServiceRegistration {
            name: name.to_string(),
            id,
        })
    }

    async fn unregister_service(&self, registration: ServiceRegistration) {
        let reg = self
            .registrations
            .lock()
            .ok()
            .and_then(|mut r| r.remove(&registration.id));
        if let Some(reg) = reg {
            reg.shutdown.cancel(CancelReason::ServerShutdown);
            let _ = reg.accept.await;
            info!(service = %registration.name, "tcp service stopped");
        }
    }

    async fn send_reply(&self, peer: Peer, packet: Bytes) -> Result<()> {
        self.queue(peer, Outbound { packet, done: None })
    }

    fn post_bulk(
        &self,
        peer: Peer,
        xid: u64,
        dst: Niobuf,
        data: &[u8],
    ) -> Result<BulkCompletion> {
        let (completer, completion) = BulkCompletion::channel(xid);
        self.queue(
            peer,
            Outbound {
                packet: encode_bulk(xid, dst.addr, data),
                done: Some(completer),
            },
        )?;
        Ok(completion)
    }
}
