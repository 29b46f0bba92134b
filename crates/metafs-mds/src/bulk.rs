//! Bulk transfer channel.
//!
//! Page-sized reply data goes to the peer's niobuf on a separate path. The
//! calling worker waits for the transport to acknowledge the transfer, for
//! the request to be cancelled, or for the timeout, whichever comes first.
//! The page buffer is owned by the descriptor, so every exit path hands it
//! back to the pool exactly once.

use std::sync::Arc;
use std::time::Duration;

use metafs_transport::{CancelToken, Niobuf, PageBuffer, Peer, Transport, TransportError};
use tracing::{debug, warn};

use crate::fault::{FailPoint, FaultInjector};
use crate::stats::MdsStats;
use crate::types::MdsError;

/// Lifecycle of one bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    /// Built, not yet handed to the transport.
    Pending,
    /// Posted, waiting for completion.
    Sent,
    /// Peer acknowledged the data.
    Acked,
    /// Cancelled, interrupted by the transport, or timed out.
    Interrupted,
    /// Transport or injected failure.
    Failed,
}

/// One in-flight transfer. Never shared between transfers.
#[derive(Debug)]
pub struct BulkDescriptor {
    xid: u64,
    state: BulkState,
    buffer: PageBuffer,
}

impl BulkDescriptor {
    /// Wraps the source buffer for transfer `xid`.
    pub fn new(xid: u64, buffer: PageBuffer) -> Self {
        Self {
            xid,
            state: BulkState::Pending,
            buffer,
        }
    }

    /// Transaction id.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Current state.
    pub fn state(&self) -> BulkState {
        self.state
    }

    /// Bytes to transfer.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }
}

/// Sends bulk data through a transport.
pub struct BulkChannel {
    transport: Arc<dyn Transport>,
    faults: Arc<FaultInjector>,
    stats: Arc<MdsStats>,
    timeout: Duration,
}

impl BulkChannel {
    /// Creates a channel; transfers not acknowledged within `timeout` are
    /// treated as interrupted.
    pub fn new(
        transport: Arc<dyn Transport>,
        faults: Arc<FaultInjector>,
        stats: Arc<MdsStats>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            faults,
            stats,
            timeout,
        }
    }

    /// Transfers `desc` to `dst` on `peer` and waits for the outcome. The
    /// descriptor, and with it the buffer, is consumed on every path.
    pub async fn send(
        &self,
        peer: Peer,
        mut desc: BulkDescriptor,
        dst: Niobuf,
        cancel: &CancelToken,
    ) -> Result<(), MdsError> {
        let xid = desc.xid;
        let res = self.transfer(peer, &mut desc, dst, cancel).await;
        match desc.state {
            BulkState::Acked => self.stats.inc_bulk_sent(),
            BulkState::Interrupted => self.stats.inc_bulk_interrupted(),
            _ => self.stats.inc_bulk_failed(),
        }
        debug!(xid, state = ?desc.state, len = desc.buffer.len(), "bulk transfer finished");
        res
    }

    async fn transfer(
        &self,
        peer: Peer,
        desc: &mut BulkDescriptor,
        dst: Niobuf,
        cancel: &CancelToken,
    ) -> Result<(), MdsError> {
        let xid = desc.xid;
        if (dst.len as usize) < desc.buffer.len() {
            desc.state = BulkState::Failed;
            return Err(MdsError::InvalidArgument(format!(
                "niobuf holds {} bytes, page has {}",
                dst.len,
                desc.buffer.len()
            )));
        }

        let completion = match self.transport.post_bulk(peer, xid, dst, &desc.buffer) {
            Ok(c) => c,
            Err(e) => {
                desc.state = BulkState::Failed;
                warn!(xid, error = %e, "bulk post failed");
                return Err(e.into());
            }
        };
        desc.state = BulkState::Sent;

        if self.faults.check(FailPoint::Sendpage) {
            desc.state = BulkState::Failed;
            return Err(MdsError::InjectedFailure(FailPoint::Sendpage.id()));
        }

        let outcome = tokio::select! {
            res = completion.wait() => res,
            _ = cancel.cancelled() => Err(TransportError::Interrupted { xid }),
            _ = tokio::time::sleep(self.timeout) => Err(TransportError::Timeout {
                xid,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(()) => {
                desc.state = BulkState::Acked;
                Ok(())
            }
            Err(e) => {
                let err = MdsError::from(e);
                desc.state = match err {
                    MdsError::Interrupted { .. } => BulkState::Interrupted,
                    _ => BulkState::Failed,
                };
                warn!(xid, error = %err, "bulk transfer did not complete");
                Err(err)
            }
        }
    }
}
