//! Request dispatch: decode, route, execute, reply.
//!
//! Every packet ends in exactly one outbound action. Undecodable packets are
//! dropped and logged; an opcode missing from the routing table gets an
//! `EPROTO` reply; everything else gets the handler's reply, or an error
//! reply carrying only the status.

use std::collections::HashMap;
use std::sync::Arc;

use metafs_transport::protocol::{decode_request, encode_reply};
use metafs_transport::{IncomingRequest, Peer, ReplyEnvelope, Transport};
use tracing::{debug, error, warn};

use crate::fault::FailPoint;
use crate::handlers::{OperationHandler, RequestContext, ServerState};
use crate::stats::MdsStats;
use crate::types::{status, MdsError};
use crate::wire::{MdsOpcode, MdsRequest};

/// Opcode to handler map, covering every declared opcode exactly once.
pub struct RoutingTable {
    routes: HashMap<u32, Arc<dyn OperationHandler>>,
}

impl RoutingTable {
    /// Builds the table, rejecting duplicate or missing opcodes.
    pub fn new(handlers: Vec<Arc<dyn OperationHandler>>) -> Result<Self, MdsError> {
        let mut routes = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let op = handler.opcode();
            if routes.insert(op.as_u32(), handler).is_some() {
                return Err(MdsError::Config(format!("opcode {} routed twice", op)));
            }
        }
        if let Some(missing) = MdsOpcode::ALL
            .iter()
            .find(|op| !routes.contains_key(&op.as_u32()))
        {
            return Err(MdsError::Config(format!("opcode {} has no handler", missing)));
        }
        Ok(Self { routes })
    }

    /// Handler for a raw opcode.
    pub fn route(&self, opcode: u32) -> Option<&Arc<dyn OperationHandler>> {
        self.routes.get(&opcode)
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True if no routes exist.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// What the dispatcher did with a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A reply with this status was handed to the transport.
    Replied {
        /// Transaction id.
        xid: u64,
        /// Reply status.
        status: i32,
    },
    /// A reply was built but the transport refused it.
    SendFailed {
        /// Transaction id.
        xid: u64,
    },
    /// No reply; the packet was undecodable.
    Dropped {
        /// Why.
        reason: String,
    },
}

/// Serves decoded requests against a mounted filesystem.
pub struct Dispatcher {
    state: ServerState,
    routes: RoutingTable,
    transport: Arc<dyn Transport>,
    stats: Arc<MdsStats>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        state: ServerState,
        routes: RoutingTable,
        transport: Arc<dyn Transport>,
        stats: Arc<MdsStats>,
    ) -> Self {
        Self {
            state,
            routes,
            transport,
            stats,
        }
    }

    /// Handler state.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Counters this dispatcher updates.
    pub fn stats(&self) -> &Arc<MdsStats> {
        &self.stats
    }

    fn drop_packet(&self, reason: String) -> DispatchOutcome {
        self.stats.inc_dropped();
        DispatchOutcome::Dropped { reason }
    }

    /// Handles one packet to completion.
    pub async fn dispatch(&self, incoming: IncomingRequest) -> DispatchOutcome {
        self.stats.inc_received();
        let IncomingRequest {
            peer,
            packet,
            cancel,
        } = incoming;

        let envelope = match decode_request(&packet) {
            Ok(env) => env,
            Err(e) => {
                error!(nid = peer.nid, error = %e, "dropping malformed packet");
                return self.drop_packet(e.to_string());
            }
        };
        let (xid, opcode) = (envelope.xid, envelope.opcode);

        let Some(handler) = self.routes.route(opcode) else {
            warn!(xid, opcode, "unknown opcode");
            self.stats.inc_unknown_opcodes();
            return self
                .send(peer, ReplyEnvelope::error(xid, opcode, status::EPROTO))
                .await;
        };

        let body = MdsRequest::decode(&envelope.payload);
        let body = match body {
            Ok(body) if !self.state.faults.check(FailPoint::HandleUnpack) => body,
            Ok(_) => {
                error!(xid, opcode, "invalid request (injected)");
                return self.drop_packet("injected unpack failure".to_string());
            }
            Err(e) => {
                error!(xid, opcode, error = %e, "invalid request");
                return self.drop_packet(e.to_string());
            }
        };

        let op = handler.opcode();
        self.stats.inc_handled(op);
        debug!(xid, opcode = %op, nid = peer.nid, "routing request");

        let ctx = RequestContext { peer, xid, cancel };
        // A forced net or pack failure skips the handler.
        let forced = self
            .state
            .faults
            .checkpoint(handler.net_point())
            .or_else(|| {
                handler
                    .pack_point()
                    .and_then(|p| self.state.faults.checkpoint(p))
            });
        let result = match forced {
            Some(rc) => Err(MdsError::Forced(rc)),
            None => handler.handle(&self.state, &ctx, &body).await,
        };

        let reply = match result {
            Ok(reply) => ReplyEnvelope {
                xid,
                opcode,
                status: status::OK,
                payload: reply.encode(),
            },
            Err(e) => {
                debug!(xid, opcode = %op, error = %e, "request failed");
                ReplyEnvelope::error(xid, opcode, e.status())
            }
        };
        self.send(peer, reply).await
    }

    async fn send(&self, peer: Peer, reply: ReplyEnvelope) -> DispatchOutcome {
        let (xid, rc) = (reply.xid, reply.status);
        match self.transport.send_reply(peer, encode_reply(&reply)).await {
            Ok(()) => {
                if rc == status::OK {
                    self.stats.inc_replied();
                } else {
                    self.stats.inc_error_replies();
                }
                DispatchOutcome::Replied { xid, status: rc }
            }
            Err(e) => {
                warn!(xid, nid = peer.nid, error = %e, "reply send failed");
                self.stats.inc_reply_failures();
                DispatchOutcome::SendFailed { xid }
            }
        }
    }
}
