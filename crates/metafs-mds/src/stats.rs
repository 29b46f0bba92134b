//! Request handling counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::wire::MdsOpcode;

/// Snapshot of MDS counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MdsStatsSnapshot {
    /// Packets taken off the intake queue.
    pub received: u64,
    /// Success replies sent.
    pub replied: u64,
    /// Error replies sent.
    pub error_replies: u64,
    /// Packets dropped without a reply.
    pub dropped: u64,
    /// Requests whose opcode missed the routing table.
    pub unknown_opcodes: u64,
    /// Replies the transport failed to send.
    pub reply_failures: u64,
    /// Bulk transfers acknowledged.
    pub bulk_sent: u64,
    /// Bulk transfers interrupted or timed out.
    pub bulk_interrupted: u64,
    /// Bulk transfers that failed otherwise.
    pub bulk_failed: u64,
    /// Requests whose handler panicked.
    pub handler_panics: u64,
    /// Requests handled, by opcode name.
    pub handled: BTreeMap<String, u64>,
}

/// Thread-safe MDS counters.
pub struct MdsStats {
    received: AtomicU64,
    replied: AtomicU64,
    error_replies: AtomicU64,
    dropped: AtomicU64,
    unknown_opcodes: AtomicU64,
    reply_failures: AtomicU64,
    bulk_sent: AtomicU64,
    bulk_interrupted: AtomicU64,
    bulk_failed: AtomicU64,
    handler_panics: AtomicU64,
    handled: [AtomicU64; MdsOpcode::ALL.len()],
}

impl Default for MdsStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MdsStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdsStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

fn opcode_slot(op: MdsOpcode) -> usize {
    MdsOpcode::ALL
        .iter()
        .position(|o| *o == op)
        .unwrap_or_default()
}

impl MdsStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            replied: AtomicU64::new(0),
            error_replies: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unknown_opcodes: AtomicU64::new(0),
            reply_failures: AtomicU64::new(0),
            bulk_sent: AtomicU64::new(0),
            bulk_interrupted: AtomicU64::new(0),
            bulk_failed: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            handled: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Counts a packet taken off the queue.
    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a success reply.
    pub fn inc_replied(&self) {
        self.replied.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an error reply.
    pub fn inc_error_replies(&self) {
        self.error_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a dropped packet.
    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a routing-table miss.
    pub fn inc_unknown_opcodes(&self) {
        self.unknown_opcodes.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a reply the transport could not send.
    pub fn inc_reply_failures(&self) {
        self.reply_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an acknowledged bulk transfer.
    pub fn inc_bulk_sent(&self) {
        self.bulk_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an interrupted bulk transfer.
    pub fn inc_bulk_interrupted(&self) {
        self.bulk_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed bulk transfer.
    pub fn inc_bulk_failed(&self) {
        self.bulk_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request abandoned by a panicking handler.
    pub fn inc_handler_panics(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request routed to `op`'s handler.
    pub fn inc_handled(&self, op: MdsOpcode) {
        self.handled[opcode_slot(op)].fetch_add(1, Ordering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MdsStatsSnapshot {
        MdsStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            error_replies: self.error_replies.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unknown_opcodes: self.unknown_opcodes.load(Ordering::Relaxed),
            reply_failures: self.reply_failures.load(Ordering::Relaxed),
            bulk_sent: self.bulk_sent.load(Ordering::Relaxed),
            bulk_interrupted: self.bulk_interrupted.load(Ordering::Relaxed),
            bulk_failed: self.bulk_failed.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            handled: MdsOpcode::ALL
                .iter()
                .map(|op| {
                    (
                        op.name().to_string(),
                        self.handled[opcode_slot(*op)].load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }
}
