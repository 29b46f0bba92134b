//! Transport error type.

use thiserror::Error;

/// Errors raised by the packet codec and the transport adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The packet could not be decoded: wrong packet type, short buffer, or a
    /// length field that disagrees with the buffer size.
    #[error("malformed packet: {reason}")]
    MalformedPacket {
        /// What was wrong with the packet.
        reason: String,
    },

    /// The peer is not (or no longer) connected.
    #[error("peer {nid}:{conn} not connected")]
    NotConnected {
        /// Network id of the peer.
        nid: u64,
        /// Connection id of the peer.
        conn: u64,
    },

    /// A bulk transfer was interrupted before it was acknowledged.
    #[error("bulk transfer {xid} interrupted")]
    Interrupted {
        /// Transaction id of the interrupted transfer.
        xid: u64,
    },

    /// A bulk transfer was not acknowledged in time.
    #[error("bulk transfer {xid} timed out after {timeout_ms}ms")]
    Timeout {
        /// Transaction id of the transfer.
        xid: u64,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The transport failed to move data.
    #[error("transport failure: {reason}")]
    TransportFailure {
        /// Failure description.
        reason: String,
    },

    /// A service with this name is already registered.
    #[error("service {0} already registered")]
    ServiceExists(String),

    /// No buffer could be allocated for a transfer.
    #[error("buffer pool exhausted ({max_count} buffers in use)")]
    PoolExhausted {
        /// Pool capacity.
        max_count: usize,
    },

    /// Socket level error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        TransportError::MalformedPacket {
            reason: reason.into(),
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
