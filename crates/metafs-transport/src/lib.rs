#![warn(missing_docs)]

//! metafs transport subsystem: RPC packet codec, loopback and TCP transports,
//! cancellation, and page buffers for bulk transfers.

pub mod buffer;
pub mod cancel;
pub mod error;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use buffer::{BufferPool, BufferPoolStats, PageBuffer, PAGE_SIZE};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use error::{Result, TransportError};
pub use protocol::{PacketHeader, PacketType, ReplyEnvelope, RequestEnvelope, HEADER_SIZE};
pub use transport::{
    BulkCompletion, IncomingRequest, LoopbackTransport, Niobuf, Peer, ServiceRegistration,
    Transport,
};
