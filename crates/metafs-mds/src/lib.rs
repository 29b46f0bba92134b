#![warn(missing_docs)]

//! metafs metadata server: request dispatch, handle resolution, bulk page
//! transfer, update records, and the service lifecycle around them.

pub mod backend;
pub mod bulk;
pub mod config;
pub mod dispatcher;
pub mod fault;
pub mod handlers;
pub mod memfs;
pub mod reint;
pub mod resolver;
pub mod service;
pub mod stats;
pub mod types;
pub mod wire;

pub use backend::{FsType, MdsFilesystem, Mounter};
pub use config::MdsConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, RoutingTable};
pub use fault::{FailPoint, FaultInjector};
pub use memfs::{MemoryFs, MemoryMounter};
pub use service::{MdsService, ObjectIdClearHook};
pub use stats::{MdsStats, MdsStatsSnapshot};
pub use types::{status, FileIdentifier, InodeAttr, InodeId, MdsError};
pub use wire::{MdsOpcode, MdsReply, MdsRequest};
