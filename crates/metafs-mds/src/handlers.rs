//! One handler per MDS opcode.
//!
//! Handlers share one shape: resolve the identifier, call the backing
//! filesystem, fill the reply, release what was resolved. Errors come back
//! as [`MdsError`] and the dispatcher turns them into reply statuses.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metafs_transport::{BufferPool, CancelToken, Niobuf, Peer};
use tracing::{debug, warn};

use crate::backend::{MdsFilesystem, OpenFlags};
use crate::bulk::{BulkChannel, BulkDescriptor};
use crate::fault::{FailPoint, FaultInjector};
use crate::reint::UpdateRecord;
use crate::resolver::HandleResolver;
use crate::types::MdsError;
use crate::wire::{MdsOpcode, MdsReply, MdsRequest};

/// Everything a handler may touch while serving a request.
pub struct ServerState {
    /// Identifier resolution against the mounted filesystem.
    pub resolver: Arc<HandleResolver>,
    /// Bulk path for page data.
    pub bulk: BulkChannel,
    /// Page buffers for READPAGE.
    pub pages: Arc<BufferPool>,
    /// Fail points.
    pub faults: Arc<FaultInjector>,
}

impl ServerState {
    /// The mounted filesystem.
    pub fn fs(&self) -> &Arc<dyn MdsFilesystem> {
        self.resolver.fs()
    }
}

/// Per-request data that is not part of the body.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Sender.
    pub peer: Peer,
    /// Transaction id.
    pub xid: u64,
    /// Fires if the sender goes away.
    pub cancel: CancelToken,
}

/// Serves one opcode.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Opcode served.
    fn opcode(&self) -> MdsOpcode;

    /// Fail point checked after decode; a hit replaces the handler.
    fn net_point(&self) -> FailPoint;

    /// Fail point for reply packing, checked before the handler runs.
    fn pack_point(&self) -> Option<FailPoint>;

    /// Runs the operation.
    async fn handle(
        &self,
        state: &ServerState,
        ctx: &RequestContext,
        req: &MdsRequest,
    ) -> Result<MdsReply, MdsError>;
}

fn not_found(e: MdsError) -> MdsError {
    match e {
        MdsError::StaleHandle(fid) => MdsError::NotFound(fid.to_string()),
        other => other,
    }
}

/// GETATTR: attributes of `fid1`.
pub struct GetattrHandler;

#[async_trait]
impl OperationHandler for GetattrHandler {
    fn opcode(&self) -> MdsOpcode {
        MdsOpcode::Getattr
    }

    fn net_point(&self) -> FailPoint {
        FailPoint::GetattrNet
    }

    fn pack_point(&self) -> Option<FailPoint> {
        Some(FailPoint::GetattrPack)
    }

    async fn handle(
        &self,
        state: &ServerState,
        _ctx: &RequestContext,
        req: &MdsRequest,
    ) -> Result<MdsReply, MdsError> {
        let handle = state.resolver.resolve(req.fid1, false).map_err(not_found)?;
        let mut reply = MdsReply::default();
        reply.fill_attr(handle.attr());
        reply.objid = state.fs().object_id(handle.ino())?;
        Ok(reply)
    }
}

/// OPEN: opens `fid1` with `flags`; the handle value comes back as `objid`.
pub struct OpenHandler;

#[async_trait]
impl OperationHandler for OpenHandler {
    fn opcode(&self) -> MdsOpcode {
        MdsOpcode::Open
    }

    fn net_point(&self) -> FailPoint {
        FailPoint::OpenNet
    }

    fn pack_point(&self) -> Option<FailPoint> {
        Some(FailPoint::OpenPack)
    }

    async fn handle(
        &self,
        state: &ServerState,
        _ctx: &RequestContext,
        req: &MdsRequest,
    ) -> Result<MdsReply, MdsError> {
        let handle = state.resolver.resolve(req.fid1, true).map_err(not_found)?;
        let fs = handle
            .mount()
            .ok_or_else(|| MdsError::Internal("open without mount reference".to_string()))?;
        let objid = fs
            .open_entry(handle.ino(), OpenFlags::from_bits(req.flags))
            .map_err(|e| {
                debug!(ino = %handle.ino(), flags = req.flags, error = %e, "open failed");
                MdsError::InvalidArgument(e.to_string())
            })?;
        Ok(MdsReply {
            ino: handle.ino().as_u64(),
            generation: handle.attr().generation,
            objid,
            ..Default::default()
        })
    }
}

/// CLOSE: closes the handle value in `objid`.
pub struct CloseHandler;

#[async_trait]
impl OperationHandler for CloseHandler {
    fn opcode(&self) -> MdsOpcode {
        MdsOpcode::Close
    }

    fn net_point(&self) -> FailPoint {
        FailPoint::CloseNet
    }

    fn pack_point(&self) -> Option<FailPoint> {
        Some(FailPoint::ClosePack)
    }

    async fn handle(
        &self,
        state: &ServerState,
        _ctx: &RequestContext,
        req: &MdsRequest,
    ) -> Result<MdsReply, MdsError> {
        let handle = state.resolver.resolve(req.fid1, true).map_err(not_found)?;
        let fs = handle
            .mount()
            .ok_or_else(|| MdsError::Internal("close without mount reference".to_string()))?;
        fs.close_handle(req.objid)?;
        Ok(MdsReply::default())
    }
}

/// READPAGE: one page of `fid1` at offset `size`, inline for the local peer
/// and through the bulk channel to the niobuf in `tgt` otherwise.
pub struct ReadpageHandler;

impl ReadpageHandler {
    async fn read_and_deliver(
        &self,
        state: &ServerState,
        ctx: &RequestContext,
        req: &MdsRequest,
        file: u64,
        reply: &mut MdsReply,
    ) -> Result<(), MdsError> {
        let mut page = state.pages.acquire()?;
        let n = state.fs().read_page(file, req.size, page.page_mut())?;
        page.set_len(n);
        reply.size = n as u64;

        if ctx.peer.is_local() {
            reply.data = Bytes::copy_from_slice(&page);
            return Ok(());
        }
        let dst = Niobuf::decode(&req.tgt)
            .map_err(|e| MdsError::InvalidArgument(e.to_string()))?;
        state
            .bulk
            .send(ctx.peer, BulkDescriptor::new(ctx.xid, page), dst, &ctx.cancel)
            .await
    }
}

#[async_trait]
impl OperationHandler for ReadpageHandler {
    fn opcode(&self) -> MdsOpcode {
        MdsOpcode::Readpage
    }

    fn net_point(&self) -> FailPoint {
        FailPoint::ReadpageNet
    }

    fn pack_point(&self) -> Option<FailPoint> {
        Some(FailPoint::ReadpagePack)
    }

    async fn handle(
        &self,
        state: &ServerState,
        ctx: &RequestContext,
        req: &MdsRequest,
    ) -> Result<MdsReply, MdsError> {
        let handle = state.resolver.resolve(req.fid1, true)?;
        debug!(ino = %handle.ino(), offset = req.size, "readpage");
        let fs = handle
            .mount()
            .ok_or_else(|| MdsError::Internal("readpage without mount reference".to_string()))?;
        let file = fs.open_entry(handle.ino(), OpenFlags::READ_ONLY | OpenFlags::LARGEFILE)?;

        let mut reply = MdsReply {
            ino: handle.ino().as_u64(),
            generation: handle.attr().generation,
            ..Default::default()
        };
        let res = self
            .read_and_deliver(state, ctx, req, file, &mut reply)
            .await;
        if let Err(e) = fs.close_handle(file) {
            warn!(xid = ctx.xid, error = %e, "readpage close failed");
        }
        res.map(|()| reply)
    }
}

/// REINT: decodes the update record in `tgt` and applies it.
pub struct ReintHandler;

#[async_trait]
impl OperationHandler for ReintHandler {
    fn opcode(&self) -> MdsOpcode {
        MdsOpcode::Reint
    }

    fn net_point(&self) -> FailPoint {
        FailPoint::ReintNet
    }

    fn pack_point(&self) -> Option<FailPoint> {
        None
    }

    async fn handle(
        &self,
        state: &ServerState,
        ctx: &RequestContext,
        req: &MdsRequest,
    ) -> Result<MdsReply, MdsError> {
        let record = UpdateRecord::decode(&req.tgt);
        if state.faults.check(FailPoint::ReintUnpack) {
            return Err(MdsError::InvalidArgument("injected record failure".to_string()));
        }
        let record = record.map_err(|e| {
            warn!(xid = ctx.xid, error = %e, "invalid update record");
            e
        })?;
        let applied = record
            .apply(state.fs().as_ref())
            .map_err(|failure| failure.error)?;
        debug!(xid = ctx.xid, applied, "update record applied");
        Ok(MdsReply::default())
    }
}

/// The handler for every declared opcode.
pub fn default_handlers() -> Vec<Arc<dyn OperationHandler>> {
    vec![
        Arc::new(GetattrHandler),
        Arc::new(OpenHandler),
        Arc::new(CloseHandler),
        Arc::new(ReadpageHandler),
        Arc::new(ReintHandler),
    ]
}
