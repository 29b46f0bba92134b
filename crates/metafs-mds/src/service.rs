//! Service lifecycle: mount, start workers, stop workers, unmount.
//!
//! [`MdsService::setup`] and [`MdsService::teardown`] are serialized by one
//! async mutex, which also guards the running state. Requests are only routed
//! while that state exists: the intake queue is created by `setup` and closed
//! by `teardown`, and workers exit once it drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use metafs_transport::{BufferPool, IncomingRequest, ServiceRegistration, Transport};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{FsType, InodeDeleteHook, MdsFilesystem, Mounter};
use crate::bulk::BulkChannel;
use crate::config::MdsConfig;
use crate::dispatcher::{Dispatcher, RoutingTable};
use crate::fault::FaultInjector;
use crate::handlers::{default_handlers, ServerState};
use crate::resolver::HandleResolver;
use crate::stats::MdsStats;
use crate::types::{InodeAttr, MdsError};

/// Delete hook that clears the stored object id before an inode is reclaimed.
#[derive(Debug, Default)]
pub struct ObjectIdClearHook {
    cleared: AtomicU64,
}

impl ObjectIdClearHook {
    /// Creates a hook with a zero invocation count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inodes passed through the hook.
    pub fn invocations(&self) -> u64 {
        self.cleared.load(Ordering::Relaxed)
    }
}

impl InodeDeleteHook for ObjectIdClearHook {
    fn before_delete(&self, attr: &mut InodeAttr) {
        if attr.objid != 0 {
            debug!(ino = %attr.ino, objid = attr.objid, "clearing object id");
        }
        attr.objid = 0;
        self.cleared.fetch_add(1, Ordering::Relaxed);
    }
}

struct Running {
    fs: Arc<dyn MdsFilesystem>,
    fstype: FsType,
    hook: Arc<ObjectIdClearHook>,
    previous_hook: Option<Arc<dyn InodeDeleteHook>>,
    registration: ServiceRegistration,
    intake: mpsc::Sender<IncomingRequest>,
    workers: Vec<JoinHandle<()>>,
}

/// The metadata server.
pub struct MdsService {
    config: MdsConfig,
    mounter: Arc<dyn Mounter>,
    transport: Arc<dyn Transport>,
    faults: Arc<FaultInjector>,
    stats: Arc<MdsStats>,
    sessions: DashSet<Uuid>,
    running: Mutex<Option<Running>>,
}

impl MdsService {
    /// Creates a stopped service. The `[fault]` section of `config` is
    /// applied to the service's fault injector.
    pub fn new(config: MdsConfig, mounter: Arc<dyn Mounter>, transport: Arc<dyn Transport>) -> Self {
        let faults = Arc::new(FaultInjector::new());
        config.fault.apply(&faults);
        Self {
            config,
            mounter,
            transport,
            faults,
            stats: Arc::new(MdsStats::new()),
            sessions: DashSet::new(),
            running: Mutex::new(None),
        }
    }

    /// Configuration the service was built with.
    pub fn config(&self) -> &MdsConfig {
        &self.config
    }

    /// Request counters.
    pub fn stats(&self) -> Arc<MdsStats> {
        self.stats.clone()
    }

    /// Fail points.
    pub fn faults(&self) -> Arc<FaultInjector> {
        self.faults.clone()
    }

    /// True between a successful `setup` and the matching `teardown`.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// The mounted filesystem, while running.
    pub async fn filesystem(&self) -> Option<Arc<dyn MdsFilesystem>> {
        self.running.lock().await.as_ref().map(|r| r.fs.clone())
    }

    /// The filesystem type the backing store was validated as, while running.
    pub async fn fs_type(&self) -> Option<FsType> {
        self.running.lock().await.as_ref().map(|r| r.fstype)
    }

    /// The installed delete hook, while running.
    pub async fn delete_hook(&self) -> Option<Arc<ObjectIdClearHook>> {
        self.running.lock().await.as_ref().map(|r| r.hook.clone())
    }

    /// Mounts the backing filesystem, installs the delete hook, registers
    /// the service and starts the workers.
    pub async fn setup(&self) -> Result<(), MdsError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(MdsError::AlreadyRunning);
        }
        self.config.validate()?;

        let mount = &self.config.mount;
        let fs = self.mounter.mount(&mount.fstype, &mount.device)?;
        let fstype = match fs.fs_type().parse::<FsType>() {
            Ok(t) => t,
            Err(e) => {
                error!(fstype = %fs.fs_type(), device = %mount.device, "unsupported MDS filesystem type");
                self.release_mount(fs);
                return Err(e);
            }
        };

        let hook = Arc::new(ObjectIdClearHook::new());
        let previous_hook = fs.install_delete_hook(hook.clone());

        let routes = match RoutingTable::new(default_handlers()) {
            Ok(r) => r,
            Err(e) => {
                restore_hook(&fs, previous_hook);
                self.release_mount(fs);
                return Err(e);
            }
        };
        let state = ServerState {
            resolver: Arc::new(HandleResolver::new(fs.clone())),
            bulk: BulkChannel::new(
                self.transport.clone(),
                self.faults.clone(),
                self.stats.clone(),
                self.config.bulk_timeout(),
            ),
            pages: BufferPool::new(self.config.service.page_buffers),
            faults: self.faults.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            state,
            routes,
            self.transport.clone(),
            self.stats.clone(),
        ));

        let name = &self.config.service.name;
        let (intake, rx) = mpsc::channel(self.config.service.queue_depth);
        let registration = match self.transport.register_service(name, intake.clone()).await {
            Ok(r) => r,
            Err(e) => {
                error!(service = %name, error = %e, "service registration failed");
                restore_hook(&fs, previous_hook);
                self.release_mount(fs);
                return Err(e.into());
            }
        };

        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..self.config.service.workers)
            .map(|id| spawn_worker(id, rx.clone(), dispatcher.clone()))
            .collect();

        info!(
            service = %name,
            fstype = %fstype,
            device = %mount.device,
            workers = self.config.service.workers,
            "MDS service started"
        );
        *running = Some(Running {
            fs,
            fstype,
            hook,
            previous_hook,
            registration,
            intake,
            workers,
        });
        Ok(())
    }

    /// Stops the service. Fails with `Busy` while client sessions remain;
    /// otherwise unregisters, drains and joins the workers, restores the
    /// previous delete hook and unmounts.
    pub async fn teardown(&self) -> Result<(), MdsError> {
        let mut guard = self.running.lock().await;
        if guard.is_none() {
            return Err(MdsError::NotRunning);
        }
        let clients = self.sessions.len();
        if clients > 0 {
            warn!(clients, "refusing teardown with attached clients");
            return Err(MdsError::Busy(clients));
        }
        let Running {
            fs,
            fstype: _,
            hook,
            previous_hook,
            registration,
            intake,
            workers,
        } = guard.take().ok_or(MdsError::NotRunning)?;

        self.transport.unregister_service(registration).await;
        drop(intake);

        let mut result = Ok(());
        for (id, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(worker = id, error = %e, "worker did not exit cleanly");
                result = Err(MdsError::Internal(format!("worker {} failed: {}", id, e)));
            }
        }

        restore_hook(&fs, previous_hook);
        self.mounter.unmount(fs)?;
        info!(cleared = hook.invocations(), "MDS service stopped");
        result
    }

    /// Hands a request to the workers. Waits while the queue is full.
    pub async fn submit(&self, request: IncomingRequest) -> Result<(), MdsError> {
        let intake = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.intake.clone())
            .ok_or(MdsError::NotRunning)?;
        intake.send(request).await.map_err(|_| MdsError::NotRunning)
    }

    /// Attaches a client session.
    pub fn connect_client(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(id);
        debug!(client = %id, "client connected");
        id
    }

    /// Detaches a client session.
    pub fn disconnect_client(&self, id: &Uuid) -> Result<(), MdsError> {
        if self.sessions.remove(id).is_none() {
            return Err(MdsError::NotFound(format!("client session {}", id)));
        }
        debug!(client = %id, "client disconnected");
        Ok(())
    }

    /// Number of attached client sessions.
    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    fn release_mount(&self, fs: Arc<dyn MdsFilesystem>) {
        if let Err(e) = self.mounter.unmount(fs) {
            warn!(error = %e, "failed to release mount");
        }
    }
}

fn restore_hook(fs: &Arc<dyn MdsFilesystem>, previous: Option<Arc<dyn InodeDeleteHook>>) {
    match previous {
        Some(hook) => {
            fs.install_delete_hook(hook);
        }
        None => {
            fs.remove_delete_hook();
        }
    }
}

fn spawn_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<IncomingRequest>>>,
    dispatcher: Arc<Dispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(worker = id, "worker started");
        loop {
            let next = rx.lock().await.recv().await;
            let Some(request) = next else {
                break;
            };
            // A panicking handler ends only this task.
            let task = tokio::spawn({
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(request).await }
            });
            match task.await {
                Ok(outcome) => debug!(worker = id, ?outcome, "request finished"),
                Err(e) => {
                    dispatcher.stats().inc_handler_panics();
                    error!(worker = id, error = %e, "request handler panicked");
                }
            }
        }
        debug!(worker = id, "worker stopped");
    })
}
