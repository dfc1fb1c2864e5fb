//! Service loop.
//!
//! Requests arrive on an mpsc channel and each runs on its own tokio task.
//! On shutdown the loop stops accepting work and waits for in-flight
//! workflows to finish.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::TaskResult;
use crate::manager::{ComputeTaskManager, MigrateOutcome, MigrateServerRequest};
use crate::tasks::{
    BuildReport, BuildRequest, RebuildOutcome, RebuildRequest, UnshelveOutcome, UnshelveRequest,
};

/// A unit of work for the conductor.
#[derive(Debug, Clone)]
pub enum TaskRequest {
    Build(BuildRequest),
    MigrateServer(Box<MigrateServerRequest>),
    Rebuild(Box<RebuildRequest>),
    Unshelve(UnshelveRequest),
}

impl TaskRequest {
    pub fn name(&self) -> &'static str {
        match self {
            TaskRequest::Build(_) => "build_instances",
            TaskRequest::MigrateServer(_) => "migrate_server",
            TaskRequest::Rebuild(_) => "rebuild_instance",
            TaskRequest::Unshelve(_) => "unshelve_instance",
        }
    }
}

/// Result of a [`TaskRequest`].
#[derive(Debug)]
pub enum TaskOutcome {
    Build(TaskResult<BuildReport>),
    MigrateServer(TaskResult<MigrateOutcome>),
    Rebuild(TaskResult<RebuildOutcome>),
    Unshelve(TaskResult<UnshelveOutcome>),
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        match self {
            TaskOutcome::Build(r) => r.is_ok(),
            TaskOutcome::MigrateServer(r) => r.is_ok(),
            TaskOutcome::Rebuild(r) => r.is_ok(),
            TaskOutcome::Unshelve(r) => r.is_ok(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("conductor service is stopped")]
    Stopped,

    #[error("conductor dropped the reply")]
    ReplyDropped,
}

struct Envelope {
    request: TaskRequest,
    reply: Option<oneshot::Sender<TaskOutcome>>,
}

/// Producer side of the service channel.
#[derive(Debug, Clone)]
pub struct ConductorHandle {
    tx: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("request", &self.request.name())
            .field("wants_reply", &self.reply.is_some())
            .finish()
    }
}

impl ConductorHandle {
    /// Queues `request` without waiting for its outcome.
    pub async fn submit(&self, request: TaskRequest) -> Result<(), ServiceError> {
        self.tx
            .send(Envelope {
                request,
                reply: None,
            })
            .await
            .map_err(|_| ServiceError::Stopped)
    }

    /// Queues `request` and waits for its outcome.
    pub async fn submit_and_wait(&self, request: TaskRequest) -> Result<TaskOutcome, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::ReplyDropped)
    }
}

/// Consumer side of the service channel.
pub struct ConductorService {
    manager: ComputeTaskManager,
    rx: mpsc::Receiver<Envelope>,
}

/// Creates a service and its handle with a queue of `capacity` requests.
pub fn channel(manager: ComputeTaskManager, capacity: usize) -> (ConductorHandle, ConductorService) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ConductorHandle { tx }, ConductorService { manager, rx })
}

impl ConductorService {
    /// Runs until `shutdown` flips to true or every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting conductor service");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else {
                        info!("All conductor handles dropped");
                        break;
                    };
                    debug!(request = envelope.request.name(), "Task request received");
                    let manager = self.manager.clone();
                    in_flight.spawn(handle(manager, envelope));
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Workflow task panicked");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Conductor service shutting down");
                        break;
                    }
                }
            }
        }

        self.rx.close();
        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight workflows");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Workflow task panicked");
            }
        }
        info!("Conductor service stopped");
    }
}

async fn handle(manager: ComputeTaskManager, envelope: Envelope) {
    let name = envelope.request.name();
    let outcome = match envelope.request {
        TaskRequest::Build(request) => TaskOutcome::Build(manager.build_instances(request).await),
        TaskRequest::MigrateServer(request) => {
            TaskOutcome::MigrateServer(manager.migrate_server(*request).await)
        }
        TaskRequest::Rebuild(request) => {
            TaskOutcome::Rebuild(manager.rebuild_instance(*request).await)
        }
        TaskRequest::Unshelve(request) => {
            TaskOutcome::Unshelve(manager.unshelve_instance(request).await)
        }
    };

    if !outcome.is_ok() {
        warn!(request = name, outcome = ?outcome, "Task request failed");
    }
    if let Some(reply) = envelope.reply {
        if reply.send(outcome).is_err() {
            debug!(request = name, "Caller stopped waiting for the outcome");
        }
    }
}
