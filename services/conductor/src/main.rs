//! fleet conductor
//!
//! Runs the compute task service. Dev mode wires every collaborator in
//! process: in-memory stores, a capacity scheduler over `FLEET_DEV_HOSTS`
//! and compute agents that acknowledge every operation.
//!
//! There is no intake surface: the binary wires the stack and idles until
//! ctrl-c. Requests are submitted through the library's `ConductorHandle`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use fleet_conductor::{
    config::ConductorConfig,
    dispatch::{HandlerRegistry, LocalTransport, RpcDispatcher},
    image::InMemoryImageService,
    model::HostRecord,
    notifier::LogNotifier,
    quota::InMemoryQuotaEngine,
    registry::{InMemoryHostRegistry, InMemoryInstanceStore, InMemoryMigrationStore},
    scheduler::CapacityScheduler,
    service, Collaborators, ComputeTaskManager, TaskContext,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Requests queued before producers wait.
const QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConductorConfig::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet conductor");
    info!(
        max_attempts = config.scheduler_max_attempts,
        version_cap = %config.compute_version_cap,
        "Configuration loaded"
    );

    if !config.dev_mode {
        bail!("only dev mode is available in this build; set FLEET_DEV=true");
    }

    let manager = ComputeTaskManager::new(dev_context(config));
    let (handle, conductor) = service::channel(manager, QUEUE_CAPACITY);
    info!(
        queue_capacity = QUEUE_CAPACITY,
        "Conductor ready; no intake is wired in dev mode, requests go through the library handle"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let conductor_handle = tokio::spawn(conductor.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    drop(handle);

    info!("Waiting for in-flight workflows...");
    if let Err(e) = tokio::time::timeout(Duration::from_secs(30), conductor_handle).await {
        warn!(error = %e, "Conductor did not shut down in time");
    }

    info!("Conductor shutdown complete");
    Ok(())
}

fn dev_context(config: ConductorConfig) -> TaskContext {
    let hosts = Arc::new(InMemoryHostRegistry::new());
    let transport = Arc::new(LocalTransport::new());
    for host in &config.dev_hosts {
        hosts.upsert(HostRecord::new(host.as_str(), 16, 65536, 1000));
        transport.register_agent(host, HandlerRegistry::acknowledging(host));
        info!(host = %host, "Registered dev compute host");
    }

    let dispatcher = Arc::new(RpcDispatcher::new(transport, &config));
    let collaborators = Collaborators {
        instances: Arc::new(InMemoryInstanceStore::new()),
        migrations: Arc::new(InMemoryMigrationStore::new()),
        hosts: hosts.clone(),
        images: Arc::new(InMemoryImageService::new()),
        quotas: Arc::new(InMemoryQuotaEngine::new()),
        scheduler: Arc::new(CapacityScheduler::new(hosts)),
        dispatcher,
        notifier: Arc::new(LogNotifier),
    };
    TaskContext::new(config, collaborators)
}
