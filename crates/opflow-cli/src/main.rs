//! Opflow Engine Monitor
//!
//! A standalone operator utility that wires the in-memory Store/Bus/
//! Protection/Idempotency adapters into a full engine — Orchestrator,
//! Runtime, Finalizer, Reaper — submits a handful of demo commands, and
//! logs the resulting state transitions. This is explicitly not the
//! "client-facing command/query submission" surface the engine places out
//! of scope; it exists purely as a local smoke-test harness, grounded on
//! `toka-kernel/src/bin/monitor.rs`'s shape (wire collaborators, spawn
//! background tasks, select! on Ctrl+C).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use opflow_bus_memory::MemoryBus;
use opflow_idempotency::MemoryIdempotencyManager;
use opflow_orchestrator::{Orchestrator, OrchestratorConfig, SubmissionHandle};
use opflow_protection::ProtectionChain;
use opflow_runtime::{Executor, Runtime, RuntimeConfig};
use opflow_store_memory::MemoryStore;
use opflow_sweepers::{Finalizer, FinalizerConfig, Reaper, ReaperConfig};
use opflow_types::{BizKey, Command, Domain, EventType, Envelope, IdemKey, Outcome};

/// A demo executor that always succeeds, standing in for a real
/// side-effectful call (payment gateway, file transfer, …).
struct DemoExecutor;

#[async_trait]
impl Executor for DemoExecutor {
    async fn execute(&self, envelope: &Envelope) -> Outcome {
        info!(op_id = %envelope.op_id, domain = %envelope.command.domain, "demo executor invoked");
        Outcome::ok(envelope.op_id.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("starting opflow engine monitor");

    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(MemoryBus::default());
    let idempotency = Arc::new(MemoryIdempotencyManager::new());

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        bus.clone(),
        idempotency,
        OrchestratorConfig::default(),
    ));

    let runtime = Arc::new(Runtime::new(
        store.clone(),
        bus.clone(),
        ProtectionChain::noop(),
        Arc::new(DemoExecutor),
        RuntimeConfig::default(),
    ));

    let finalizer = Arc::new(Finalizer::new(store.clone(), FinalizerConfig::default()));
    let reaper = Arc::new(Reaper::new(store.clone(), bus.clone(), ReaperConfig::default()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime_task = tokio::spawn(runtime.clone().run(shutdown_rx.clone()));
    let finalizer_task = tokio::spawn(finalizer.run(shutdown_rx.clone()));
    let reaper_task = tokio::spawn(reaper.run(shutdown_rx.clone()));

    info!("engine wired up, submitting demo commands");
    for i in 0..3 {
        let command = Command::new(
            Domain::parse("ORDER").unwrap(),
            EventType::parse("CREATE").unwrap(),
            BizKey::parse(format!("o-{i}")).unwrap(),
            IdemKey::parse(format!("demo-{i}")).unwrap(),
            None,
        );

        match orchestrator.submit(command, 200).await {
            Ok(SubmissionHandle::Completed { op_id, outcome }) => {
                info!(%op_id, ?outcome, "demo command fast-completed");
            }
            Ok(SubmissionHandle::Async { op_id, status_locator }) => {
                info!(%op_id, token = status_locator.as_token(), "demo command handed off to async status query");
            }
            Err(error) => {
                warn!(%error, "demo command submit failed");
            }
        }
    }

    info!("demo submissions done. monitor ready; press Ctrl+C to stop.");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = runtime_task => {
            warn!("runtime task ended unexpectedly");
        }
        _ = finalizer_task => {
            warn!("finalizer task ended unexpectedly");
        }
        _ = reaper_task => {
            warn!("reaper task ended unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("opflow engine monitor shutting down");
    Ok(())
}
