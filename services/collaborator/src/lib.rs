//! Collaborator process: joins a federation, trains locally, submits updates.

pub mod engine;
pub mod trainer;
pub mod transport;
pub mod workdir;

use std::sync::Arc;

use anyhow::Context;
use fedlink_core::plan::FederationPlan;
use fedlink_core::{clear_ready, init_tracing, mark_ready, ClientTransport};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use engine::{CollaboratorEngine, CollaboratorState, EngineConfig, RunSummary};
pub use trainer::{ProcessTrainer, Trainer};
pub use transport::{FederationTransport, GrpcTransport, InProcessTransport, SubmitReceipt};
pub use workdir::WorkingDir;

/// Process entry point. Reads the plan named by `FEDLINK_PLAN` (default
/// `plan.yaml`) and the identity from `FEDLINK_COLLABORATOR_ID`.
pub async fn run() -> anyhow::Result<()> {
    init_tracing("collaborator")?;
    let plan_path = std::env::var("FEDLINK_PLAN").unwrap_or_else(|_| "plan.yaml".into());
    let plan = FederationPlan::load(&plan_path)?;
    let id = std::env::var("FEDLINK_COLLABORATOR_ID").context("FEDLINK_COLLABORATOR_ID is not set")?;
    let config = EngineConfig::from_plan(&plan, &id)?;
    info!(plan = %plan_path, collaborator = %id, mode = config.mode.name(), rounds = config.rounds, "plan_loaded");

    let security = ClientTransport::from_settings(&plan.security)?;
    let transport = GrpcTransport::connect(&plan.aggregator.address, &security, plan.collaborator.rpc_timeout())?;
    let workdir = WorkingDir::create(plan.collaborator.work_dir.join(&id)).await?;
    let trainer = ProcessTrainer::new(plan.tasks.train.clone());
    let mut engine = CollaboratorEngine::new(config, Arc::new(transport), Arc::new(trainer), workdir);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown_signal_received");
                cancel.cancel();
            }
        });
    }

    mark_ready();
    let summary = engine.run(cancel).await;
    clear_ready();
    let summary = summary?;
    info!(rounds = summary.rounds_completed, last_round = summary.last_round, state = ?summary.final_state, "collaborator_finished");
    Ok(())
}
