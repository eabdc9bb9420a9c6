//! Collaborator round engine.
//!
//! ```text
//! Disconnected -> Joined -> Training -> Submitting -> Waiting (sync)    -> Joined ...
//!                                                  -> Refreshing (async) -> Joined ...
//! terminal: Stopped | Failed
//! ```
//!
//! Sync waiting is a fixed sleep followed by a (optionally long-polled) fetch.
//! That is a liveness assumption, not a barrier: if the aggregator has not
//! advanced yet the collaborator retrains on the model it has and its next
//! submission overwrites its slot in the open round.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fedlink_core::model::{ModelBlob, ModelUpdate, ModelView};
use fedlink_core::plan::{validate_identity, CollaboratorSettings, FederationPlan};
use fedlink_core::{retry_async_if, CoordinationMode, FederationError, RetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::trainer::Trainer;
use crate::transport::{FederationTransport, SubmitReceipt};
use crate::workdir::WorkingDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorState {
    Disconnected,
    Joined,
    Training,
    Submitting,
    Waiting,
    Refreshing,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub id: String,
    pub mode: CoordinationMode,
    /// 0 runs until cancelled.
    pub rounds: u64,
    pub settings: CollaboratorSettings,
}

impl EngineConfig {
    pub fn from_plan(plan: &FederationPlan, id: &str) -> Result<Self, FederationError> {
        validate_identity(id)?;
        if !plan.collaborators.is_empty() && !plan.lists_collaborator(id) {
            warn!(collaborator = %id, "collaborator_not_in_plan");
        }
        Ok(Self { id: id.to_string(), mode: plan.coordination_mode(), rounds: plan.rounds, settings: plan.collaborator.clone() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds_completed: u64,
    /// Aggregator round last observed.
    pub last_round: u64,
    pub final_state: CollaboratorState,
}

pub struct CollaboratorEngine {
    config: EngineConfig,
    transport: Arc<dyn FederationTransport>,
    trainer: Arc<dyn Trainer>,
    workdir: WorkingDir,
    state: CollaboratorState,
    model: Option<ModelView>,
    rounds_completed: u64,
    last_round: u64,
    /// Sync round whose submission was last counted. A resubmission while
    /// the aggregator has not advanced only overwrites that slot.
    counted_round: Option<u64>,
}

fn check(cancel: &CancellationToken) -> Result<(), FederationError> {
    if cancel.is_cancelled() { Err(FederationError::Cancelled) } else { Ok(()) }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, FederationError>
where
    F: Future<Output = Result<T, FederationError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FederationError::Cancelled),
        res = fut => res,
    }
}

fn is_transport(e: &FederationError) -> bool { matches!(e, FederationError::Transport(_)) }

impl CollaboratorEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn FederationTransport>, trainer: Arc<dyn Trainer>, workdir: WorkingDir) -> Self {
        Self {
            config,
            transport,
            trainer,
            workdir,
            state: CollaboratorState::Disconnected,
            model: None,
            rounds_completed: 0,
            last_round: 0,
            counted_round: None,
        }
    }

    pub fn state(&self) -> CollaboratorState { self.state }

    pub fn id(&self) -> &str { &self.config.id }

    fn set_state(&mut self, next: CollaboratorState) {
        if self.state != next {
            debug!(collaborator = %self.config.id, from = ?self.state, to = ?next, "state_transition");
            self.state = next;
        }
    }

    fn model_round(&self) -> u64 { self.model.as_ref().map(|m| m.round).unwrap_or(0) }

    fn ceiling_reached(&self) -> bool { self.config.rounds > 0 && self.rounds_completed >= self.config.rounds }

    /// Counts a successful submission. Async updates always count; a sync
    /// update counts once per aggregator round.
    fn count_round(&mut self, trained_on: u64) -> bool {
        if !self.config.mode.is_async() {
            if self.counted_round == Some(trained_on) {
                return false;
            }
            self.counted_round = Some(trained_on);
        }
        self.rounds_completed += 1;
        true
    }

    fn observe(&mut self, view: ModelView) {
        self.last_round = self.last_round.max(view.round);
        self.model = Some(view);
    }

    fn summary(&self) -> RunSummary {
        RunSummary { rounds_completed: self.rounds_completed, last_round: self.last_round, final_state: self.state }
    }

    /// Drives the engine until the round ceiling, cancellation, or a fatal error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, FederationError> {
        match self.drive(&cancel).await {
            Ok(()) | Err(FederationError::Cancelled) => {
                self.set_state(CollaboratorState::Stopped);
                let summary = self.summary();
                info!(collaborator = %self.config.id, rounds = summary.rounds_completed, last_round = summary.last_round, "collaborator_stopped");
                Ok(summary)
            }
            Err(e) => {
                self.set_state(CollaboratorState::Failed);
                error!(collaborator = %self.config.id, error = %e, "collaborator_failed");
                Err(e)
            }
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), FederationError> {
        self.join(cancel).await?;
        loop {
            if self.ceiling_reached() {
                return Ok(());
            }
            let trained_on = self.model_round();
            let update = self.train(cancel).await?;
            check(cancel)?;

            match self.submit(update, cancel).await {
                Ok(receipt) => {
                    self.last_round = self.last_round.max(receipt.round);
                    if self.count_round(trained_on) {
                        info!(
                            collaborator = %self.config.id,
                            round = trained_on,
                            aggregator_round = receipt.round,
                            closed = receipt.round_closed,
                            completed = self.rounds_completed,
                            "round_submitted"
                        );
                    } else {
                        info!(collaborator = %self.config.id, round = trained_on, aggregator_round = receipt.round, "round_slot_overwritten");
                    }
                }
                Err(FederationError::StaleUpdate { base_round, current_round }) => {
                    warn!(collaborator = %self.config.id, base_round, current_round, "stale_update_retraining");
                    self.refresh(cancel).await?;
                    self.enter_joined().await?;
                    continue;
                }
                Err(FederationError::UnknownCollaborator(_)) => {
                    warn!(collaborator = %self.config.id, "aggregator_forgot_collaborator_rejoining");
                    self.join(cancel).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }

            if self.ceiling_reached() {
                return Ok(());
            }
            check(cancel)?;
            match self.config.mode {
                CoordinationMode::Sync => self.wait_for_next_round(trained_on, cancel).await?,
                CoordinationMode::Async { .. } => self.refresh(cancel).await?,
            }
            self.enter_joined().await?;
        }
    }

    async fn join(&mut self, cancel: &CancellationToken) -> Result<(), FederationError> {
        check(cancel)?;
        let transport = Arc::clone(&self.transport);
        let view = cancellable(cancel, transport.join(&self.config.id)).await?;
        info!(collaborator = %self.config.id, round = view.round, version = view.version, model_bytes = view.model.len(), "joined_federation");
        self.observe(view);
        self.enter_joined().await
    }

    /// Hands the current model to the trainer's input file.
    async fn enter_joined(&mut self) -> Result<(), FederationError> {
        self.set_state(CollaboratorState::Joined);
        if let Some(view) = &self.model {
            self.workdir.write_model(&view.model).await?;
        }
        Ok(())
    }

    async fn train(&mut self, cancel: &CancellationToken) -> Result<ModelBlob, FederationError> {
        check(cancel)?;
        self.set_state(CollaboratorState::Training);
        self.workdir.clear_update().await?;
        let trainer = Arc::clone(&self.trainer);
        let (input, output) = (self.workdir.model_path(), self.workdir.update_path());
        cancellable(cancel, trainer.train(&input, &output)).await?;
        check(cancel)?;
        self.workdir.read_update().await
    }

    async fn submit(&mut self, model: ModelBlob, cancel: &CancellationToken) -> Result<SubmitReceipt, FederationError> {
        self.set_state(CollaboratorState::Submitting);
        let update = ModelUpdate::new(model).trained_on(self.model_round()).with_samples(self.config.settings.sample_count);
        let transport = Arc::clone(&self.transport);
        let id = self.config.id.clone();
        match self.config.mode {
            // A lost sync submission would stall the round for everyone; fail loudly.
            CoordinationMode::Sync => cancellable(cancel, transport.submit(&id, update)).await,
            CoordinationMode::Async { .. } => {
                let retry = RetryConfig::default().with_max_retries(self.config.settings.submit_retries);
                let attempts = retry_async_if(
                    &retry,
                    |attempt| {
                        let transport = Arc::clone(&transport);
                        let id = id.clone();
                        let update = update.clone();
                        async move {
                            if attempt > 0 {
                                warn!(collaborator = %id, attempt, "submit_retry");
                            }
                            transport.submit(&id, update).await
                        }
                    },
                    is_transport,
                );
                cancellable(cancel, attempts).await
            }
        }
    }

    async fn fetch(&self, min_round: u64, wait: Duration, cancel: &CancellationToken) -> Result<ModelView, FederationError> {
        let retry = RetryConfig::default().with_max_retries(self.config.settings.refresh_retries);
        let transport = Arc::clone(&self.transport);
        let id = self.config.id.clone();
        let attempts = retry_async_if(
            &retry,
            |_| {
                let transport = Arc::clone(&transport);
                let id = id.clone();
                async move { transport.latest_model(&id, min_round, wait).await }
            },
            is_transport,
        );
        cancellable(cancel, attempts).await
    }

    async fn wait_for_next_round(&mut self, trained_on: u64, cancel: &CancellationToken) -> Result<(), FederationError> {
        self.set_state(CollaboratorState::Waiting);
        let interval = self.config.settings.round_interval();
        cancellable(cancel, async {
            tokio::time::sleep(interval).await;
            Ok(())
        })
        .await?;
        let next = trained_on + 1;
        let view = match self.fetch(next, self.config.settings.sync_wait(), cancel).await {
            Ok(view) => view,
            Err(FederationError::UnknownCollaborator(_)) => return self.join(cancel).await,
            Err(e) => return Err(e),
        };
        if view.round < next {
            warn!(collaborator = %self.config.id, round = view.round, expected = next, "round_not_advanced");
        }
        self.observe(view);
        Ok(())
    }

    /// Fetches the latest model. Async mode tolerates failure and keeps
    /// training on the local model.
    async fn refresh(&mut self, cancel: &CancellationToken) -> Result<(), FederationError> {
        self.set_state(CollaboratorState::Refreshing);
        match self.fetch(0, Duration::ZERO, cancel).await {
            Ok(view) => {
                self.observe(view);
                Ok(())
            }
            Err(FederationError::UnknownCollaborator(_)) => self.join(cancel).await,
            Err(FederationError::Cancelled) => Err(FederationError::Cancelled),
            Err(e) if self.config.mode.is_async() => {
                warn!(collaborator = %self.config.id, error = %e, "model_refresh_failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
