//! Aggregator round engine.
//!
//! All round state lives behind one mutex. The critical section covers
//! "check completeness, merge the slot, maybe aggregate, advance" and never
//! performs I/O. Aggregation runs against a tentative copy of the pending
//! slots, so a failed aggregation leaves the round exactly as it was.
//!
//! Round changes are published on a `watch` channel; long-poll readers wait on
//! it outside the lock.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregation::{build_strategy, AggregationStrategy, Contribution, StalenessBlend};
use crate::error::{AggregationError, FederationError};
use crate::metrics::FedMetrics;
use crate::model::{ModelBlob, ModelUpdate, ModelView};
use crate::plan::{validate_identity, CoordinationMode, FederationPlan, MembershipPolicy};

/// Upper bound on a single long-poll wait.
pub const MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub view: ModelView,
    pub newly_joined: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Round current after the update was applied.
    pub round: u64,
    /// Set when this submission completed an aggregation.
    pub closed: Option<ModelView>,
    pub pending: usize,
}

#[derive(Debug, Clone)]
struct CollaboratorRecord {
    joined_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_update: Option<DateTime<Utc>>,
    updates_accepted: u64,
}

impl CollaboratorRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self { joined_at: now, last_seen: now, last_update: None, updates_accepted: 0 }
    }
}

#[derive(Debug, Clone)]
struct PendingSlot {
    collaborator: String,
    update: ModelUpdate,
}

struct RoundState {
    current_round: u64,
    model_version: u64,
    current_model: ModelBlob,
    /// Arrival ordered, at most one slot per identity.
    pending: Vec<PendingSlot>,
    collaborators: HashMap<String, CollaboratorRecord>,
    strategy: Box<dyn AggregationStrategy>,
    round_started_at: Instant,
    /// When the open sync round received its first update.
    first_pending_at: Option<Instant>,
}

impl RoundState {
    fn view(&self) -> ModelView {
        ModelView { model: self.current_model.clone(), round: self.current_round, version: self.model_version }
    }

    fn aggregate(&mut self, contributions: &[Contribution], metrics: &FedMetrics) -> Result<ModelBlob, AggregationError> {
        let started = Instant::now();
        let out = self.strategy.aggregate(&self.current_model, contributions);
        metrics.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        out
    }

    fn advance(&mut self, model: ModelBlob) {
        self.current_model = model;
        self.current_round += 1;
        self.model_version += 1;
        self.pending.clear();
        self.round_started_at = Instant::now();
        self.first_pending_at = None;
    }

    fn touch(&mut self, id: &str) {
        if let Some(rec) = self.collaborators.get_mut(id) {
            rec.last_seen = Utc::now();
        }
    }
}

fn sync_contributions(pending: &[PendingSlot]) -> Vec<Contribution> {
    pending
        .iter()
        .map(|slot| Contribution {
            collaborator: slot.collaborator.clone(),
            model: slot.update.model.clone(),
            sample_count: slot.update.sample_count,
            staleness: 0,
        })
        .collect()
}

pub struct RoundEngine {
    mode: CoordinationMode,
    membership: MembershipPolicy,
    expected: HashSet<String>,
    state: Mutex<RoundState>,
    round_tx: watch::Sender<u64>,
    metrics: FedMetrics,
}

impl RoundEngine {
    pub fn new(mode: CoordinationMode, initial_model: ModelBlob, strategy: Box<dyn AggregationStrategy>) -> Self {
        let (round_tx, _) = watch::channel(1);
        Self {
            mode,
            membership: MembershipPolicy::default(),
            expected: HashSet::new(),
            state: Mutex::new(RoundState {
                current_round: 1,
                model_version: 1,
                current_model: initial_model,
                pending: Vec::new(),
                collaborators: HashMap::new(),
                strategy,
                round_started_at: Instant::now(),
                first_pending_at: None,
            }),
            round_tx,
            metrics: FedMetrics::new(),
        }
    }

    pub fn with_membership<I, S>(mut self, policy: MembershipPolicy, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership = policy;
        self.expected = expected.into_iter().map(Into::into).collect();
        self
    }

    /// Builds the engine a plan describes; async plans get the staleness blend.
    pub fn from_plan(plan: &FederationPlan, initial_model: ModelBlob) -> Result<Self, FederationError> {
        let mode = plan.coordination_mode();
        let base = build_strategy(&plan.algorithm)?;
        let strategy: Box<dyn AggregationStrategy> = match mode {
            CoordinationMode::Sync => base,
            CoordinationMode::Async { .. } => Box::new(StalenessBlend::new(base, &plan.async_config)),
        };
        info!(mode = mode.name(), algorithm = strategy.name(), model_bytes = initial_model.len(), "round_engine_initialized");
        Ok(Self::new(mode, initial_model, strategy)
            .with_membership(plan.membership.clone(), plan.expected_identities().map(str::to_string)))
    }

    pub fn mode(&self) -> &CoordinationMode { &self.mode }

    pub fn current_round(&self) -> u64 { self.state.lock().current_round }

    pub fn model_version(&self) -> u64 { self.state.lock().model_version }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.round_tx.subscribe() }

    fn admit(&self, id: &str) -> Result<(), FederationError> {
        validate_identity(id)?;
        if self.expected.contains(id) {
            return Ok(());
        }
        if self.membership.strict {
            self.metrics.record_rejection("membership");
            warn!(collaborator = %id, "membership_denied");
            return Err(FederationError::MembershipDenied(id.to_string()));
        }
        if !self.expected.is_empty() {
            warn!(collaborator = %id, "collaborator_not_in_plan");
        }
        Ok(())
    }

    /// Registers `id` and returns the current model. Repeated joins are idempotent.
    pub fn join(&self, id: &str) -> Result<JoinOutcome, FederationError> {
        self.admit(id)?;
        let mut st = self.state.lock();
        let now = Utc::now();
        let newly_joined = !st.collaborators.contains_key(id);
        st.collaborators.entry(id.to_string()).or_insert_with(|| CollaboratorRecord::new(now)).last_seen = now;
        let view = st.view();
        if newly_joined {
            info!(collaborator = %id, round = view.round, joined = st.collaborators.len(), "collaborator_joined");
        } else {
            debug!(collaborator = %id, round = view.round, "collaborator_rejoined");
        }
        Ok(JoinOutcome { view, newly_joined })
    }

    pub fn submit(&self, id: &str, update: ModelUpdate) -> Result<SubmitOutcome, FederationError> {
        validate_identity(id)?;
        let mut st = self.state.lock();
        if !st.collaborators.contains_key(id) {
            if !self.membership.auto_register {
                self.metrics.record_rejection("unknown");
                return Err(FederationError::UnknownCollaborator(id.to_string()));
            }
            self.admit(id)?;
            st.collaborators.insert(id.to_string(), CollaboratorRecord::new(Utc::now()));
            info!(collaborator = %id, "collaborator_auto_registered");
        }

        let closed = match &self.mode {
            CoordinationMode::Sync => self.submit_sync(&mut st, id, update)?,
            CoordinationMode::Async { max_staleness } => Some(self.submit_async(&mut st, id, update, *max_staleness)?),
        };

        let now = Utc::now();
        if let Some(rec) = st.collaborators.get_mut(id) {
            rec.last_seen = now;
            rec.last_update = Some(now);
            rec.updates_accepted += 1;
        }
        self.metrics.updates_total.add(1, &[KeyValue::new("mode", self.mode.name())]);
        if let Some(view) = &closed {
            self.metrics.rounds_completed.add(1, &[]);
            self.round_tx.send_replace(view.round);
        }
        Ok(SubmitOutcome { round: st.current_round, closed, pending: st.pending.len() })
    }

    fn submit_sync(&self, st: &mut RoundState, id: &str, update: ModelUpdate) -> Result<Option<ModelView>, FederationError> {
        if let Some(base) = update.base_round {
            if base < st.current_round {
                self.metrics.record_rejection("stale");
                warn!(collaborator = %id, base_round = base, round = st.current_round, "late_sync_update_rejected");
                return Err(FederationError::StaleUpdate { base_round: base, current_round: st.current_round });
            }
        }

        let mut tentative = st.pending.clone();
        match tentative.iter_mut().find(|slot| slot.collaborator == id) {
            Some(slot) => {
                debug!(collaborator = %id, round = st.current_round, "pending_update_overwritten");
                slot.update = update;
            }
            None => tentative.push(PendingSlot { collaborator: id.to_string(), update }),
        }

        let expected = st.collaborators.len();
        if tentative.len() < expected {
            st.pending = tentative;
            st.first_pending_at.get_or_insert_with(Instant::now);
            info!(collaborator = %id, round = st.current_round, pending = st.pending.len(), expected, "update_accepted");
            return Ok(None);
        }

        let model = self.aggregate_or_reject(st, &sync_contributions(&tentative))?;
        st.advance(model);
        info!(collaborator = %id, round = st.current_round, version = st.model_version, participants = tentative.len(), "round_completed");
        Ok(Some(st.view()))
    }

    fn submit_async(&self, st: &mut RoundState, id: &str, update: ModelUpdate, max_staleness: Option<u64>) -> Result<ModelView, FederationError> {
        let staleness = update.base_round.map(|b| st.current_round.saturating_sub(b)).unwrap_or(0);
        if let (Some(max), Some(base)) = (max_staleness, update.base_round) {
            if staleness > max {
                self.metrics.record_rejection("stale");
                warn!(collaborator = %id, staleness, max_staleness = max, "stale_async_update_rejected");
                return Err(FederationError::StaleUpdate { base_round: base, current_round: st.current_round });
            }
        }
        let contribution = Contribution {
            collaborator: id.to_string(),
            model: update.model,
            sample_count: update.sample_count,
            staleness,
        };
        let model = self.aggregate_or_reject(st, &[contribution])?;
        st.advance(model);
        info!(collaborator = %id, round = st.current_round, staleness, "async_update_applied");
        Ok(st.view())
    }

    fn aggregate_or_reject(&self, st: &mut RoundState, contributions: &[Contribution]) -> Result<ModelBlob, FederationError> {
        st.aggregate(contributions, &self.metrics).map_err(|e| {
            self.metrics.record_rejection("aggregation");
            warn!(error = %e, round = st.current_round, "aggregation_failed");
            FederationError::Aggregation(e)
        })
    }

    /// The most recently aggregated model. Never waits.
    pub fn latest_model(&self, id: &str) -> Result<ModelView, FederationError> {
        validate_identity(id)?;
        let mut st = self.state.lock();
        if !st.collaborators.contains_key(id) {
            return Err(FederationError::UnknownCollaborator(id.to_string()));
        }
        st.touch(id);
        Ok(st.view())
    }

    /// Waits (outside the lock, at most `MAX_WAIT`) until the round reaches
    /// `min_round`, then returns the latest model whether or not it did.
    pub async fn wait_for_round(&self, id: &str, min_round: u64, timeout: Duration) -> Result<ModelView, FederationError> {
        let view = self.latest_model(id)?;
        if view.round >= min_round || timeout.is_zero() {
            return Ok(view);
        }
        let mut rx = self.subscribe();
        if tokio::time::timeout(timeout.min(MAX_WAIT), rx.wait_for(|r| *r >= min_round)).await.is_err() {
            debug!(collaborator = %id, min_round, "long_poll_timed_out");
        }
        self.latest_model(id)
    }

    /// Closes the open sync round with whatever is pending. Returns `None`
    /// when there is nothing to aggregate or the engine runs async.
    pub fn force_close(&self, reason: &str) -> Result<Option<ModelView>, FederationError> {
        let mut st = self.state.lock();
        self.force_close_locked(&mut st, reason)
    }

    /// Force-closes the sync round once its first pending update is older
    /// than `timeout`. Time spent with nothing pending does not count.
    pub fn close_if_overdue(&self, timeout: Duration) -> Result<Option<ModelView>, FederationError> {
        let mut st = self.state.lock();
        match st.first_pending_at {
            Some(first) if first.elapsed() >= timeout => {}
            _ => return Ok(None),
        }
        self.force_close_locked(&mut st, "round_timeout")
    }

    fn force_close_locked(&self, st: &mut RoundState, reason: &str) -> Result<Option<ModelView>, FederationError> {
        if self.mode.is_async() || st.pending.is_empty() {
            return Ok(None);
        }
        let pending = st.pending.clone();
        let model = self.aggregate_or_reject(st, &sync_contributions(&pending))?;
        st.advance(model);
        let view = st.view();
        warn!(reason, round = view.round, participants = pending.len(), expected = st.collaborators.len(), "round_force_closed");
        self.metrics.rounds_completed.add(1, &[KeyValue::new("forced", true)]);
        self.round_tx.send_replace(view.round);
        Ok(Some(view))
    }

    pub fn snapshot(&self) -> FederationSnapshot {
        let st = self.state.lock();
        let mut collaborators: Vec<CollaboratorSnapshot> = st
            .collaborators
            .iter()
            .map(|(id, rec)| CollaboratorSnapshot {
                id: id.clone(),
                joined_at: rec.joined_at,
                last_seen: rec.last_seen,
                last_update: rec.last_update,
                updates_accepted: rec.updates_accepted,
                pending: st.pending.iter().any(|p| &p.collaborator == id),
            })
            .collect();
        collaborators.sort_by(|a, b| a.id.cmp(&b.id));
        FederationSnapshot {
            mode: self.mode.name(),
            algorithm: st.strategy.name(),
            current_round: st.current_round,
            model_version: st.model_version,
            model_bytes: st.current_model.len(),
            pending: st.pending.len(),
            round_open_secs: st.round_started_at.elapsed().as_secs(),
            collaborators,
        }
    }
}

/// Read-only view of the federation served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct FederationSnapshot {
    pub mode: &'static str,
    pub algorithm: &'static str,
    pub current_round: u64,
    pub model_version: u64,
    pub model_bytes: usize,
    pub pending: usize,
    pub round_open_secs: u64,
    pub collaborators: Vec<CollaboratorSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollaboratorSnapshot {
    pub id: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub updates_accepted: u64,
    pub pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{decode_weights, encode_weights, Mean};
    use crate::plan::AsyncConfig;
    use std::sync::Arc;

    fn sync_engine() -> RoundEngine {
        RoundEngine::new(CoordinationMode::Sync, encode_weights(&[0.0, 0.0]), Box::new(Mean))
    }

    fn async_engine(max_staleness: Option<u64>) -> RoundEngine {
        let blend = StalenessBlend::new(Box::new(Mean), &AsyncConfig::default());
        RoundEngine::new(CoordinationMode::Async { max_staleness }, encode_weights(&[0.0, 0.0]), Box::new(blend))
    }

    fn update(w: &[f32]) -> ModelUpdate { ModelUpdate::new(encode_weights(w)) }

    fn weights(view: &ModelView) -> Vec<f32> { decode_weights(&view.model).unwrap() }

    #[test]
    fn sync_round_closes_when_every_member_submitted() {
        let engine = sync_engine();
        engine.join("c1").unwrap();
        engine.join("c2").unwrap();

        for round in 1..=2u64 {
            let first = engine.submit("c1", update(&[1.0, 2.0]).trained_on(round)).unwrap();
            assert!(first.closed.is_none());
            assert_eq!(first.pending, 1);
            assert_eq!(engine.current_round(), round);

            let second = engine.submit("c2", update(&[3.0, 4.0]).trained_on(round)).unwrap();
            let view = second.closed.expect("round closes");
            assert_eq!(view.round, round + 1);
            assert_eq!(weights(&view), vec![2.0, 3.0]);
            assert_eq!(second.pending, 0);
        }
        assert_eq!(engine.current_round(), 3);
        assert_eq!(engine.model_version(), 3);
    }

    #[test]
    fn resubmission_overwrites_the_slot() {
        let engine = sync_engine();
        engine.join("c1").unwrap();
        engine.join("c2").unwrap();
        engine.submit("c1", update(&[9.0, 9.0])).unwrap();
        let again = engine.submit("c1", update(&[1.0, 1.0])).unwrap();
        assert_eq!(again.pending, 1);
        let view = engine.submit("c2", update(&[3.0, 3.0])).unwrap().closed.unwrap();
        assert_eq!(weights(&view), vec![2.0, 2.0]);
        assert_eq!(engine.snapshot().collaborators[0].updates_accepted, 2);
    }

    #[test]
    fn duplicate_join_is_idempotent() {
        let engine = sync_engine();
        let first = engine.join("c1").unwrap();
        let second = engine.join("c1").unwrap();
        assert!(first.newly_joined);
        assert!(!second.newly_joined);
        assert!(first.view.model.same_as(&second.view.model));
        assert_eq!(engine.snapshot().collaborators.len(), 1);
    }

    #[test]
    fn unknown_collaborators_are_rejected() {
        let engine = sync_engine();
        assert!(matches!(engine.submit("ghost", update(&[1.0, 1.0])), Err(FederationError::UnknownCollaborator(_))));
        assert!(matches!(engine.latest_model("ghost"), Err(FederationError::UnknownCollaborator(_))));
        assert!(matches!(engine.join("bad id"), Err(FederationError::InvalidArgument(_))));
    }

    #[test]
    fn auto_register_admits_first_submission() {
        let policy = MembershipPolicy { strict: false, auto_register: true };
        let engine = sync_engine().with_membership(policy, Vec::<String>::new());
        let out = engine.submit("late", update(&[4.0, 4.0])).unwrap();
        // Sole member, so the round closes immediately.
        assert_eq!(out.round, 2);
        assert!(engine.latest_model("late").is_ok());
    }

    #[test]
    fn strict_membership_only_admits_listed_identities() {
        let policy = MembershipPolicy { strict: true, auto_register: false };
        let engine = sync_engine().with_membership(policy, ["c1", "c2"]);
        assert!(engine.join("c1").is_ok());
        assert!(matches!(engine.join("c9"), Err(FederationError::MembershipDenied(_))));
    }

    #[test]
    fn late_sync_update_is_stale() {
        let engine = sync_engine();
        engine.join("c1").unwrap();
        engine.submit("c1", update(&[1.0, 1.0]).trained_on(1)).unwrap();
        assert_eq!(engine.current_round(), 2);
        let err = engine.submit("c1", update(&[1.0, 1.0]).trained_on(1)).unwrap_err();
        assert!(matches!(err, FederationError::StaleUpdate { base_round: 1, current_round: 2 }));
        assert_eq!(engine.snapshot().pending, 0);
    }

    #[test]
    fn failed_aggregation_leaves_state_untouched() {
        let engine = sync_engine();
        engine.join("c1").unwrap();
        let before = engine.join("c2").unwrap().view;
        engine.submit("c1", update(&[1.0, 1.0])).unwrap();

        let err = engine.submit("c2", update(&[1.0])).unwrap_err();
        assert!(matches!(err, FederationError::Aggregation(AggregationError::LengthMismatch { .. })));
        assert_eq!(engine.current_round(), 1);
        assert_eq!(engine.model_version(), 1);
        let snap = engine.snapshot();
        assert_eq!(snap.pending, 1);
        assert!(engine.latest_model("c1").unwrap().model.same_as(&before.model));

        assert!(engine.submit("c2", update(&[3.0, 3.0])).unwrap().closed.is_some());
    }

    #[test]
    fn async_updates_advance_one_round_each() {
        let engine = async_engine(None);
        engine.join("c1").unwrap();
        let out = engine.submit("c1", update(&[2.0, 2.0])).unwrap();
        assert_eq!(out.round, 2);
        assert_eq!(weights(out.closed.as_ref().unwrap()), vec![2.0, 2.0]);
        assert_eq!(engine.submit("c1", update(&[4.0, 4.0])).unwrap().round, 3);
    }

    #[test]
    fn async_concurrent_submissions_are_all_counted() {
        const M: u64 = 32;
        let engine = Arc::new(async_engine(None));
        for i in 0..4 {
            engine.join(&format!("c{i}")).unwrap();
        }
        std::thread::scope(|s| {
            for t in 0..4 {
                let engine = Arc::clone(&engine);
                s.spawn(move || {
                    for _ in 0..M / 4 {
                        engine.submit(&format!("c{t}"), update(&[1.0, 1.0])).unwrap();
                    }
                });
            }
        });
        assert_eq!(engine.current_round(), 1 + M);
        assert_eq!(engine.model_version(), 1 + M);
        let accepted: u64 = engine.snapshot().collaborators.iter().map(|c| c.updates_accepted).sum();
        assert_eq!(accepted, M);
    }

    #[test]
    fn async_staleness_bound_is_enforced() {
        let engine = async_engine(Some(1));
        engine.join("c1").unwrap();
        for _ in 0..3 {
            engine.submit("c1", update(&[1.0, 1.0])).unwrap();
        }
        assert_eq!(engine.current_round(), 4);
        let err = engine.submit("c1", update(&[5.0, 5.0]).trained_on(2)).unwrap_err();
        assert!(matches!(err, FederationError::StaleUpdate { base_round: 2, current_round: 4 }));
        assert!(engine.submit("c1", update(&[5.0, 5.0]).trained_on(3)).is_ok());
    }

    #[tokio::test]
    async fn long_poll_wakes_when_round_closes() {
        let engine = Arc::new(sync_engine());
        engine.join("c1").unwrap();
        engine.join("c2").unwrap();

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.wait_for_round("c1", 2, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        engine.submit("c1", update(&[1.0, 1.0])).unwrap();
        engine.submit("c2", update(&[3.0, 3.0])).unwrap();

        let view = waiter.await.unwrap().unwrap();
        assert_eq!(view.round, 2);
    }

    #[tokio::test]
    async fn long_poll_times_out_with_current_model() {
        let engine = sync_engine();
        engine.join("c1").unwrap();
        engine.join("c2").unwrap();
        let started = Instant::now();
        let view = engine.wait_for_round("c1", 2, Duration::from_millis(50)).await.unwrap();
        assert_eq!(view.round, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn force_close_aggregates_what_is_pending() {
        let engine = sync_engine();
        engine.join("c1").unwrap();
        engine.join("c2").unwrap();
        assert!(engine.force_close("test").unwrap().is_none());
        engine.submit("c1", update(&[2.0, 2.0])).unwrap();
        let view = engine.force_close("test").unwrap().unwrap();
        assert_eq!(view.round, 2);
        assert_eq!(weights(&view), vec![2.0, 2.0]);
        assert!(engine.close_if_overdue(Duration::from_secs(3600)).unwrap().is_none());
    }

    #[test]
    fn overdue_clock_starts_at_first_pending_update() {
        let engine = sync_engine();
        engine.join("c1").unwrap();
        engine.join("c2").unwrap();
        let timeout = Duration::from_millis(50);

        // Round open past the timeout with nothing pending.
        std::thread::sleep(timeout * 2);
        assert!(engine.close_if_overdue(timeout).unwrap().is_none());
        engine.submit("c1", update(&[2.0, 2.0])).unwrap();
        assert!(engine.close_if_overdue(timeout).unwrap().is_none());
        assert_eq!(engine.snapshot().pending, 1);

        std::thread::sleep(timeout * 2);
        let view = engine.close_if_overdue(timeout).unwrap().unwrap();
        assert_eq!(view.round, 2);
        // The next round starts with a fresh clock.
        assert!(engine.close_if_overdue(timeout).unwrap().is_none());
    }

    #[test]
    fn snapshot_serializes() {
        let engine = sync_engine();
        engine.join("c2").unwrap();
        engine.join("c1").unwrap();
        let json = serde_json::to_value(engine.snapshot()).unwrap();
        assert_eq!(json["mode"], "sync");
        assert_eq!(json["current_round"], 1);
        assert_eq!(json["collaborators"][0]["id"], "c1");
    }
}
