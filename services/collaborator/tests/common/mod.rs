#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use collaborator::Trainer;
use fedlink_core::aggregation::{decode_weights, encode_weights};
use fedlink_core::plan::CollaboratorSettings;
use fedlink_core::{FederationError, ModelBlob};

/// Adds `delta` to every weight of the model it is given.
pub struct ShiftTrainer {
    pub delta: f32,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ShiftTrainer {
    pub fn new(delta: f32) -> Self { Self { delta, delay: Duration::ZERO, calls: AtomicUsize::new(0) } }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

fn failure(e: impl std::fmt::Display) -> FederationError { FederationError::TrainingFailure(e.to_string()) }

#[async_trait]
impl Trainer for ShiftTrainer {
    async fn train(&self, model_in: &Path, model_out: &Path) -> Result<(), FederationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let bytes = tokio::fs::read(model_in).await.map_err(failure)?;
        let weights = decode_weights(&ModelBlob::new(bytes)).map_err(failure)?;
        let shifted: Vec<f32> = weights.iter().map(|w| w + self.delta).collect();
        tokio::fs::write(model_out, encode_weights(&shifted).as_bytes()).await.map_err(failure)
    }
}

pub struct FailingTrainer;

#[async_trait]
impl Trainer for FailingTrainer {
    async fn train(&self, _: &Path, _: &Path) -> Result<(), FederationError> {
        Err(FederationError::TrainingFailure("loss diverged".into()))
    }
}

pub struct SlowTrainer;

#[async_trait]
impl Trainer for SlowTrainer {
    async fn train(&self, _: &Path, _: &Path) -> Result<(), FederationError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

pub fn fast_settings() -> CollaboratorSettings {
    CollaboratorSettings {
        round_interval_ms: 5,
        sync_wait_ms: 2_000,
        rpc_timeout_ms: 5_000,
        submit_retries: 0,
        refresh_retries: 0,
        ..CollaboratorSettings::default()
    }
}
