//! Pluggable aggregation strategies.
//!
//! The built-in strategies interpret a `ModelBlob` as a little-endian `f32`
//! vector. When the prior model is empty (no seed model configured) the first
//! update fixes the expected length.

use std::collections::BTreeMap;

use crate::error::AggregationError;
use crate::model::ModelBlob;
use crate::plan::{AlgorithmConfig, AsyncConfig};

/// One collaborator's update as seen by a strategy.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub collaborator: String,
    pub model: ModelBlob,
    pub sample_count: u64,
    /// Rounds elapsed between the model this update was trained on and now.
    pub staleness: u64,
}

impl Contribution {
    pub fn new(collaborator: impl Into<String>, model: ModelBlob) -> Self {
        Self { collaborator: collaborator.into(), model, sample_count: 0, staleness: 0 }
    }
}

/// Combines the prior model and a set of updates into a new model.
///
/// Called with exclusive access to the round state; implementations must not
/// mutate internal state when they return an error.
pub trait AggregationStrategy: Send {
    fn name(&self) -> &'static str;
    fn aggregate(&mut self, current: &ModelBlob, updates: &[Contribution]) -> Result<ModelBlob, AggregationError>;
}

pub fn decode_weights(blob: &ModelBlob) -> Result<Vec<f32>, AggregationError> {
    let bytes = blob.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(AggregationError::MalformedBlob(bytes.len()));
    }
    Ok(bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

pub fn encode_weights(weights: &[f32]) -> ModelBlob {
    let mut out = Vec::with_capacity(weights.len() * 4);
    for w in weights {
        out.extend_from_slice(&w.to_le_bytes());
    }
    ModelBlob::from(out)
}

struct Decoded {
    prior: Option<Vec<f32>>,
    updates: Vec<Vec<f32>>,
}

fn decode_round(current: &ModelBlob, updates: &[Contribution]) -> Result<Decoded, AggregationError> {
    if updates.is_empty() {
        return Err(AggregationError::EmptyRound);
    }
    let prior = if current.is_empty() { None } else { Some(decode_weights(current)?) };
    let mut expected = prior.as_ref().map(Vec::len);
    let mut decoded = Vec::with_capacity(updates.len());
    for u in updates {
        let w = decode_weights(&u.model)?;
        match expected {
            Some(n) if n != w.len() => {
                return Err(AggregationError::LengthMismatch { collaborator: u.collaborator.clone(), expected: n, actual: w.len() });
            }
            None => expected = Some(w.len()),
            _ => {}
        }
        decoded.push(w);
    }
    Ok(Decoded { prior, updates: decoded })
}

fn weighted_mean(vectors: &[Vec<f32>], weights: &[f64]) -> Vec<f32> {
    let dim = vectors.first().map(Vec::len).unwrap_or(0);
    let total: f64 = weights.iter().sum();
    let mut acc = vec![0f64; dim];
    for (v, w) in vectors.iter().zip(weights) {
        for (a, x) in acc.iter_mut().zip(v) {
            *a += *x as f64 * w;
        }
    }
    acc.into_iter().map(|a| (a / total) as f32).collect()
}

/// Sample-count weights, falling back to equal weights when any update is unweighted.
fn sample_weights(updates: &[Contribution]) -> Vec<f64> {
    if updates.iter().any(|u| u.sample_count == 0) {
        vec![1.0; updates.len()]
    } else {
        updates.iter().map(|u| u.sample_count as f64).collect()
    }
}

/// Equal-weight mean of the updates. Default strategy.
#[derive(Debug, Default)]
pub struct Mean;

impl AggregationStrategy for Mean {
    fn name(&self) -> &'static str { "mean" }

    fn aggregate(&mut self, current: &ModelBlob, updates: &[Contribution]) -> Result<ModelBlob, AggregationError> {
        let d = decode_round(current, updates)?;
        Ok(encode_weights(&weighted_mean(&d.updates, &vec![1.0; d.updates.len()])))
    }
}

#[derive(Debug, Default)]
pub struct FedAvg;

impl AggregationStrategy for FedAvg {
    fn name(&self) -> &'static str { "fedavg" }

    fn aggregate(&mut self, current: &ModelBlob, updates: &[Contribution]) -> Result<ModelBlob, AggregationError> {
        let d = decode_round(current, updates)?;
        Ok(encode_weights(&weighted_mean(&d.updates, &sample_weights(updates))))
    }
}

/// Sample-weighted mean pulled toward the prior model by `mu / (1 + mu)`.
#[derive(Debug)]
pub struct FedProx {
    mu: f64,
}

impl FedProx {
    pub fn new(mu: f64) -> Self { Self { mu } }
}

impl Default for FedProx {
    fn default() -> Self { Self::new(0.01) }
}

impl AggregationStrategy for FedProx {
    fn name(&self) -> &'static str { "fedprox" }

    fn aggregate(&mut self, current: &ModelBlob, updates: &[Contribution]) -> Result<ModelBlob, AggregationError> {
        let d = decode_round(current, updates)?;
        let avg = weighted_mean(&d.updates, &sample_weights(updates));
        let Some(prior) = d.prior else { return Ok(encode_weights(&avg)) };
        let alpha = self.mu / (1.0 + self.mu);
        let blended: Vec<f32> =
            avg.iter().zip(&prior).map(|(a, p)| ((1.0 - alpha) * *a as f64 + alpha * *p as f64) as f32).collect();
        Ok(encode_weights(&blended))
    }
}

/// Adam-style server optimizer over the pseudo-gradient `avg - prior`.
#[derive(Debug)]
pub struct FedOpt {
    server_lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: i32,
    momentum: Vec<f64>,
    velocity: Vec<f64>,
}

impl Default for FedOpt {
    fn default() -> Self {
        Self { server_lr: 1.0, beta1: 0.9, beta2: 0.999, epsilon: 1e-7, step: 0, momentum: Vec::new(), velocity: Vec::new() }
    }
}

impl FedOpt {
    fn with_hyperparameters(params: &BTreeMap<String, f64>) -> Self {
        let mut opt = Self::default();
        if let Some(v) = params.get("server_learning_rate") { opt.server_lr = *v; }
        if let Some(v) = params.get("beta1") { opt.beta1 = *v; }
        if let Some(v) = params.get("beta2") { opt.beta2 = *v; }
        if let Some(v) = params.get("epsilon") { opt.epsilon = *v; }
        opt
    }
}

impl AggregationStrategy for FedOpt {
    fn name(&self) -> &'static str { "fedopt" }

    fn aggregate(&mut self, current: &ModelBlob, updates: &[Contribution]) -> Result<ModelBlob, AggregationError> {
        let d = decode_round(current, updates)?;
        let avg = weighted_mean(&d.updates, &sample_weights(updates));
        // Nothing to take a step from yet.
        let Some(prior) = d.prior else { return Ok(encode_weights(&avg)) };

        if self.momentum.len() != prior.len() {
            self.momentum = vec![0.0; prior.len()];
            self.velocity = vec![0.0; prior.len()];
            self.step = 0;
        }
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step);
        let bias2 = 1.0 - self.beta2.powi(self.step);
        let mut next = Vec::with_capacity(prior.len());
        for i in 0..prior.len() {
            let g = avg[i] as f64 - prior[i] as f64;
            self.momentum[i] = self.beta1 * self.momentum[i] + (1.0 - self.beta1) * g;
            self.velocity[i] = self.beta2 * self.velocity[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.momentum[i] / bias1;
            let v_hat = self.velocity[i] / bias2;
            next.push((prior[i] as f64 + self.server_lr * m_hat / (v_hat.sqrt() + self.epsilon)) as f32);
        }
        Ok(encode_weights(&next))
    }
}

/// Async-mode wrapper: moves the model only part of the way toward the inner
/// strategy's result, discounted by how stale the update is.
pub struct StalenessBlend {
    inner: Box<dyn AggregationStrategy>,
    mixing_rate: f64,
    staleness_weight: f64,
}

impl StalenessBlend {
    pub fn new(inner: Box<dyn AggregationStrategy>, cfg: &AsyncConfig) -> Self {
        Self { inner, mixing_rate: cfg.mixing_rate, staleness_weight: cfg.staleness_weight }
    }

    pub fn mix_for(&self, staleness: u64) -> f64 {
        let exp = i32::try_from(staleness).unwrap_or(i32::MAX);
        self.mixing_rate * self.staleness_weight.powi(exp)
    }
}

impl AggregationStrategy for StalenessBlend {
    fn name(&self) -> &'static str { self.inner.name() }

    fn aggregate(&mut self, current: &ModelBlob, updates: &[Contribution]) -> Result<ModelBlob, AggregationError> {
        let candidate = self.inner.aggregate(current, updates)?;
        let staleness = updates.iter().map(|u| u.staleness).max().unwrap_or(0);
        let mix = self.mix_for(staleness);
        if current.is_empty() || mix >= 1.0 {
            return Ok(candidate);
        }
        let prior = decode_weights(current)?;
        let next = decode_weights(&candidate)?;
        let blended: Vec<f32> =
            prior.iter().zip(&next).map(|(p, c)| (*p as f64 + mix * (*c as f64 - *p as f64)) as f32).collect();
        Ok(encode_weights(&blended))
    }
}

pub fn build_strategy(cfg: &AlgorithmConfig) -> Result<Box<dyn AggregationStrategy>, AggregationError> {
    let params = &cfg.hyperparameters;
    match cfg.name.to_ascii_lowercase().as_str() {
        "mean" => Ok(Box::new(Mean)),
        "fedavg" => Ok(Box::new(FedAvg)),
        "fedprox" => Ok(Box::new(FedProx::new(params.get("mu").copied().unwrap_or(0.01)))),
        "fedopt" => Ok(Box::new(FedOpt::with_hyperparameters(params))),
        other => Err(AggregationError::UnknownAlgorithm(other.to_string())),
    }
}
