//! Opaque model payloads exchanged between collaborators and the aggregator.

use bytes::Bytes;

/// Serialized model weights. Never parsed by the round engine; only
/// aggregation strategies interpret the contents.
#[derive(Clone, Debug, Default)]
pub struct ModelBlob(Bytes);

impl ModelBlob {
    pub fn new(bytes: impl Into<Bytes>) -> Self { Self(bytes.into()) }

    pub fn empty() -> Self { Self(Bytes::new()) }

    pub fn as_bytes(&self) -> &[u8] { &self.0 }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Reference identity: true when both handles share the same buffer.
    pub fn same_as(&self, other: &ModelBlob) -> bool {
        self.0.as_ptr() == other.0.as_ptr() && self.0.len() == other.0.len()
    }

    pub fn into_bytes(self) -> Bytes { self.0 }
}

impl From<Vec<u8>> for ModelBlob {
    fn from(v: Vec<u8>) -> Self { Self(Bytes::from(v)) }
}

impl From<Bytes> for ModelBlob {
    fn from(b: Bytes) -> Self { Self(b) }
}

/// The aggregator's current model together with its round coordinates.
#[derive(Clone, Debug)]
pub struct ModelView {
    pub model: ModelBlob,
    pub round: u64,
    pub version: u64,
}

/// One collaborator's training result for one round.
#[derive(Clone, Debug)]
pub struct ModelUpdate {
    pub model: ModelBlob,
    /// Round of the model this update was trained against, if known.
    pub base_round: Option<u64>,
    pub sample_count: u64,
}

impl ModelUpdate {
    pub fn new(model: impl Into<ModelBlob>) -> Self {
        Self { model: model.into(), base_round: None, sample_count: 0 }
    }

    pub fn trained_on(mut self, round: u64) -> Self {
        self.base_round = (round > 0).then_some(round);
        self
    }

    pub fn with_samples(mut self, samples: u64) -> Self {
        self.sample_count = samples;
        self
    }
}
