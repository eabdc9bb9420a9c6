//! Error taxonomy shared by the aggregator and collaborators.
//!
//! `FederationError` crosses the gRPC boundary in both directions: the
//! aggregator turns it into a `tonic::Status` and collaborators map the status
//! code back, so the same variant is observed on both sides of a call.

use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

const BASE_ROUND_KEY: &str = "fedlink-base-round";
const CURRENT_ROUND_KEY: &str = "fedlink-current-round";

#[derive(Debug, Error)]
pub enum FederationError {
    /// Bad or missing configuration / security material. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Operation on an identity that never joined. Recoverable by re-joining.
    #[error("unknown collaborator `{0}`")]
    UnknownCollaborator(String),
    #[error("collaborator `{0}` is not listed in the federation plan")]
    MembershipDenied(String),
    /// External trainer exited non-zero or its files could not be read/written.
    #[error("training failed: {0}")]
    TrainingFailure(String),
    #[error("transport failure: {0}")]
    Transport(String),
    /// Rejected before reaching the subprocess or the round state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("stale update: trained against round {base_round}, aggregator is at round {current_round}")]
    StaleUpdate { base_round: u64, current_round: u64 },
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("no updates to aggregate")]
    EmptyRound,
    #[error("model blob of {0} bytes is not a whole number of f32 weights")]
    MalformedBlob(usize),
    #[error("update from `{collaborator}` has {actual} weights, expected {expected}")]
    LengthMismatch { collaborator: String, expected: usize, actual: usize },
    #[error("unsupported aggregation algorithm `{0}`")]
    UnknownAlgorithm(String),
    #[error("aggregation failed on the aggregator: {0}")]
    Remote(String),
}

impl FederationError {
    /// Errors a collaborator may recover from without terminating its run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FederationError::UnknownCollaborator(_) | FederationError::StaleUpdate { .. })
    }
}

impl From<FederationError> for Status {
    fn from(err: FederationError) -> Self {
        let msg = err.to_string();
        match err {
            FederationError::UnknownCollaborator(_) => Status::not_found(msg),
            FederationError::MembershipDenied(_) => Status::permission_denied(msg),
            FederationError::InvalidArgument(_) => Status::invalid_argument(msg),
            FederationError::StaleUpdate { base_round, current_round } => {
                let mut status = Status::failed_precondition(msg);
                let md = status.metadata_mut();
                if let Ok(v) = MetadataValue::try_from(base_round.to_string().as_str()) { md.insert(BASE_ROUND_KEY, v); }
                if let Ok(v) = MetadataValue::try_from(current_round.to_string().as_str()) { md.insert(CURRENT_ROUND_KEY, v); }
                status
            }
            FederationError::Aggregation(_) => Status::aborted(msg),
            FederationError::Cancelled => Status::cancelled(msg),
            FederationError::Configuration(_)
            | FederationError::TrainingFailure(_)
            | FederationError::Transport(_) => Status::internal(msg),
        }
    }
}

impl From<Status> for FederationError {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            Code::NotFound => FederationError::UnknownCollaborator(msg),
            Code::PermissionDenied => FederationError::MembershipDenied(msg),
            Code::InvalidArgument => FederationError::InvalidArgument(msg),
            Code::FailedPrecondition => FederationError::StaleUpdate {
                base_round: round_from_metadata(&status, BASE_ROUND_KEY),
                current_round: round_from_metadata(&status, CURRENT_ROUND_KEY),
            },
            Code::Aborted => FederationError::Aggregation(AggregationError::Remote(msg)),
            code => FederationError::Transport(format!("{code:?}: {msg}")),
        }
    }
}

fn round_from_metadata(status: &Status, key: &str) -> u64 {
    status.metadata().get(key).and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_update_survives_status_round_trip() {
        let status: Status = FederationError::StaleUpdate { base_round: 3, current_round: 5 }.into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        match FederationError::from(status) {
            FederationError::StaleUpdate { base_round, current_round } => {
                assert_eq!(base_round, 3);
                assert_eq!(current_round, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unavailable_maps_to_transport() {
        let err = FederationError::from(Status::unavailable("connection refused"));
        assert!(matches!(err, FederationError::Transport(_)));
        assert!(!err.is_recoverable());
        assert!(FederationError::from(Status::not_found("x")).is_recoverable());
    }
}
