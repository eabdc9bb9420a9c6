//! Collaborator-side view of the federation service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedlink_core::model::{ModelBlob, ModelUpdate, ModelView};
use fedlink_core::{ClientTransport, FederationError, RoundEngine};
use fedlink_proto::federation::federation_client::FederationClient;
use fedlink_proto::federation::{GetModelRequest, JoinRequest, ModelUpdate as UpdateMessage};
use tonic::transport::{Channel, Endpoint};

const MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub round: u64,
    pub round_closed: bool,
}

#[async_trait]
pub trait FederationTransport: Send + Sync {
    async fn join(&self, id: &str) -> Result<ModelView, FederationError>;
    async fn submit(&self, id: &str, update: ModelUpdate) -> Result<SubmitReceipt, FederationError>;
    /// Latest model; with a non-zero `wait`, long-polls until `min_round`.
    async fn latest_model(&self, id: &str, min_round: u64, wait: Duration) -> Result<ModelView, FederationError>;
}

/// gRPC client. Connects lazily; every call is bounded by the RPC timeout
/// plus any long-poll budget.
pub struct GrpcTransport {
    client: FederationClient<Channel>,
    rpc_timeout: Duration,
}

impl GrpcTransport {
    pub fn connect(address: &str, security: &ClientTransport, rpc_timeout: Duration) -> Result<Self, FederationError> {
        let uri = security.endpoint_uri(address);
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| FederationError::Configuration(format!("invalid aggregator address {uri}: {e}")))?
            .connect_timeout(rpc_timeout);
        let channel = security.configure(endpoint)?.connect_lazy();
        let client = FederationClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);
        Ok(Self { client, rpc_timeout })
    }

    async fn bounded<T, F>(&self, limit: Duration, call: F) -> Result<T, FederationError>
    where
        F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(FederationError::from(status)),
            Err(_) => Err(FederationError::Transport(format!("call timed out after {limit:?}"))),
        }
    }
}

#[async_trait]
impl FederationTransport for GrpcTransport {
    async fn join(&self, id: &str) -> Result<ModelView, FederationError> {
        let mut client = self.client.clone();
        let resp = self.bounded(self.rpc_timeout, client.join_federation(JoinRequest { collaborator_id: id.to_string() })).await?;
        Ok(ModelView { model: ModelBlob::from(resp.model), round: resp.current_round, version: resp.model_version })
    }

    async fn submit(&self, id: &str, update: ModelUpdate) -> Result<SubmitReceipt, FederationError> {
        let mut client = self.client.clone();
        let msg = UpdateMessage {
            collaborator_id: id.to_string(),
            weights: update.model.into_bytes(),
            base_round: update.base_round.unwrap_or(0),
            sample_count: update.sample_count,
        };
        let ack = self.bounded(self.rpc_timeout, client.submit_update(msg)).await?;
        Ok(SubmitReceipt { round: ack.current_round, round_closed: ack.round_closed })
    }

    async fn latest_model(&self, id: &str, min_round: u64, wait: Duration) -> Result<ModelView, FederationError> {
        let mut client = self.client.clone();
        let req = GetModelRequest {
            collaborator_id: id.to_string(),
            min_round,
            wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
        };
        let snap = self.bounded(self.rpc_timeout + wait, client.get_latest_model(req)).await?;
        Ok(ModelView { model: ModelBlob::from(snap.model), round: snap.current_round, version: snap.model_version })
    }
}

/// Talks to a round engine in the same process.
pub struct InProcessTransport {
    engine: Arc<RoundEngine>,
}

impl InProcessTransport {
    pub fn new(engine: Arc<RoundEngine>) -> Self { Self { engine } }
}

#[async_trait]
impl FederationTransport for InProcessTransport {
    async fn join(&self, id: &str) -> Result<ModelView, FederationError> {
        Ok(self.engine.join(id)?.view)
    }

    async fn submit(&self, id: &str, update: ModelUpdate) -> Result<SubmitReceipt, FederationError> {
        let out = self.engine.submit(id, update)?;
        Ok(SubmitReceipt { round: out.round, round_closed: out.closed.is_some() })
    }

    async fn latest_model(&self, id: &str, min_round: u64, wait: Duration) -> Result<ModelView, FederationError> {
        self.engine.wait_for_round(id, min_round, wait).await
    }
}
