//! Aggregator process: exposes the round engine over gRPC.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedlink_core::model::{ModelBlob, ModelUpdate, ModelView};
use fedlink_core::plan::FederationPlan;
use fedlink_core::{clear_ready, init_tracing, mark_ready, start_health_server};
use fedlink_core::{FederationError, RoundEngine, ServerTransport};
use fedlink_proto::federation::federation_server::{Federation, FederationServer};
use fedlink_proto::federation::{
    GetModelRequest, JoinRequest, JoinResponse, ModelSnapshot, ModelUpdate as UpdateMessage, SubmitAck,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

/// Largest model payload accepted on either side of the link.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct FederationService {
    engine: Arc<RoundEngine>,
    output_model: Option<PathBuf>,
    /// Version of the model last written to `output_model`.
    written_version: Arc<Mutex<u64>>,
    /// Cancelled once the server starts draining; ends in-flight long-polls.
    draining: CancellationToken,
}

impl FederationService {
    pub fn new(engine: Arc<RoundEngine>) -> Self {
        Self { engine, output_model: None, written_version: Arc::new(Mutex::new(0)), draining: CancellationToken::new() }
    }

    pub fn with_output_model(mut self, path: Option<PathBuf>) -> Self {
        self.output_model = path;
        self
    }

    pub fn engine(&self) -> &Arc<RoundEngine> { &self.engine }

    /// Writes a freshly aggregated model to `output_model`. Runs after the
    /// round lock is released; failures are logged only.
    pub async fn publish(&self, view: &ModelView) {
        let Some(path) = &self.output_model else { return };
        let mut written = self.written_version.lock().await;
        if view.version <= *written {
            return;
        }
        let tmp = path.with_extension("tmp");
        let res = async {
            tokio::fs::write(&tmp, view.model.as_bytes()).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        match res {
            Ok(()) => {
                *written = view.version;
                info!(path = %path.display(), round = view.round, version = view.version, "model_written");
            }
            Err(e) => error!(error = %e, path = %path.display(), "model_write_failed"),
        }
    }
}

#[async_trait]
impl Federation for FederationService {
    #[instrument(skip(self, request), fields(collaborator = %request.get_ref().collaborator_id))]
    async fn join_federation(&self, request: Request<JoinRequest>) -> Result<Response<JoinResponse>, Status> {
        let req = request.into_inner();
        let out = self.engine.join(&req.collaborator_id)?;
        Ok(Response::new(JoinResponse {
            model: out.view.model.into_bytes(),
            current_round: out.view.round,
            model_version: out.view.version,
            newly_joined: out.newly_joined,
        }))
    }

    #[instrument(skip(self, request), fields(collaborator = %request.get_ref().collaborator_id, base_round = request.get_ref().base_round))]
    async fn submit_update(&self, request: Request<UpdateMessage>) -> Result<Response<SubmitAck>, Status> {
        let req = request.into_inner();
        let update = ModelUpdate::new(ModelBlob::from(req.weights)).trained_on(req.base_round).with_samples(req.sample_count);
        let out = self.engine.submit(&req.collaborator_id, update)?;
        if let Some(view) = &out.closed {
            self.publish(view).await;
        }
        Ok(Response::new(SubmitAck {
            accepted: true,
            current_round: out.round,
            round_closed: out.closed.is_some(),
            pending: u32::try_from(out.pending).unwrap_or(u32::MAX),
        }))
    }

    #[instrument(skip(self, request), fields(collaborator = %request.get_ref().collaborator_id, min_round = request.get_ref().min_round))]
    async fn get_latest_model(&self, request: Request<GetModelRequest>) -> Result<Response<ModelSnapshot>, Status> {
        let req = request.into_inner();
        let wait = self.engine.wait_for_round(&req.collaborator_id, req.min_round, Duration::from_millis(req.wait_ms));
        let view = tokio::select! {
            res = wait => res?,
            _ = self.draining.cancelled() => {
                debug!("long_poll_cut_short_by_shutdown");
                self.engine.latest_model(&req.collaborator_id)?
            }
        };
        Ok(Response::new(ModelSnapshot { model: view.model.into_bytes(), current_round: view.round, model_version: view.version }))
    }
}

/// Serves the federation on `listener` until `shutdown` resolves.
pub async fn serve<F>(service: FederationService, transport: ServerTransport, listener: TcpListener, shutdown: F) -> Result<(), FederationError>
where
    F: Future<Output = ()>,
{
    let tls = transport.is_tls();
    let addr = listener.local_addr().map_err(|e| FederationError::Transport(e.to_string()))?;
    let draining = service.draining.clone();
    let shutdown = async move {
        shutdown.await;
        draining.cancel();
    };
    let grpc = FederationServer::new(service)
        .max_decoding_message_size(MAX_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_MESSAGE_BYTES);
    info!(%addr, tls, schema = fedlink_proto::SCHEMA_VERSION, "aggregator_listening");
    transport
        .apply(Server::builder())?
        .add_service(grpc)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| FederationError::Transport(e.to_string()))
}

/// Force-closes sync rounds left open longer than `timeout` with at least
/// one pending update.
pub fn spawn_round_watchdog(service: FederationService, timeout: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let period = (timeout / 4).max(Duration::from_millis(250));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match service.engine().close_if_overdue(timeout) {
                Ok(Some(view)) => service.publish(&view).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "forced_round_close_failed"),
            }
        }
    })
}

async fn load_initial_model(plan: &FederationPlan) -> Result<ModelBlob, FederationError> {
    match &plan.initial_model {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| FederationError::Configuration(format!("cannot read initial model {}: {e}", path.display())))?;
            info!(path = %path.display(), bytes = bytes.len(), "initial_model_loaded");
            Ok(ModelBlob::from(bytes))
        }
        None => {
            warn!("no_initial_model_configured");
            Ok(ModelBlob::empty())
        }
    }
}

/// Process entry point. Reads the plan named by `FEDLINK_PLAN` (default `plan.yaml`).
pub async fn run() -> anyhow::Result<()> {
    init_tracing("aggregator")?;
    let plan_path = std::env::var("FEDLINK_PLAN").unwrap_or_else(|_| "plan.yaml".into());
    let plan = FederationPlan::load(&plan_path)?;
    info!(plan = %plan_path, mode = plan.coordination_mode().name(), collaborators = plan.collaborators.len(), "plan_loaded");

    let transport = ServerTransport::from_settings(&plan.security)?;
    let engine = Arc::new(RoundEngine::from_plan(&plan, load_initial_model(&plan).await?)?);
    let service = FederationService::new(Arc::clone(&engine)).with_output_model(plan.output_model.clone());

    if let Some(port) = plan.health_port {
        let status_engine = Arc::clone(&engine);
        start_health_server(port, Arc::new(move || serde_json::to_value(status_engine.snapshot()).unwrap_or_default())).await?;
    }

    let cancel = CancellationToken::new();
    if let Some(secs) = plan.aggregator.round_timeout_secs {
        if plan.coordination_mode().is_async() {
            warn!("round_timeout_ignored_in_async_mode");
        } else {
            spawn_round_watchdog(service.clone(), Duration::from_secs(secs), cancel.clone());
        }
    }

    let listener = TcpListener::bind(&plan.aggregator.address).await?;
    mark_ready();
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown_signal_received"),
                _ = cancel.cancelled() => {}
            }
        }
    };
    let result = serve(service, transport, listener, shutdown).await;
    cancel.cancel();
    clear_ready();
    info!(round = engine.current_round(), version = engine.model_version(), "aggregator_stopped");
    result?;
    Ok(())
}
