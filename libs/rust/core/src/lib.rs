//! Core shared code for the fedlink aggregator and collaborator services.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, Router};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub mod aggregation;
pub mod error;
pub mod metrics;
pub mod model;
pub mod plan;
pub mod resilience;
pub mod round;
pub mod security;
pub mod task;

pub use aggregation::{AggregationStrategy, Contribution};
pub use error::{AggregationError, FederationError};
pub use model::{ModelBlob, ModelUpdate, ModelView};
pub use plan::{CoordinationMode, FederationPlan};
pub use resilience::{retry_async, retry_async_if, RetryConfig};
pub use round::{FederationSnapshot, RoundEngine};
pub use security::{ClientTransport, SecuritySettings, ServerTransport};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }

/// Installs the global subscriber once. `RUST_LOG` filters (default `info`);
/// `FEDLINK_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDLINK_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = if json {
            fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false).boxed()
        } else {
            fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true).boxed()
        };
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "fedlink", service, "tracing_initialized");
    Ok(())
}

/// Produces the JSON body of `GET /status`.
pub type StatusProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Serves `/live`, `/ready` and `/status` on `port` (0 picks a free port) and
/// returns the bound address. The server runs until the runtime shuts down.
pub async fn start_health_server(port: u16, status: StatusProvider) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": true})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route(
            "/status",
            get(move || {
                let status = Arc::clone(&status);
                async move {
                    axum::Json(serde_json::json!({
                        "ready": NODE_READINESS.load(Ordering::SeqCst),
                        "federation": status(),
                    }))
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "health_server_listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "health_server_failed");
        }
    });
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get_path(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn status_endpoint_reports_federation() {
        let provider: StatusProvider = Arc::new(|| serde_json::json!({"current_round": 7}));
        let addr = start_health_server(0, provider).await.unwrap();
        let body = get_path(addr, "/status").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("\"current_round\":7"));
        let live = get_path(addr, "/live").await;
        assert!(live.contains("\"live\":true"));
    }
}
