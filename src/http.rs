//! Operational HTTP endpoints.
//!
//! `/metrics` serves the Prometheus registry; `/healthz` reports the live
//! registry population so load balancers can tell an empty core from a dead
//! one. The server runs as a background task owned by the supervisor's
//! shutdown channel and drains with the rest of the control plane.

use crate::supervisor::Supervisor;
use axum::extract::State;
use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;

async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// Registry population snapshot. Counts exclude DEAD entries waiting out
/// their recycle window.
async fn health_handler(State(supervisor): State<Arc<Supervisor>>) -> String {
    serde_json::json!({
        "proxies": supervisor.proxies.live_count(),
        "backends": supervisor.backends.live_count(),
        "pendingEvacuations": supervisor.evacuation.pending_count(),
        "activeProfile": supervisor
            .netconfig
            .get_active_profile()
            .map(|p| p.profile_id.clone())
            .ok(),
    })
    .to_string()
}

/// Spawn the operational HTTP server on `0.0.0.0:port`. Stops when the
/// supervisor broadcasts shutdown.
pub fn spawn(supervisor: Arc<Supervisor>, port: u16) {
    let mut shutdown_rx = supervisor.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(health_handler))
            .with_state(supervisor);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(%addr, error = %e, "Failed to bind operational HTTP endpoint");
                return;
            }
        };
        tracing::info!(%addr, "Operational HTTP endpoint listening");

        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        });
        if let Err(e) = server.await {
            tracing::error!(error = %e, "Operational HTTP endpoint failed");
        }
    });
}
