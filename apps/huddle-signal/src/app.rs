use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::config::Config;
use crate::gate::AuthGate;
use crate::handlers;
use crate::hub::SignalingHub;
use crate::identity::IdentityVerifier;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub hub: SignalingHub,
    pub gate: Arc<AuthGate>,
    pub config: Arc<Config>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, metrics: Option<PrometheusHandle>) -> Self {
        let verifier = config.verifier.build();
        Self::with_verifier(config, verifier, metrics)
    }

    /// Like [`AppState::new`] but with a caller-supplied verifier.
    pub fn with_verifier(
        config: Config,
        verifier: Arc<dyn IdentityVerifier>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            hub: SignalingHub::new(config.outbound_buffer),
            gate: Arc::new(AuthGate::new(verifier, config.auth_timeout)),
            config: Arc::new(config),
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: Config, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        verifier = config.verifier.kind(),
        auth_timeout_ms = config.auth_timeout.as_millis() as u64,
        malformed_frames = ?config.malformed_frames,
        "starting huddle-signal"
    );

    let grace = config.shutdown_grace;
    serve(listener, AppState::new(config, metrics), shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierSource;
    use crate::identity::StaticVerifier;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(
            Config::with_verifier(VerifierSource::Static(StaticVerifier::new())),
            None,
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_ok() {
        let (status, body) = get_json(router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "status": "ok" }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stats_reflect_the_hub() {
        let state = state();
        let _pending = state.hub.open();
        let (status, body) = get_json(router(state), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connections"], 1);
        assert_eq!(body["peers"], 0);
        assert_eq!(body["pending"], 1);
        assert_eq!(body["peerList"], serde_json::json!([]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_without_recorder_is_not_found() {
        let (status, _) = get_json(router(state()), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
