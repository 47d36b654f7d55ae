use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use shutterbox::{BlobStore, LocalBlobStore, LocalLog, ShutterboxError, StoreConfig};
use shutterbox_replication::{LogRemoteStore, ReplicationConfig, ReplicationManager};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{
    capture_status, create_capture, health, retry_capture, serve_upload, AppState,
};

/// What this process is: a kiosk that captures and forwards, or the central
/// store that receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    Kiosk,
    Central,
}

impl FromStr for ServeMode {
    type Err = ShutterboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kiosk" => Ok(ServeMode::Kiosk),
            "central" => Ok(ServeMode::Central),
            other => Err(ShutterboxError::Config(format!(
                "unknown mode {:?} (expected kiosk or central)",
                other
            ))),
        }
    }
}

/// Routes without the transport layers `serve` adds.
pub fn router(state: Arc<AppState>) -> Router {
    let captures = Router::new()
        .route("/api/captures", post(create_capture))
        .route("/api/captures/:id", get(capture_status))
        .route("/api/captures/:id/retry", post(retry_capture));

    // Internal replication endpoints (no auth)
    let internal = Router::new()
        .route(
            "/internal/records/upsert",
            post(crate::handlers::internal::upsert_records),
        )
        .route(
            "/internal/blobs/:id",
            put(crate::handlers::internal::put_blob),
        )
        .route(
            "/internal/status",
            get(crate::handlers::internal::replication_status),
        )
        .route(
            "/internal/sync",
            post(crate::handlers::internal::trigger_sync),
        );

    Router::new()
        .route("/health", get(health))
        .route("/uploads/:file", get(serve_upload))
        .merge(captures)
        .merge(internal)
        .with_state(state)
}

fn build_state(
    mode: ServeMode,
    store: &StoreConfig,
    replication: ReplicationConfig,
) -> Result<AppState, ShutterboxError> {
    let node_id = replication.node_id.clone();
    match mode {
        ServeMode::Kiosk => {
            let manager = ReplicationManager::from_config(replication, store)?;
            if manager.is_enabled() {
                tracing::info!(
                    "Replication enabled: {} -> {}",
                    node_id,
                    manager.config().remote_url.as_deref().unwrap_or_default()
                );
            } else {
                tracing::info!("Replication disabled (no SHUTTERBOX_REMOTE_URL)");
            }
            manager.start()?;
            Ok(AppState {
                node_id,
                mode,
                log: Arc::clone(manager.log()),
                blobs: Arc::clone(manager.blobs()),
                replication_manager: Some(manager),
                central: None,
            })
        }
        ServeMode::Central => {
            let log = Arc::new(LocalLog::open_with_threshold(
                &store.log_dir(),
                store.compact_threshold,
            )?);
            let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(store.blob_dir.clone()));
            let central = LogRemoteStore::new(Arc::clone(&log)).with_blobs(Arc::clone(&blobs));
            tracing::info!("Central store: accepting kiosk batches and photos");
            Ok(AppState {
                node_id,
                mode,
                central: Some(central),
                log,
                blobs,
                replication_manager: None,
            })
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

pub async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mode: ServeMode = std::env::var("SHUTTERBOX_MODE")
        .unwrap_or_else(|_| "kiosk".into())
        .parse()?;
    let bind_addr =
        std::env::var("SHUTTERBOX_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let max_body_mb: usize = std::env::var("SHUTTERBOX_MAX_BODY_MB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);

    let store = StoreConfig::from_env();
    let replication = ReplicationConfig::load_or_default(&store.data_dir);
    tracing::info!(
        data_dir = %store.data_dir.display(),
        blob_dir = %store.blob_dir.display(),
        retention_days = store.retention_days,
        "Store configuration loaded"
    );

    let state = Arc::new(build_state(mode, &store, replication)?);

    let app = router(Arc::clone(&state))
        .layer(DefaultBodyLimit::max(max_body_mb * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive().max_age(std::time::Duration::from_secs(86400)));

    tracing::info!("Starting Shutterbox {:?} on {}", mode, bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(manager) = &state.replication_manager {
        manager.shutdown();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("kiosk".parse::<ServeMode>().unwrap(), ServeMode::Kiosk);
        assert_eq!(" Central ".parse::<ServeMode>().unwrap(), ServeMode::Central);
        assert!(matches!(
            "edge".parse::<ServeMode>(),
            Err(ShutterboxError::Config(_))
        ));
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ServeMode::Central).unwrap(),
            serde_json::json!("central")
        );
    }
}
