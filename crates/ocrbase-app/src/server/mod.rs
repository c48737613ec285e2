//! HTTP surface: submission API, job reads, uploads, realtime gateway.

pub mod auth;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::paths::{AppPaths, PathError};
use crate::services::{
    BlobStore, EventBus, FsBlobStore, HttpLlmClient, HttpOcrEngine, JobStore, JobStoreError,
    JobWorker, LlmClient, LlmConfig, LlmError, LmdbJobStore, LmdbSchemaStore, OcrConfig, OcrEngine,
    OcrError, QueueConfig, QueueError, SchemaStore, SchemaStoreError, StructuredExtractor,
    SubmissionService, SubmitLimits, UploadSigner, WorkQueue,
};

use auth::ApiKeyAuth;
use state::AppState;

const HEALTHZ_PATH: &str = "/v1/healthz";
const HEALTHZ_STATUS: &str = "ok";
// Headroom over the 50 MiB document limit for multipart framing.
const BODY_LIMIT_SLACK_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error(transparent)]
    SchemaStore(#[from] SchemaStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Everything a running node owns: the stores, the queue, and the worker
/// handler, plus the HTTP state built over them.
pub struct AppRuntime {
    pub state: AppState,
    pub queue: Arc<WorkQueue>,
    pub worker: Arc<JobWorker>,
}

pub fn build_runtime(config: &AppConfig) -> Result<AppRuntime, ServerError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let jobs: Arc<dyn JobStore> = Arc::new(LmdbJobStore::open(&paths)?);
    let schemas: Arc<dyn SchemaStore> = Arc::new(LmdbSchemaStore::open(&paths)?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(paths.blobs_dir()?));

    let queue_config = QueueConfig {
        concurrency: config.queue.concurrency,
        max_attempts: config.queue.max_attempts,
        backoff_base_ms: config.queue.backoff_base_ms,
        backoff_max_ms: config.queue.backoff_max_ms,
        lease_ttl_ms: config.queue.lease_ttl_ms,
        poll_interval_ms: config.queue.poll_interval_ms,
    };
    let queue = Arc::new(WorkQueue::open(&paths, queue_config)?);

    let bus = EventBus::new();
    let signer = UploadSigner::new(&config.auth.presign_secret);
    let limits = SubmitLimits {
        max_file_size_bytes: config.limits.max_file_size_bytes,
        presign_ttl_ms: (config.limits.presign_ttl_secs as i64).saturating_mul(1_000),
    };
    let submission = Arc::new(SubmissionService::new(
        Arc::clone(&jobs),
        Arc::clone(&blobs),
        Arc::clone(&schemas),
        Arc::clone(&queue),
        bus.clone(),
        signer.clone(),
        config.server.public_base_url.clone(),
        limits,
    ));

    let ocr: Arc<dyn OcrEngine> = Arc::new(HttpOcrEngine::from_env(
        OcrConfig::builder()
            .base_url(config.ocr.base_url.clone())
            .model(config.ocr.model.clone())
            .max_tokens(config.ocr.max_tokens)
            .timeout_secs(config.ocr.timeout_secs)
            .build(),
    )?);
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::from_env(
        LlmConfig::builder()
            .base_url(config.llm.base_url.clone())
            .model(config.llm.model.clone())
            .max_tokens(config.llm.max_tokens)
            .timeout_secs(config.llm.timeout_secs)
            .build(),
    )?);
    let worker = Arc::new(JobWorker::new(
        Arc::clone(&jobs),
        Arc::clone(&blobs),
        Arc::clone(&schemas),
        ocr,
        StructuredExtractor::new(llm),
        bus.clone(),
        Duration::from_millis(config.queue.attempt_timeout_ms),
    ));

    let state = AppState {
        jobs,
        blobs,
        schemas,
        queue: Arc::clone(&queue),
        bus,
        submission,
        auth: Arc::new(ApiKeyAuth::new(&config.auth.api_keys)),
        signer,
        keepalive: Duration::from_secs(config.server.keepalive_secs),
        max_upload_bytes: config.limits.max_file_size_bytes,
    };

    Ok(AppRuntime {
        state,
        queue,
        worker,
    })
}

pub fn build_router(state: AppState) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    let body_limit = (state.max_upload_bytes + BODY_LIMIT_SLACK_BYTES) as usize;

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route("/v1/parse", post(routes::submit::submit_parse))
        .route("/v1/extract", post(routes::submit::submit_extract))
        .route("/v1/uploads/presign", post(routes::uploads::presign))
        .route(
            "/v1/uploads/{job_id}/complete",
            post(routes::uploads::complete),
        )
        .route("/v1/uploads/put/{token}", put(routes::uploads::put_presigned))
        .route("/v1/jobs", get(routes::jobs::list_jobs))
        .route("/v1/jobs/{id}", get(routes::jobs::get_job))
        .route("/v1/realtime", get(routes::realtime::realtime))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Run the API server and the worker pool until Ctrl+C / SIGTERM.
pub async fn serve(config: AppConfig) -> Result<(), ServerError> {
    debug_assert!(!config.server.listen_addr.contains('\n'));
    let runtime = build_runtime(&config)?;

    let listen_addr = parse_listen_addr(&config.server.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "ocrbase server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue_handle = tokio::spawn(
        Arc::clone(&runtime.queue).run(runtime.worker.clone(), shutdown_rx.clone()),
    );

    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    let graceful = {
        let mut rx = shutdown_rx;
        async move {
            let _ = rx.changed().await;
        }
    };

    let app = build_router(runtime.state);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await;

    let _ = queue_handle.await;
    tracing::info!("server shutdown complete");
    served.map_err(|source| ServerError::Serve { source })
}

/// Run only the worker pool; useful for scaling processing independently
/// of the API surface.
pub async fn run_worker(config: AppConfig) -> Result<(), ServerError> {
    let runtime = build_runtime(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    Arc::clone(&runtime.queue)
        .run(runtime.worker.clone(), shutdown_rx)
        .await;
    Ok(())
}

fn parse_listen_addr(raw: &str) -> Result<SocketAddr, ServerError> {
    if raw.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }
    raw.parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: raw.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

async fn healthz() -> impl IntoResponse {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to capture Ctrl+C signal");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let sigterm = async {
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = ctrl_c => tracing::info!("received Ctrl+C"),
            _ = sigterm => tracing::info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_parsing() {
        assert!(matches!(
            parse_listen_addr(""),
            Err(ServerError::EmptyListenAddr)
        ));
        assert!(matches!(
            parse_listen_addr("not-an-addr"),
            Err(ServerError::InvalidListenAddr { .. })
        ));
        let addr = parse_listen_addr("127.0.0.1:8080").expect("valid");
        assert_eq!(addr.port(), 8080);
    }
}
