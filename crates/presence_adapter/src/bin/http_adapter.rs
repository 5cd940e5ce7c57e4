#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use presence_adapter::{
    AdapterEnvConfig, AdapterError, AdapterErrorResponse, AdapterRuntime, AdminClockRequest,
    ContextUpsertAdapterRequest, ScanAdapterRequest,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type SharedRuntime = Arc<AdapterRuntime>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AdapterEnvConfig::from_env();
    let addr: SocketAddr = config.bind.parse()?;
    let runtime: SharedRuntime = Arc::new(AdapterRuntime::from_env_config(&config)?);

    if config.reconcile_worker_enabled {
        let runtime_for_worker = runtime.clone();
        let interval_ms = config.reconcile_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let report = runtime_for_worker.run_reconcile_worker_pass(None);
                if !report.reconciled.is_empty() {
                    warn!(
                        reconciled = report.reconciled.len(),
                        contexts_checked = report.contexts_checked,
                        "reconcile worker repaired drifted contexts"
                    );
                }
            }
        });
    }

    let runtime_for_retry = runtime.clone();
    let retry_interval_ms = config.audit_retry_interval_ms;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(retry_interval_ms));
        loop {
            ticker.tick().await;
            let report = runtime_for_retry.run_audit_retry_worker_pass();
            if report.flushed > 0 || report.remaining > 0 {
                debug!(
                    flushed = report.flushed,
                    remaining = report.remaining,
                    "audit retry worker pass"
                );
            }
        }
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/scan", post(run_scan))
        .route("/v1/contexts/:context_id", axum::routing::put(upsert_context))
        .route("/v1/contexts/:context_id/sessions", get(active_sessions))
        .route(
            "/v1/contexts/:context_id/sessions/:session_id/force-close",
            post(force_close),
        )
        .route("/v1/contexts/:context_id/reconcile", post(reconcile))
        .route("/v1/contexts/:context_id/occupancy", get(occupancy))
        .route(
            "/v1/contexts/:context_id/attendance/:subject_id",
            get(attendance),
        )
        .with_state(runtime.clone());

    info!(
        %addr,
        reconcile_worker_enabled = config.reconcile_worker_enabled,
        reconcile_interval_ms = config.reconcile_interval_ms,
        audit_retry_interval_ms = config.audit_retry_interval_ms,
        "presence_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = runtime.run_audit_retry_worker_pass();
    if report.remaining > 0 {
        warn!(
            remaining = report.remaining,
            "shutting down with unwritten access log entries"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn respond<T: Serialize>(result: Result<T, AdapterError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            let status = StatusCode::from_u16(err.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                warn!(error = %err, "request failed");
            }
            (status, Json(AdapterErrorResponse::from(&err))).into_response()
        }
    }
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Response {
    (StatusCode::OK, Json(runtime.health_report())).into_response()
}

async fn run_scan(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<ScanAdapterRequest>,
) -> Response {
    respond(runtime.run_scan(request))
}

async fn active_sessions(
    State(runtime): State<SharedRuntime>,
    Path(context_id): Path<String>,
) -> Response {
    respond(runtime.active_sessions(&context_id))
}

async fn force_close(
    State(runtime): State<SharedRuntime>,
    Path((context_id, session_id)): Path<(String, u64)>,
    body: Option<Json<AdminClockRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    respond(runtime.force_close(&context_id, session_id, request))
}

async fn upsert_context(
    State(runtime): State<SharedRuntime>,
    Path(context_id): Path<String>,
    Json(request): Json<ContextUpsertAdapterRequest>,
) -> Response {
    respond(runtime.upsert_context(&context_id, request))
}

async fn reconcile(
    State(runtime): State<SharedRuntime>,
    Path(context_id): Path<String>,
    body: Option<Json<AdminClockRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    respond(runtime.reconcile(&context_id, request))
}

async fn occupancy(
    State(runtime): State<SharedRuntime>,
    Path(context_id): Path<String>,
) -> Response {
    respond(runtime.occupancy(&context_id))
}

async fn attendance(
    State(runtime): State<SharedRuntime>,
    Path((context_id, subject_id)): Path<(String, String)>,
) -> Response {
    respond(runtime.attendance(&context_id, &subject_id))
}
