//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Operator status and override HTTP API."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! Read-only status plus the two operator overrides. Every request goes
//! through [`ControllerHandle`], so overrides share the worker's busy guard.

use std::net::SocketAddr;

use ats_common::config::Mode;
use ats_core::{AtsError, ControllerHandle, ControllerStatus};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state injected into the axum handlers.
#[derive(Debug, Clone)]
pub struct ApiState {
    controller: ControllerHandle,
    mode: Mode,
    started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(controller: ControllerHandle, mode: Mode) -> Self {
        Self {
            controller,
            mode,
            started_at: Utc::now(),
        }
    }
}

/// Body of `GET /api/status`.
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: ControllerStatus,
}

/// Reply to an accepted override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideResponse {
    pub accepted: bool,
    pub message: String,
}

struct ApiError(AtsError);

impl From<AtsError> for ApiError {
    fn from(value: AtsError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            AtsError::Busy => StatusCode::CONFLICT,
            AtsError::InvalidOverride(_) => StatusCode::BAD_REQUEST,
            AtsError::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

fn parse_level(raw: &str, what: &str) -> Result<u8, ApiError> {
    raw.parse().map_err(|_| {
        ApiError(AtsError::InvalidOverride(format!(
            "{} must be a small non-negative integer, got {:?}",
            what, raw
        )))
    })
}

fn accepted(message: String) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(OverrideResponse {
            accepted: true,
            message,
        }),
    )
        .into_response()
}

async fn get_status(State(state): State<ApiState>) -> Result<Json<StatusBody>, ApiError> {
    let status = state.controller.status().await?;
    Ok(Json(StatusBody {
        mode: state.mode,
        started_at: state.started_at,
        status,
    }))
}

async fn post_generator(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let level = parse_level(&raw, "generator state")?;
    state.controller.force_generator(level).await?;
    info!(level, "generator override accepted");
    Ok(accepted(format!("generator override {} started", level)))
}

async fn post_load_shed_stage(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let stage = parse_level(&raw, "load shedding stage")?;
    state.controller.set_load_shed_stage(Some(stage)).await?;
    info!(stage, "load shedding stage override set");
    Ok(accepted(format!("load shedding stage pinned to {}", stage)))
}

async fn clear_load_shed_stage(State(state): State<ApiState>) -> Result<Response, ApiError> {
    state.controller.set_load_shed_stage(None).await?;
    info!("load shedding stage override cleared");
    Ok(accepted("load shedding stage override cleared".to_owned()))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/generator/:state", post(post_generator))
        .route(
            "/api/loadshedding",
            axum::routing::delete(clear_load_shed_stage),
        )
        .route("/api/loadshedding/:stage", post(post_load_shed_stage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the API listener and serve until [`ApiServerHandle::shutdown`].
pub async fn spawn_api_server(state: ApiState, listen: SocketAddr) -> anyhow::Result<ApiServerHandle> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "status api listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router(state)).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });
    let task = tokio::spawn(async move {
        if let Err(err) = server.await {
            warn!(error = %err, "status api exited with error");
        }
    });

    Ok(ApiServerHandle {
        address: local_addr,
        task,
        shutdown: shutdown_tx,
    })
}

#[derive(Debug)]
pub struct ApiServerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ApiServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_conflict() {
        let response = ApiError(AtsError::Busy).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = ApiError(AtsError::WorkerUnavailable).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn non_numeric_levels_are_invalid_overrides() {
        assert!(matches!(
            parse_level("on", "generator state"),
            Err(ApiError(AtsError::InvalidOverride(_)))
        ));
        assert_eq!(parse_level("1", "generator state").ok(), Some(1));
    }
}
