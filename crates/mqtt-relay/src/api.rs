/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

use std::sync::Arc;

use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{StoreError, SubscribeError};
use crate::processor::SharedProcessor;
use crate::registry::Registry;
use crate::session::SessionStatus;
use crate::shutdown_handle::ShutdownHandle;
use crate::stats::IngestStatsTracker;
use crate::store::{ClientDefinition, ClientStore};

/// Everything the HTTP handlers need.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub clients: Arc<dyn ClientStore>,
    pub processor: SharedProcessor,
    pub ingest_stats: Arc<IngestStatsTracker>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/mqtt/subscribe", post(subscribe))
        .route("/mqtt/unsubscribe", post(unsubscribe))
        .route("/mqtt/status", post(status))
        .route("/mqtt/clients", get(list_clients))
        .route("/mqtt/clients/{client_id}/stats", get(client_stats))
        .route("/ingest/stats", get(ingest_stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    pub client: ClientDefinition,
}

#[derive(Debug, Deserialize)]
pub struct ClientIdRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientIdResponse {
    #[serde(rename = "clientID")]
    pub client_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub status: SessionStatus,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("no session for client {0}")]
    NotFound(String),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Subscribe(SubscribeError::InvalidClientId) => StatusCode::BAD_REQUEST,
            ApiError::Subscribe(_) => StatusCode::BAD_GATEWAY,
            ApiError::Store(StoreError::InvalidDefinition(_)) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}

// subscribe stores the definition first, so a client whose brokers are down
// right now is still replayed on the next start.
async fn subscribe(
    AxumState(state): AxumState<ApiState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<ClientIdResponse>, ApiError> {
    let SubscribeRequest { client_id, client } = request;
    let client_id = if client_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        client_id
    };
    client.validate()?;
    let topics = client.topic_map()?;

    state.clients.save_client(&client_id, &client).await?;
    state
        .registry
        .subscribe(
            &client_id,
            client.credentials(),
            client.broker_set(),
            topics,
            state.processor.clone(),
        )
        .await?;

    Ok(Json(ClientIdResponse { client_id }))
}

async fn unsubscribe(
    AxumState(state): AxumState<ApiState>,
    Json(request): Json<ClientIdRequest>,
) -> Result<Json<ClientIdResponse>, ApiError> {
    if request.client_id.is_empty() {
        return Err(ApiError::BadRequest("clientID must not be empty".to_string()));
    }
    state.clients.stop_client(&request.client_id).await?;
    state.registry.unsubscribe(&request.client_id);
    Ok(Json(ClientIdResponse {
        client_id: request.client_id,
    }))
}

async fn status(
    AxumState(state): AxumState<ApiState>,
    Json(request): Json<ClientIdRequest>,
) -> Json<StatusResponse> {
    let status = state.registry.status(&request.client_id);
    Json(StatusResponse {
        client_id: request.client_id,
        status,
    })
}

async fn list_clients(AxumState(state): AxumState<ApiState>) -> Json<Vec<String>> {
    Json(state.registry.client_ids())
}

async fn client_stats(
    AxumState(state): AxumState<ApiState>,
    Path(client_id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .registry
        .session_info(&client_id)
        .map(|info| Json(info).into_response())
        .ok_or(ApiError::NotFound(client_id))
}

async fn ingest_stats(AxumState(state): AxumState<ApiState>) -> Response {
    Json(state.ingest_stats.to_stats()).into_response()
}

/// Serve the API on `listener` until the returned handle is shut down.
pub fn spawn(listener: TcpListener, state: ApiState) -> ApiHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state);
    let join_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_rx.await.ok();
            })
            .await;
        if let Err(error) = result {
            tracing::error!(%error, "HTTP server failed");
        }
        tracing::info!("HTTP server stopped");
    });

    ApiHandle {
        shutdown_tx,
        join_handle,
    }
}

pub struct ApiHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ShutdownHandle<()> for ApiHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}
