//! Axum HTTP surface for the registry and the pending-event queue.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | POST | `/uniform/registration` | register (201 created / 200 refreshed) |
//! | GET | `/uniform/registration` | filtered list |
//! | DELETE | `/uniform/registration/{id}` | unregister |
//! | PUT | `/uniform/registration/{id}/ping` | heartbeat |
//! | POST, GET | `/uniform/registration/{id}/subscription` | create / list |
//! | GET, PUT, DELETE | `/uniform/registration/{id}/subscription/{subscription_id}` | get / update / delete |
//! | POST | `/event` | publish to the pending queue |
//! | GET | `/event/triggered/{event_type}?integrationId=` | pending events for a consumer |
//! | POST | `/event/consumed` | mark events consumed |
//! | POST, GET | `/uniform/log?integrationId=` | append / read the error log |
//! | GET | `/health` | liveness |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ErrorBody, UniformError};
use crate::events::EventQueue;
use crate::logs::ErrorLog;
use crate::models::{
    ConsumedRequest, CreateSubscriptionResponse, EventEnvelope, Integration, LogsBody,
    RegisterResponse, Subscription,
};
use crate::registry::UniformRegistry;
use crate::store::IntegrationQuery;

impl IntoResponse for UniformError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Registry request failed: {}", self);
        }
        let body = ErrorBody {
            code: status.as_u16(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, UniformError>;

#[derive(Clone)]
struct ServerState {
    registry: UniformRegistry,
    events: Arc<EventQueue>,
    logs: Arc<ErrorLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerQuery {
    integration_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    integration_id: Option<String>,
}

/// Build the router over a registry, event queue and error log.
pub fn router(registry: UniformRegistry, events: Arc<EventQueue>, logs: Arc<ErrorLog>) -> Router {
    let state = ServerState {
        registry,
        events,
        logs,
    };
    Router::new()
        .route("/health", get(health))
        .route(
            "/uniform/registration",
            post(register).get(get_registrations),
        )
        .route("/uniform/registration/{id}", axum::routing::delete(unregister))
        .route("/uniform/registration/{id}/ping", put(keep_alive))
        .route(
            "/uniform/registration/{id}/subscription",
            post(create_subscription).get(get_subscriptions),
        )
        .route(
            "/uniform/registration/{id}/subscription/{subscription_id}",
            get(get_subscription)
                .put(update_subscription)
                .delete(delete_subscription),
        )
        .route("/event", post(publish_event))
        .route("/event/triggered/{event_type}", get(pending_events))
        .route("/event/consumed", post(mark_consumed))
        .route("/uniform/log", post(append_logs).get(get_logs))
        .with_state(state)
}

/// Registry HTTP server. Owns its shutdown token; callers trigger graceful
/// shutdown through [`RegistryServer::shutdown`] or a cloned token.
pub struct RegistryServer {
    router: Router,
    shutdown: CancellationToken,
}

impl RegistryServer {
    pub fn new(registry: UniformRegistry, events: Arc<EventQueue>) -> Self {
        Self::with_error_log(registry, events, Arc::new(ErrorLog::default()))
    }

    pub fn with_error_log(
        registry: UniformRegistry,
        events: Arc<EventQueue>,
        logs: Arc<ErrorLog>,
    ) -> Self {
        Self {
            router: router(registry, events, logs),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Uniform registry listening");
        }
        axum::serve(listener, self.router)
            .with_graceful_shutdown(self.shutdown.cancelled_owned())
            .await
    }

    /// Bind `addr` and serve on a background task. Returns the bound address.
    pub async fn spawn(
        self,
        addr: &str,
    ) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let handle = tokio::spawn(self.serve(listener));
        Ok((bound, handle))
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register(
    State(state): State<ServerState>,
    Json(integration): Json<Integration>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let outcome = state.registry.register(integration).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(RegisterResponse { id: outcome.id })))
}

async fn get_registrations(
    State(state): State<ServerState>,
    Query(query): Query<IntegrationQuery>,
) -> ApiResult<Json<Vec<Integration>>> {
    Ok(Json(state.registry.get_registrations(&query).await?))
}

async fn unregister(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.unregister(&id).await?;
    Ok(Json(serde_json::json!({})))
}

async fn keep_alive(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Integration>> {
    debug!(id = %id, "Heartbeat");
    Ok(Json(state.registry.keep_alive(&id).await?))
}

async fn create_subscription(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(subscription): Json<Subscription>,
) -> ApiResult<(StatusCode, Json<CreateSubscriptionResponse>)> {
    let id = state.registry.create_subscription(&id, subscription).await?;
    Ok((StatusCode::CREATED, Json(CreateSubscriptionResponse { id })))
}

async fn get_subscriptions(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Subscription>>> {
    Ok(Json(state.registry.get_subscriptions(&id).await?))
}

async fn get_subscription(
    State(state): State<ServerState>,
    Path((id, subscription_id)): Path<(String, String)>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(
        state.registry.get_subscription(&id, &subscription_id).await?,
    ))
}

async fn update_subscription(
    State(state): State<ServerState>,
    Path((id, subscription_id)): Path<(String, String)>,
    Json(subscription): Json<Subscription>,
) -> ApiResult<(StatusCode, Json<CreateSubscriptionResponse>)> {
    let id = state
        .registry
        .update_subscription(&id, &subscription_id, subscription)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateSubscriptionResponse { id })))
}

async fn delete_subscription(
    State(state): State<ServerState>,
    Path((id, subscription_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .registry
        .delete_subscription(&id, &subscription_id)
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn publish_event(
    State(state): State<ServerState>,
    Json(envelope): Json<EventEnvelope>,
) -> (StatusCode, Json<serde_json::Value>) {
    let id = state.events.publish(envelope).await;
    (StatusCode::CREATED, Json(serde_json::json!({ "id": id })))
}

async fn pending_events(
    State(state): State<ServerState>,
    Path(event_type): Path<String>,
    Query(consumer): Query<ConsumerQuery>,
) -> Json<Vec<EventEnvelope>> {
    Json(
        state
            .events
            .pending(&event_type, &consumer.integration_id)
            .await,
    )
}

async fn mark_consumed(
    State(state): State<ServerState>,
    Json(request): Json<ConsumedRequest>,
) -> Json<serde_json::Value> {
    let consumed = state
        .events
        .mark_consumed(&request.integration_id, &request.ids)
        .await;
    Json(serde_json::json!({ "consumed": consumed }))
}

async fn append_logs(
    State(state): State<ServerState>,
    Json(body): Json<LogsBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let appended = state.logs.append(body.logs).await?;
    Ok(Json(serde_json::json!({ "appended": appended })))
}

async fn get_logs(
    State(state): State<ServerState>,
    Query(query): Query<LogQuery>,
) -> Json<LogsBody> {
    Json(LogsBody {
        logs: state.logs.entries(query.integration_id.as_deref()).await,
    })
}
