//! Outbound relay: the integration POSTs its events to the distributor,
//! which hands them to the control plane.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | POST | `/event` | publish (200 with the event id, 400 without a type, 502 when the control plane refuses) |
//! | GET | `/health` | liveness |
//!
//! Every relayed event is also offered to an optional observer channel; the
//! error log forwarder listens there.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use uniform::{ErrorBody, EventEnvelope};

use crate::api::UniformApi;
use crate::error::TransportError;
use crate::transport::{LocalBus, NatsBus};

/// Where relayed events go.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), TransportError>;
}

/// Publishes through the registry's event endpoint (HTTP connection type).
pub struct RegistryPublisher {
    api: Arc<dyn UniformApi>,
}

impl RegistryPublisher {
    pub fn new(api: Arc<dyn UniformApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EventPublisher for RegistryPublisher {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), TransportError> {
        self.api.publish_event(event).await?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for NatsBus {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), TransportError> {
        self.publish_event(event).await
    }
}

#[async_trait]
impl EventPublisher for LocalBus {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), TransportError> {
        self.publish_event(event)
            .map(|_| ())
            .map_err(|e| TransportError::publish(&event.event_type, e.to_string()))
    }
}

#[derive(Clone)]
struct RelayState {
    publisher: Arc<dyn EventPublisher>,
    observer: Option<mpsc::Sender<EventEnvelope>>,
}

pub struct EventRelay {
    state: RelayState,
}

impl EventRelay {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            state: RelayState {
                publisher,
                observer: None,
            },
        }
    }

    /// Also send every successfully relayed event to `observer`.
    pub fn with_observer(mut self, observer: mpsc::Sender<EventEnvelope>) -> Self {
        self.state.observer = Some(observer);
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/event", post(relay_event))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Event relay listening");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }

    /// Bind `addr` and serve on a background task. Returns the bound address.
    pub async fn spawn(
        self,
        addr: &str,
        shutdown: CancellationToken,
    ) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let handle = tokio::spawn(self.serve(listener, shutdown));
        Ok((bound, handle))
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        code: status.as_u16(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

async fn relay_event(
    State(state): State<RelayState>,
    Json(mut event): Json<EventEnvelope>,
) -> Response {
    if event.event_type.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "event type is required");
    }
    if event.id.is_empty() {
        event.id = Uuid::new_v4().to_string();
    }

    if let Err(e) = state.publisher.publish(&event).await {
        warn!(event_type = %event.event_type, "Could not relay event: {}", e);
        return error_response(StatusCode::BAD_GATEWAY, e.to_string());
    }
    debug!(event_id = %event.id, event_type = %event.event_type, "Event relayed");

    let id = event.id.clone();
    if let Some(observer) = &state.observer {
        if observer.send(event).await.is_err() {
            debug!("Relay observer gone");
        }
    }
    (StatusCode::OK, Json(serde_json::json!({ "id": id }))).into_response()
}
