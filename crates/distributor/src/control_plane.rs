//! Control plane orchestrator: one subscription source plus one event transport.
//!
//! ## Lifecycle
//!
//! ```text
//! ControlPlane::run(cancel, integration, sink)
//!   → register  (fatal on failure)
//!   → transport.start(initial snapshot)
//!   → source.start
//!   → supervise:
//!       snapshot from source  → transport.update_filter (wholesale replace)
//!       transport error       → retriable: log and continue / fatal: shut down
//!       cancel                → shut down
//!   → shutdown: source.stop, await source
//!               transport.stop, await transport
//!               wait on the shared tracker (bounded by shutdown_timeout)
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use uniform::{EventEnvelope, Integration};

use crate::config::ControlPlaneConfig;
use crate::context::{LoopContext, RegistrationData};
use crate::error::ControlPlaneError;
use crate::subscription_source::SubscriptionSource;
use crate::transport::EventTransport;

pub struct ControlPlane {
    source: Arc<dyn SubscriptionSource>,
    transport: Arc<dyn EventTransport>,
    config: ControlPlaneConfig,
    registration: RwLock<Option<RegistrationData>>,
}

impl ControlPlane {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        transport: Arc<dyn EventTransport>,
        config: ControlPlaneConfig,
    ) -> Self {
        Self {
            source,
            transport,
            config,
            registration: RwLock::new(None),
        }
    }

    /// Register `integration` and remember the resulting identity.
    ///
    /// Safe to call repeatedly: the registry answers with the same id for the
    /// same (name, namespace, node) triple.
    pub async fn register(
        &self,
        integration: &Integration,
    ) -> Result<RegistrationData, ControlPlaneError> {
        let id = self
            .source
            .register(integration)
            .await
            .map_err(ControlPlaneError::Registration)?;
        let data = RegistrationData::new(id, integration.subscriptions.clone());
        if data.has_identity() {
            info!(integration_id = %data.id, name = %integration.name, "Registered integration");
        } else {
            debug!("Running without uniform identity");
        }
        *self.registration.write().await = Some(data.clone());
        Ok(data)
    }

    /// Unregister the current identity. Fails with `NotRegistered`, without
    /// contacting the registry, when nothing was registered.
    pub async fn unregister(&self) -> Result<(), ControlPlaneError> {
        let mut registration = self.registration.write().await;
        let data = registration.as_ref().ok_or(ControlPlaneError::NotRegistered)?;
        self.source
            .unregister(&data.id)
            .await
            .map_err(ControlPlaneError::Unregister)?;
        info!(integration_id = %data.id, "Unregistered integration");
        *registration = None;
        Ok(())
    }

    pub async fn registration(&self) -> Option<RegistrationData> {
        self.registration.read().await.clone()
    }

    /// Register, start both loops and supervise them until `cancel` fires or
    /// the transport reports a fatal error.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        integration: &Integration,
        sink: mpsc::Sender<EventEnvelope>,
    ) -> Result<(), ControlPlaneError> {
        let registration = match self.register(integration).await {
            Ok(data) => data,
            Err(e) => {
                error!("Initial registration failed: {}", e);
                return Err(e);
            }
        };

        let tracker = TaskTracker::new();
        let loops = CancellationToken::new();
        let ctx = LoopContext::new(loops.clone(), tracker.clone());
        let (subscriptions_tx, mut subscriptions_rx) =
            mpsc::channel(self.config.subscription_buffer.max(1));
        let (errors_tx, mut errors_rx) = mpsc::channel(self.config.error_buffer.max(1));

        let transport_handle =
            self.transport
                .start(ctx.clone(), registration.clone(), sink, errors_tx);
        let source_handle = self.source.start(ctx, registration, subscriptions_tx);
        info!(transport = self.transport.name(), "Control plane started");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(err) = errors_rx.recv() => {
                    if err.is_retriable() {
                        warn!(category = %err.retry_category(), "Transport error: {}", err);
                    } else {
                        error!(category = %err.retry_category(), "Fatal transport error: {}", err);
                        break Err(ControlPlaneError::Transport(err));
                    }
                }
                Some(subscriptions) = subscriptions_rx.recv() => {
                    debug!(count = subscriptions.len(), "Applying subscription snapshot");
                    self.transport.update_filter(subscriptions);
                }
            }
        };

        // Unblock loops waiting on a full channel while they are stopped.
        drop(subscriptions_rx);
        drop(errors_rx);

        let shutdown = async {
            self.source.stop();
            if let Err(e) = source_handle.await {
                warn!("Subscription source task failed: {}", e);
            }
            self.transport.stop();
            if let Err(e) = transport_handle.await {
                warn!("Transport task failed: {}", e);
            }
            tracker.close();
            tracker.wait().await;
        };
        let timeout = self.config.shutdown_timeout;
        let stopped = tokio::time::timeout(timeout, shutdown).await;
        loops.cancel();

        match (outcome, stopped) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(_)) => {
                error!(timeout_ms = timeout.as_millis() as u64, "Loops did not stop in time");
                Err(ControlPlaneError::ShutdownTimeout(timeout))
            }
            (Ok(()), Ok(())) => {
                info!("Control plane stopped");
                Ok(())
            }
        }
    }
}
