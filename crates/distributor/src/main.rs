use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use distributor::{
    BusTransport, ConnectionType, ControlPlane, DistributorConfig, ErrorLogForwarder,
    EventPublisher, EventRelay, EventTransport, FixedSubscriptionSource, Forwarder, NatsBus,
    PollTransport, RegistryPublisher, SubscriptionSource, UniformApi, UniformClient,
    UniformSubscriptionSource,
};

/// Relayed events buffered for the error log forwarder
const OBSERVER_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = DistributorConfig::default();
    let connection = config.connection_type();
    info!(
        registry = %config.api_endpoint,
        recipient = %config.recipient_url(),
        connection = ?connection,
        topics = ?config.topics,
        "Distributor starting"
    );

    let api: Arc<dyn UniformApi> = Arc::new(
        UniformClient::new(&config.api_endpoint, config.api_timeout)
            .context("Invalid KEPTN_API_ENDPOINT")?,
    );
    let has_identity = config.validate_registration_constraints();
    let source: Arc<dyn SubscriptionSource> = if has_identity {
        Arc::new(UniformSubscriptionSource::new(
            api.clone(),
            config.source.clone(),
        ))
    } else {
        warn!("K8S_DEPLOYMENT_COMPONENT not set, running without uniform registration");
        Arc::new(FixedSubscriptionSource::new(config.fixed_subscriptions()))
    };

    let (transport, publisher): (Arc<dyn EventTransport>, Arc<dyn EventPublisher>) =
        match (connection, config.pubsub_url.as_deref()) {
            (ConnectionType::Nats, Some(url)) => {
                let mut bus = NatsBus::connect(url, config.api_timeout)
                    .await
                    .context("Could not connect to PUBSUB_URL")?;
                if let Some(group) = config.queue_group() {
                    bus = bus.with_queue_group(group);
                }
                let bus = Arc::new(bus);
                let transport: Arc<dyn EventTransport> =
                    Arc::new(BusTransport::new(bus.clone(), config.bus.clone()));
                let publisher: Arc<dyn EventPublisher> = bus;
                (transport, publisher)
            }
            _ => {
                let transport: Arc<dyn EventTransport> =
                    Arc::new(PollTransport::new(api.clone(), config.poll.clone()));
                let publisher: Arc<dyn EventPublisher> =
                    Arc::new(RegistryPublisher::new(api.clone()));
                (transport, publisher)
            }
        };
    let control_plane = Arc::new(ControlPlane::new(
        source,
        transport,
        config.control_plane.clone(),
    ));

    let forwarder = Forwarder::new(&config.recipient_url(), config.api_timeout)
        .context("Invalid PUBSUB_RECIPIENT")?;
    let (sink_tx, sink_rx) = mpsc::channel(config.control_plane.sink_buffer.max(1));
    let forwarding = tokio::spawn(forwarder.run(sink_rx));

    let cancel = CancellationToken::new();
    let mut relay = EventRelay::new(publisher);
    let error_log = if has_identity {
        let (observer_tx, observer_rx) = mpsc::channel(OBSERVER_BUFFER);
        relay = relay.with_observer(observer_tx);
        let forwarder = ErrorLogForwarder::new(api.clone(), control_plane.clone());
        Some(tokio::spawn(forwarder.run(observer_rx)))
    } else {
        None
    };
    let relay_shutdown = cancel.child_token();
    let (_, relay_handle) = relay
        .spawn(&config.relay_addr(), relay_shutdown.clone())
        .await
        .with_context(|| format!("Failed to bind event relay on {}", config.relay_addr()))?;

    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down distributor");
        trigger.cancel();
    });

    let outcome = control_plane
        .run(cancel, &config.integration(), sink_tx)
        .await;

    // A fatal control plane error ends the run without a signal.
    relay_shutdown.cancel();
    match relay_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Event relay failed: {}", e),
        Err(e) => warn!("Event relay task failed: {}", e),
    }
    if let Some(error_log) = error_log {
        match error_log.await {
            Ok(sent) => info!(sent, "Error log forwarder drained"),
            Err(e) => warn!("Error log task failed: {}", e),
        }
    }

    // Sink sender is gone once `run` returns; the forwarder drains and exits.
    match forwarding.await {
        Ok(delivered) => info!(delivered, "Forwarder drained"),
        Err(e) => warn!("Forwarder task failed: {}", e),
    }

    outcome.context("Control plane terminated")?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
