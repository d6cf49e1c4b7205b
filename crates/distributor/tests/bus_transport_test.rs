//! Push transport driven by the control plane: registry-backed subscriptions,
//! events published on an in-process bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use distributor::{
    BusConfig, BusTransport, ControlPlane, ControlPlaneConfig, LocalBus, SubscriptionSourceConfig,
    UniformApi, UniformClient, UniformSubscriptionSource,
};
use uniform::{
    EventEnvelope, EventQueue, Integration, MemoryRepo, MetaData, RegistryServer, Subscription,
    SubscriptionFilter, UniformRegistry,
};

const TICK: Duration = Duration::from_millis(50);

fn event(id: &str, event_type: &str, stage: &str) -> EventEnvelope {
    let mut e = EventEnvelope::new(
        event_type,
        json!({ "project": "sockshop", "stage": stage, "service": "carts" }),
    );
    e.id = id.to_string();
    e
}

/// Publish `marker` until it is forwarded, then drain duplicates.
async fn settle(bus: &LocalBus, sink: &mut mpsc::Receiver<EventEnvelope>, marker: &EventEnvelope) {
    for _ in 0..200 {
        bus.publish_event(marker).unwrap();
        if let Ok(Some(e)) = tokio::time::timeout(Duration::from_millis(20), sink.recv()).await {
            if e.id == marker.id {
                while let Ok(Some(_)) =
                    tokio::time::timeout(Duration::from_millis(50), sink.recv()).await
                {}
                return;
            }
        }
    }
    panic!("marker {} never forwarded", marker.id);
}

#[tokio::test]
async fn test_bus_delivery_follows_registry_snapshots() {
    let server = RegistryServer::new(
        UniformRegistry::new(Arc::new(MemoryRepo::new())),
        Arc::new(EventQueue::default()),
    );
    let shutdown = server.shutdown_token();
    let (addr, _handle) = server.spawn("127.0.0.1:0").await.unwrap();
    let client = Arc::new(UniformClient::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap());

    let bus = Arc::new(LocalBus::new());
    let plane = Arc::new(ControlPlane::new(
        Arc::new(UniformSubscriptionSource::new(
            client.clone(),
            SubscriptionSourceConfig {
                fetch_interval: TICK,
            },
        )),
        Arc::new(BusTransport::new(
            bus.clone(),
            BusConfig {
                resubscribe_interval: TICK,
            },
        )),
        ControlPlaneConfig::default(),
    ));

    let stage_filter = SubscriptionFilter::new(["sockshop"], ["dev"], ["carts"]);
    let mut integration = Integration::new(
        "helm-service",
        MetaData {
            hostname: "node-1".into(),
            namespace: "keptn".into(),
            ..Default::default()
        },
    );
    integration.subscriptions = vec![
        Subscription::new("sh.keptn.event.deployment.triggered").with_filter(stage_filter.clone())
    ];

    let cancel = CancellationToken::new();
    let (sink_tx, mut sink) = mpsc::channel(16);
    let run = {
        let plane = plane.clone();
        let cancel = cancel.clone();
        let integration = integration.clone();
        tokio::spawn(async move { plane.run(cancel, &integration, sink_tx).await })
    };

    settle(
        &bus,
        &mut sink,
        &event("marker-1", "sh.keptn.event.deployment.triggered", "dev"),
    )
    .await;

    bus.publish_event(&event("wrong-stage", "sh.keptn.event.deployment.triggered", "prod"))
        .unwrap();
    bus.publish_event(&event("ok-1", "sh.keptn.event.deployment.triggered", "dev"))
        .unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(2), sink.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded.id, "ok-1");

    // Swap the subscription in the registry; the next heartbeat carries it.
    let id = plane.registration().await.unwrap().id;
    let current = client.get_subscriptions(&id).await.unwrap();
    client
        .update_subscription(
            &id,
            &current[0].id,
            &Subscription::new("sh.keptn.event.*.finished").with_filter(stage_filter),
        )
        .await
        .unwrap();
    settle(
        &bus,
        &mut sink,
        &event("marker-2", "sh.keptn.event.test.finished", "dev"),
    )
    .await;

    bus.publish_event(&event("stale", "sh.keptn.event.deployment.triggered", "dev"))
        .unwrap();
    bus.publish_event(&event("ok-2", "sh.keptn.event.release.finished", "dev"))
        .unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(2), sink.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded.id, "ok-2");
    assert!(
        tokio::time::timeout(TICK * 4, sink.recv()).await.is_err(),
        "no event of the removed type may be forwarded"
    );

    cancel.cancel();
    run.await.unwrap().unwrap();
    assert!(sink.recv().await.is_none());
    shutdown.cancel();
}
