//! Subscription sources: where an integration's active subscription set comes from.
//!
//! [`UniformSubscriptionSource`] heartbeats the registry and republishes the
//! subscriptions it returns; [`FixedSubscriptionSource`] serves a constant
//! set for integrations without a uniform identity.
//!
//! Snapshots are sent on a bounded channel and the send blocks until the
//! control plane takes them. A stopped or cancelled loop never stays blocked
//! on that send.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use uniform::{Integration, Subscription};

use crate::api::{ApiError, UniformApi};
use crate::config::{loop_interval, SubscriptionSourceConfig};
use crate::context::{LoopContext, RegistrationData, StopSignal};

#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Register `integration`; returns its id (empty when there is no identity).
    async fn register(&self, integration: &Integration) -> Result<String, ApiError>;

    async fn unregister(&self, integration_id: &str) -> Result<(), ApiError>;

    /// Spawn the loop on `ctx.tracker`. The handle completes once the loop
    /// has observed cancellation or [`SubscriptionSource::stop`].
    fn start(
        &self,
        ctx: LoopContext,
        registration: RegistrationData,
        out: mpsc::Sender<Vec<Subscription>>,
    ) -> JoinHandle<()>;

    /// Ask the loop to exit. Idempotent; a stop before the loop waits is kept.
    fn stop(&self);
}

/// Polls the registry for the integration's subscriptions.
pub struct UniformSubscriptionSource {
    api: Arc<dyn UniformApi>,
    config: SubscriptionSourceConfig,
    stop: StopSignal,
}

impl UniformSubscriptionSource {
    pub fn new(api: Arc<dyn UniformApi>, config: SubscriptionSourceConfig) -> Self {
        Self {
            api,
            config,
            stop: StopSignal::default(),
        }
    }
}

#[async_trait]
impl SubscriptionSource for UniformSubscriptionSource {
    async fn register(&self, integration: &Integration) -> Result<String, ApiError> {
        self.api.register(integration).await
    }

    async fn unregister(&self, integration_id: &str) -> Result<(), ApiError> {
        self.api.unregister(integration_id).await
    }

    fn start(
        &self,
        ctx: LoopContext,
        registration: RegistrationData,
        out: mpsc::Sender<Vec<Subscription>>,
    ) -> JoinHandle<()> {
        let api = self.api.clone();
        let stop = self.stop.arm();
        let interval = loop_interval(self.config.fetch_interval);
        let tracker = ctx.tracker.clone();

        tracker.spawn(async move {
            info!(
                integration_id = %registration.id,
                interval_ms = interval.as_millis() as u64,
                "Subscription source started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if ctx.until_stopped(&stop, ticker.tick()).await.is_none() {
                    break;
                }
                let fetched = match ctx.until_stopped(&stop, api.ping(&registration.id)).await {
                    Some(fetched) => fetched,
                    None => break,
                };
                let integration = match fetched {
                    Ok(integration) => integration,
                    Err(e) => {
                        warn!(integration_id = %registration.id, "Could not fetch subscriptions: {}", e);
                        continue;
                    }
                };
                debug!(
                    integration_id = %registration.id,
                    count = integration.subscriptions.len(),
                    "Fetched subscriptions"
                );
                match ctx.until_stopped(&stop, out.send(integration.subscriptions)).await {
                    Some(Ok(())) => {}
                    Some(Err(_)) => {
                        debug!("Subscription receiver dropped");
                        break;
                    }
                    None => break,
                }
            }
            info!(integration_id = %registration.id, "Subscription source stopped");
        })
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

/// Serves a constant subscription list. Registration is a no-op.
pub struct FixedSubscriptionSource {
    subscriptions: Vec<Subscription>,
    stop: StopSignal,
}

impl FixedSubscriptionSource {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            subscriptions,
            stop: StopSignal::default(),
        }
    }
}

#[async_trait]
impl SubscriptionSource for FixedSubscriptionSource {
    async fn register(&self, _integration: &Integration) -> Result<String, ApiError> {
        Ok(String::new())
    }

    async fn unregister(&self, _integration_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    fn start(
        &self,
        ctx: LoopContext,
        _registration: RegistrationData,
        out: mpsc::Sender<Vec<Subscription>>,
    ) -> JoinHandle<()> {
        let subscriptions = self.subscriptions.clone();
        let stop = self.stop.arm();
        let tracker = ctx.tracker.clone();

        tracker.spawn(async move {
            if let Some(Ok(())) = ctx.until_stopped(&stop, out.send(subscriptions)).await {
                ctx.until_stopped(&stop, std::future::pending::<()>()).await;
            }
            debug!("Fixed subscription source stopped");
        })
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockUniformApi;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;
    use uniform::MetaData;

    fn integration_with(events: &[&str]) -> Integration {
        let mut integration = Integration::new("svc", MetaData::default());
        integration.id = "id-1".into();
        integration.subscriptions = events.iter().map(|e| Subscription::new(*e)).collect();
        integration
    }

    fn source(api: MockUniformApi) -> UniformSubscriptionSource {
        UniformSubscriptionSource::new(
            Arc::new(api),
            SubscriptionSourceConfig {
                fetch_interval: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_immediately_then_on_interval() {
        let mut api = MockUniformApi::new();
        api.expect_ping()
            .returning(|_| Ok(integration_with(&["t1"])));
        let source = source(api);

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = LoopContext::default();
        let started = Instant::now();
        let handle = source.start(ctx.clone(), RegistrationData::new("id-1", vec![]), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first[0].event, "t1");
        assert!(started.elapsed() < Duration::from_secs(1));

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));

        ctx.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_errors_are_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut api = MockUniformApi::new();
        api.expect_ping().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ApiError::Status {
                    status: 502,
                    message: "bad gateway".into(),
                })
            } else {
                Ok(integration_with(&["t2"]))
            }
        });
        let source = source(api);

        let (tx, mut rx) = mpsc::channel(1);
        let started = Instant::now();
        let ctx = LoopContext::default();
        let handle = source.start(ctx.clone(), RegistrationData::new("id-1", vec![]), tx);

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot[0].event, "t2");
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        source.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_blocked_send() {
        let mut api = MockUniformApi::new();
        api.expect_ping()
            .returning(|_| Ok(integration_with(&["t1"])));
        let source = source(api);

        // Nobody drains the receiver: the second snapshot blocks.
        let (tx, _rx) = mpsc::channel(1);
        let ctx = LoopContext::default();
        let handle = source.start(ctx.clone(), RegistrationData::new("id-1", vec![]), tx);
        tokio::time::sleep(Duration::from_secs(6)).await;

        source.stop();
        source.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit after stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_reported_through_tracker() {
        let mut api = MockUniformApi::new();
        api.expect_ping()
            .returning(|_| Ok(integration_with(&[])));
        let source = source(api);

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = LoopContext::default();
        source.start(ctx.clone(), RegistrationData::new("id-1", vec![]), tx);
        rx.recv().await.unwrap();

        ctx.cancel.cancel();
        ctx.tracker.close();
        tokio::time::timeout(Duration::from_secs(5), ctx.tracker.wait())
            .await
            .expect("tracker should drain");
        assert!(ctx.tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_late_stop() {
        let mut api = MockUniformApi::new();
        api.expect_ping()
            .returning(|_| Ok(integration_with(&["t1"])));
        let source = source(api);

        let (tx, rx) = mpsc::channel(1);
        let ctx = LoopContext::default();
        drop(rx);
        source
            .start(ctx.clone(), RegistrationData::new("id-1", vec![]), tx)
            .await
            .unwrap();
        // The loop already exited on the dropped receiver.
        source.stop();

        let (tx, mut rx) = mpsc::channel(1);
        let handle = source.start(ctx.clone(), RegistrationData::new("id-1", vec![]), tx);
        let snapshot = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("second run should deliver a snapshot")
            .unwrap();
        assert_eq!(snapshot[0].event, "t1");
        assert!(!handle.is_finished());

        source.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let mut api = MockUniformApi::new();
        api.expect_ping()
            .returning(|_| Ok(integration_with(&["t1"])));
        let source = UniformSubscriptionSource::new(
            Arc::new(api),
            SubscriptionSourceConfig {
                fetch_interval: Duration::ZERO,
            },
        );

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = LoopContext::default();
        let handle = source.start(ctx.clone(), RegistrationData::new("id-1", vec![]), tx);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        ctx.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_register_delegates_to_api() {
        let mut api = MockUniformApi::new();
        api.expect_register()
            .times(2)
            .returning(|_| Ok("same-id".to_string()));
        let source = source(api);
        let integration = integration_with(&["t1"]);
        assert_eq!(source.register(&integration).await.unwrap(), "same-id");
        assert_eq!(source.register(&integration).await.unwrap(), "same-id");
    }

    #[tokio::test]
    async fn test_fixed_source_pushes_once_and_waits() {
        let source = FixedSubscriptionSource::new(vec![Subscription::new("sh.keptn.event.>")]);
        assert_eq!(
            source.register(&Integration::default()).await.unwrap(),
            ""
        );

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = LoopContext::default();
        let handle = source.start(ctx.clone(), RegistrationData::default(), tx);

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot[0].event, "sh.keptn.event.>");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        assert!(!handle.is_finished());

        ctx.cancel.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
