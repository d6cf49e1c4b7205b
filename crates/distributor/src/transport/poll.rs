//! Pull transport: periodic pending-event queries against the registry.
//!
//! Each tick, for every distinct event type of the active filter:
//! fetch the events this consumer has not consumed, forward the matching
//! ones to the sink in received order, then mark everything retrieved as
//! consumed. An event is acked only after it was forwarded, so a failure
//! anywhere in between redelivers it on the next tick (at-least-once).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use uniform::{EventEnvelope, Subscription};

use super::{report, ActiveFilter, EventTransport};
use crate::api::UniformApi;
use crate::config::{loop_interval, PollConfig};
use crate::context::{LoopContext, RegistrationData, StopSignal};
use crate::error::TransportError;

pub struct PollTransport {
    api: Arc<dyn UniformApi>,
    config: PollConfig,
    filter: watch::Sender<Vec<Subscription>>,
    stop: StopSignal,
    /// Consumer id used when the registration carries no identity.
    anonymous_consumer: String,
}

impl PollTransport {
    pub fn new(api: Arc<dyn UniformApi>, config: PollConfig) -> Self {
        let (filter, _) = watch::channel(Vec::new());
        Self {
            api,
            config,
            filter,
            stop: StopSignal::default(),
            anonymous_consumer: format!("anonymous-{}", Uuid::new_v4()),
        }
    }
}

/// Outcome of one poll pass.
enum Pass {
    Continue,
    Exit,
}

struct PollLoop {
    api: Arc<dyn UniformApi>,
    consumer: String,
    ctx: LoopContext,
    stop: Arc<Notify>,
    sink: mpsc::Sender<EventEnvelope>,
    errors: mpsc::Sender<TransportError>,
}

impl PollLoop {
    async fn fail(&self, err: TransportError) -> Pass {
        if report(&self.ctx, &self.stop, &self.errors, err).await {
            Pass::Continue
        } else {
            Pass::Exit
        }
    }

    /// One pass over the event types of the snapshot current at tick time.
    ///
    /// Each candidate is re-checked against the latest snapshot once sink
    /// capacity is reserved, so a replacement that lands mid-batch takes
    /// effect for the rest of the batch.
    async fn poll_once(&self, filter_rx: &mut watch::Receiver<Vec<Subscription>>) -> Pass {
        let mut filter = ActiveFilter::new(filter_rx.borrow_and_update().clone());
        let mut forwarded: HashSet<String> = HashSet::new();

        for event_type in filter.event_types() {
            let fetched = match self
                .ctx
                .until_stopped(&self.stop, self.api.pending_events(&event_type, &self.consumer))
                .await
            {
                Some(fetched) => fetched,
                None => return Pass::Exit,
            };
            let events = match fetched {
                Ok(events) => events,
                Err(e) => {
                    if let Pass::Exit = self.fail(e.into()).await {
                        return Pass::Exit;
                    }
                    continue;
                }
            };
            if events.is_empty() {
                continue;
            }
            debug!(event_type = %event_type, count = events.len(), "Fetched pending events");

            let mut retrieved = Vec::with_capacity(events.len());
            for event in events {
                let id = event.id.clone();
                if filter.matches(&event) && !forwarded.contains(&id) {
                    let permit = match self.ctx.until_stopped(&self.stop, self.sink.reserve()).await {
                        Some(Ok(permit)) => permit,
                        Some(Err(_)) => {
                            self.fail(TransportError::SinkClosed).await;
                            return Pass::Exit;
                        }
                        None => return Pass::Exit,
                    };
                    if filter_rx.has_changed().unwrap_or(false) {
                        filter = ActiveFilter::new(filter_rx.borrow_and_update().clone());
                    }
                    if filter.matches(&event) {
                        forwarded.insert(id.clone());
                        permit.send(event);
                    } else {
                        debug!(event_id = %id, "Dropped by replaced subscription snapshot");
                    }
                }
                retrieved.push(id);
            }

            match self
                .ctx
                .until_stopped(&self.stop, self.api.mark_consumed(&self.consumer, &retrieved))
                .await
            {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    if let Pass::Exit = self.fail(e.into()).await {
                        return Pass::Exit;
                    }
                }
                None => return Pass::Exit,
            }
        }
        Pass::Continue
    }
}

impl EventTransport for PollTransport {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn start(
        &self,
        ctx: LoopContext,
        registration: RegistrationData,
        sink: mpsc::Sender<EventEnvelope>,
        errors: mpsc::Sender<TransportError>,
    ) -> JoinHandle<()> {
        let consumer = if registration.has_identity() {
            registration.id.clone()
        } else {
            self.anonymous_consumer.clone()
        };
        self.filter.send_replace(registration.subscriptions);
        let mut filter_rx = self.filter.subscribe();
        let interval = loop_interval(self.config.interval);
        let tracker = ctx.tracker.clone();
        let poller = PollLoop {
            api: self.api.clone(),
            consumer,
            ctx,
            stop: self.stop.arm(),
            sink,
            errors,
        };

        tracker.spawn(async move {
            info!(
                consumer = %poller.consumer,
                interval_ms = interval.as_millis() as u64,
                "Poll transport started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if poller
                    .ctx
                    .until_stopped(&poller.stop, ticker.tick())
                    .await
                    .is_none()
                {
                    break;
                }
                if let Pass::Exit = poller.poll_once(&mut filter_rx).await {
                    break;
                }
            }
            info!(consumer = %poller.consumer, "Poll transport stopped");
        })
    }

    fn update_filter(&self, subscriptions: Vec<Subscription>) {
        self.filter.send_replace(subscriptions);
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, MockUniformApi};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use uniform::SubscriptionFilter;

    fn event(id: &str, event_type: &str, project: &str) -> EventEnvelope {
        let mut e = EventEnvelope::new(event_type, json!({ "project": project }));
        e.id = id.to_string();
        e
    }

    fn transport(api: MockUniformApi) -> PollTransport {
        PollTransport::new(
            Arc::new(api),
            PollConfig {
                interval: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_in_order_and_acks_everything_retrieved() {
        let acked: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let acked_in = acked.clone();
        let mut api = MockUniformApi::new();
        api.expect_pending_events().times(1).returning(|_, _| {
            Ok(vec![
                event("e1", "t1", "p1"),
                event("e2", "t1", "other"),
                event("e3", "t1", "p1"),
            ])
        });
        api.expect_pending_events().returning(|_, _| Ok(vec![]));
        api.expect_mark_consumed().returning(move |_, ids| {
            acked_in.lock().unwrap().push(ids.to_vec());
            Ok(())
        });
        let transport = transport(api);

        let subs = vec![Subscription::new("t1").with_filter(SubscriptionFilter::new(
            ["p1"],
            Vec::<String>::new(),
            Vec::<String>::new(),
        ))];
        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let (err_tx, _err_rx) = mpsc::channel(8);
        let ctx = LoopContext::default();
        let handle = transport.start(ctx.clone(), RegistrationData::new("c1", subs), sink_tx, err_tx);

        assert_eq!(sink_rx.recv().await.unwrap().id, "e1");
        assert_eq!(sink_rx.recv().await.unwrap().id, "e3");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            acked.lock().unwrap().first().cloned(),
            Some(vec!["e1".to_string(), "e2".to_string(), "e3".to_string()])
        );

        transport.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_replaced_mid_batch_stops_forwarding() {
        let acked: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let acked_in = acked.clone();
        let mut api = MockUniformApi::new();
        api.expect_pending_events()
            .times(1)
            .returning(|_, _| Ok(vec![event("e1", "t1", "p"), event("e2", "t1", "p")]));
        api.expect_pending_events().returning(|_, _| Ok(vec![]));
        api.expect_mark_consumed().returning(move |_, ids| {
            acked_in.lock().unwrap().push(ids.to_vec());
            Ok(())
        });
        let transport = transport(api);

        // Capacity 1: e1 is buffered, e2 waits for room.
        let (sink_tx, mut sink_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(8);
        let ctx = LoopContext::default();
        let handle = transport.start(
            ctx.clone(),
            RegistrationData::new("c1", vec![Subscription::new("t1")]),
            sink_tx,
            err_tx,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;

        transport.update_filter(vec![Subscription::new("t2")]);
        assert_eq!(sink_rx.recv().await.unwrap().id, "e1");
        assert!(
            tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
                .await
                .is_err(),
            "e2 no longer matches the active snapshot"
        );
        assert_eq!(
            acked.lock().unwrap().first().cloned(),
            Some(vec!["e1".to_string(), "e2".to_string()])
        );

        transport.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_are_reported_and_retried() {
        let mut api = MockUniformApi::new();
        api.expect_pending_events().times(1).returning(|_, _| {
            Err(ApiError::Status {
                status: 503,
                message: "unavailable".into(),
            })
        });
        api.expect_pending_events()
            .returning(|_, _| Ok(vec![event("e1", "t1", "p")]));
        api.expect_mark_consumed().returning(|_, _| Ok(()));
        let transport = transport(api);

        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel(8);
        let ctx = LoopContext::default();
        let started = tokio::time::Instant::now();
        let handle = transport.start(
            ctx.clone(),
            RegistrationData::new("c1", vec![Subscription::new("t1")]),
            sink_tx,
            err_tx,
        );

        let err = err_rx.recv().await.unwrap();
        assert!(err.is_retriable());
        assert_eq!(sink_rx.recv().await.unwrap().id, "e1");
        assert!(started.elapsed() >= Duration::from_secs(5));

        ctx.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_redelivers() {
        let mut api = MockUniformApi::new();
        api.expect_pending_events()
            .returning(|_, _| Ok(vec![event("e1", "t1", "p")]));
        api.expect_mark_consumed().times(1).returning(|_, _| {
            Err(ApiError::Status {
                status: 500,
                message: "boom".into(),
            })
        });
        api.expect_mark_consumed().returning(|_, _| Ok(()));
        let transport = transport(api);

        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel(8);
        let ctx = LoopContext::default();
        let handle = transport.start(
            ctx.clone(),
            RegistrationData::new("c1", vec![Subscription::new("t1")]),
            sink_tx,
            err_tx,
        );

        assert_eq!(sink_rx.recv().await.unwrap().id, "e1");
        assert!(err_rx.recv().await.unwrap().is_retriable());
        assert_eq!(sink_rx.recv().await.unwrap().id, "e1");

        transport.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_filter_applies_on_next_tick() {
        let requested: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let requested_in = requested.clone();
        let mut api = MockUniformApi::new();
        api.expect_pending_events().returning(move |event_type, _| {
            requested_in.lock().unwrap().push(event_type.to_string());
            Ok(vec![])
        });
        let transport = transport(api);

        let (sink_tx, _sink_rx) = mpsc::channel(8);
        let (err_tx, _err_rx) = mpsc::channel(8);
        let ctx = LoopContext::default();
        let handle = transport.start(
            ctx.clone(),
            RegistrationData::new("c1", vec![Subscription::new("t1")]),
            sink_tx,
            err_tx,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        transport.update_filter(vec![Subscription::new("t2"), Subscription::new("t3")]);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            requested.lock().unwrap().clone(),
            vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]
        );
        ctx.cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_consumer_without_identity() {
        let consumers: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let consumers_in = consumers.clone();
        let mut api = MockUniformApi::new();
        api.expect_pending_events().returning(move |_, consumer| {
            consumers_in.lock().unwrap().push(consumer.to_string());
            Ok(vec![])
        });
        let transport = transport(api);

        let (sink_tx, _sink_rx) = mpsc::channel(8);
        let (err_tx, _err_rx) = mpsc::channel(8);
        let ctx = LoopContext::default();
        let handle = transport.start(
            ctx.clone(),
            RegistrationData::new("", vec![Subscription::new("t1")]),
            sink_tx,
            err_tx,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        transport.stop();
        handle.await.unwrap();

        let consumers = consumers.lock().unwrap();
        assert_eq!(consumers.len(), 1);
        assert!(consumers[0].starts_with("anonymous-"));
    }
}
