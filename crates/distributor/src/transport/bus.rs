//! Push transport over a message bus.
//!
//! [`MessageBus`] is the seam to the bus client. [`LocalBus`] is the
//! in-process implementation on a tokio broadcast channel. [`BusTransport`]
//! keeps one bus subscription per distinct event type of the active filter
//! and re-checks every received message against the full filter, so a
//! message still in flight for an unsubscribed type is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uniform::{subject_matches, EventEnvelope, Subscription};

use super::{report, ActiveFilter, EventTransport};
use crate::config::{loop_interval, BusConfig};
use crate::context::{LoopContext, RegistrationData, StopSignal};
use crate::error::TransportError;

/// Broadcast capacity of [`LocalBus`]
const CHANNEL_CAPACITY: usize = 256;

/// Buffer between bus subscriptions and the transport loop
const DELIVERY_BUFFER: usize = 64;

/// A raw message as delivered by the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Handle for one bus subscription. Delivery stops on
/// [`BusSubscription::unsubscribe`] or when the handle is dropped.
pub struct BusSubscription {
    subject: String,
    cancel: CancellationToken,
}

impl BusSubscription {
    pub fn new(subject: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            subject: subject.into(),
            cancel,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn unsubscribe(self) {
        debug!(subject = %self.subject, "Unsubscribed");
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver every message whose subject matches `subject` (literal or
    /// wildcard) to `deliver` until the returned handle is released.
    async fn subscribe(
        &self,
        subject: &str,
        deliver: mpsc::Sender<BusMessage>,
    ) -> Result<BusSubscription, TransportError>;
}

/// In-process message bus.
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish raw bytes on `subject`. Returns the number of receivers.
    pub fn publish(&self, subject: impl Into<String>, payload: Vec<u8>) -> usize {
        let subject = subject.into();
        match self.sender.send(BusMessage {
            subject: subject.clone(),
            payload,
        }) {
            Ok(count) => {
                debug!(subject = %subject, receivers = count, "Message published");
                count
            }
            Err(_) => {
                debug!(subject = %subject, "Message published (no receivers)");
                0
            }
        }
    }

    /// Publish `event` as JSON on the subject equal to its type.
    pub fn publish_event(&self, event: &EventEnvelope) -> Result<usize, serde_json::Error> {
        let payload = serde_json::to_vec(event)?;
        Ok(self.publish(event.event_type.clone(), payload))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn subscribe(
        &self,
        subject: &str,
        deliver: mpsc::Sender<BusMessage>,
    ) -> Result<BusSubscription, TransportError> {
        if subject.trim().is_empty() {
            return Err(TransportError::subscribe(subject, "empty subject"));
        }
        let mut receiver = self.sender.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pattern = subject.to_string();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(message) => {
                        if !subject_matches(&pattern, &message.subject) {
                            continue;
                        }
                        let sent = tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            sent = deliver.send(message) => sent,
                        };
                        if sent.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(subject = %pattern, skipped, "Bus subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        debug!(subject = %subject, "Subscribed");
        Ok(BusSubscription::new(subject, cancel))
    }
}

/// Push transport on a [`MessageBus`].
pub struct BusTransport {
    bus: Arc<dyn MessageBus>,
    config: BusConfig,
    filter: watch::Sender<Vec<Subscription>>,
    stop: StopSignal,
}

impl BusTransport {
    pub fn new(bus: Arc<dyn MessageBus>, config: BusConfig) -> Self {
        let (filter, _) = watch::channel(Vec::new());
        Self {
            bus,
            config,
            filter,
            stop: StopSignal::default(),
        }
    }
}

/// Bring `current` in line with the event types of `active`. Subscribes that
/// fail are returned and retried on the next reconcile.
async fn reconcile(
    bus: &dyn MessageBus,
    active: &ActiveFilter,
    current: &mut HashMap<String, BusSubscription>,
    deliver: &mpsc::Sender<BusMessage>,
) -> Vec<TransportError> {
    let wanted = active.event_types();

    let removed: Vec<String> = current
        .keys()
        .filter(|subject| !wanted.contains(*subject))
        .cloned()
        .collect();
    for subject in removed {
        if let Some(subscription) = current.remove(&subject) {
            subscription.unsubscribe();
        }
    }

    let mut failures = Vec::new();
    for subject in wanted {
        if current.contains_key(&subject) {
            continue;
        }
        match bus.subscribe(&subject, deliver.clone()).await {
            Ok(subscription) => {
                current.insert(subject, subscription);
            }
            Err(e) => failures.push(e),
        }
    }
    failures
}

impl EventTransport for BusTransport {
    fn name(&self) -> &'static str {
        "bus"
    }

    fn start(
        &self,
        ctx: LoopContext,
        registration: RegistrationData,
        sink: mpsc::Sender<EventEnvelope>,
        errors: mpsc::Sender<TransportError>,
    ) -> JoinHandle<()> {
        self.filter.send_replace(registration.subscriptions);
        let mut filter_rx = self.filter.subscribe();
        let bus = self.bus.clone();
        let stop = self.stop.arm();
        let resubscribe_interval = loop_interval(self.config.resubscribe_interval);
        let tracker = ctx.tracker.clone();

        tracker.spawn(async move {
            let (deliver_tx, mut deliver_rx) = mpsc::channel::<BusMessage>(DELIVERY_BUFFER);
            let mut subscriptions: HashMap<String, BusSubscription> = HashMap::new();
            let mut active = ActiveFilter::new(filter_rx.borrow_and_update().clone());
            let mut retry = tokio::time::interval(resubscribe_interval);
            retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(subjects = active.event_types().len(), "Bus transport started");

            'run: loop {
                let failures = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break,
                    _ = stop.notified() => break,
                    changed = filter_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        active = ActiveFilter::new(filter_rx.borrow_and_update().clone());
                        debug!(subjects = active.event_types().len(), "Bus filter replaced");
                        reconcile(bus.as_ref(), &active, &mut subscriptions, &deliver_tx).await
                    }
                    _ = retry.tick() => {
                        reconcile(bus.as_ref(), &active, &mut subscriptions, &deliver_tx).await
                    }
                    Some(message) = deliver_rx.recv() => {
                        let event = match serde_json::from_slice::<EventEnvelope>(&message.payload) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(subject = %message.subject, "Dropping undecodable message: {}", e);
                                continue;
                            }
                        };
                        if !active.matches(&event) {
                            continue;
                        }
                        let permit = match ctx.until_stopped(&stop, sink.reserve()).await {
                            Some(Ok(permit)) => permit,
                            Some(Err(_)) => {
                                report(&ctx, &stop, &errors, TransportError::SinkClosed).await;
                                break;
                            }
                            None => break,
                        };
                        // A snapshot that arrived while waiting for room decides.
                        // Left unseen so the next pass reconciles subscriptions.
                        if filter_rx.has_changed().unwrap_or(false)
                            && !ActiveFilter::new(filter_rx.borrow().clone()).matches(&event)
                        {
                            debug!(event_id = %event.id, "Dropped by replaced subscription snapshot");
                            continue;
                        }
                        permit.send(event);
                        Vec::new()
                    }
                };
                for failure in failures {
                    if !report(&ctx, &stop, &errors, failure).await {
                        break 'run;
                    }
                }
            }

            for (_, subscription) in subscriptions.drain() {
                subscription.unsubscribe();
            }
            info!("Bus transport stopped");
        })
    }

    fn update_filter(&self, subscriptions: Vec<Subscription>) {
        self.filter.send_replace(subscriptions);
    }

    fn stop(&self) {
        self.stop.stop();
    }
}
