//! Event transports: deliver events matching the active subscription set.
//!
//! Two interchangeable variants:
//! - [`bus::BusTransport`]: push; one bus subscription per distinct event type,
//!   over [`bus::LocalBus`] in process or [`nats::NatsBus`] against a NATS server
//! - [`poll::PollTransport`]: pull; periodic pending-event queries against the registry
//!
//! The active filter is replaced wholesale through [`EventTransport::update_filter`].
//! Transports hold it in a `watch` channel: the loop always reads the latest
//! snapshot, never a merge of old and new.

pub mod bus;
pub mod nats;
pub mod poll;

use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use uniform::{EventEnvelope, Subscription};

use crate::context::{LoopContext, RegistrationData};
use crate::error::TransportError;

pub use bus::{BusMessage, BusSubscription, BusTransport, LocalBus, MessageBus};
pub use nats::NatsBus;
pub use poll::PollTransport;

pub trait EventTransport: Send + Sync {
    /// Transport name for logging (e.g. `"poll"`, `"bus"`).
    fn name(&self) -> &'static str;

    /// Spawn the delivery loop on `ctx.tracker`, starting from
    /// `registration.subscriptions`. Matching events go to `sink` in the
    /// order received; every failure is reported on `errors`.
    fn start(
        &self,
        ctx: LoopContext,
        registration: RegistrationData,
        sink: mpsc::Sender<EventEnvelope>,
        errors: mpsc::Sender<TransportError>,
    ) -> JoinHandle<()>;

    /// Replace the active subscription set.
    fn update_filter(&self, subscriptions: Vec<Subscription>);

    /// Ask the loop to exit. Nothing is forwarded once the loop has seen it.
    fn stop(&self);
}

/// A subscription snapshot. An event passes when any subscription matches it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveFilter {
    subscriptions: Vec<Subscription>,
}

impl ActiveFilter {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self { subscriptions }
    }

    pub fn matches(&self, event: &EventEnvelope) -> bool {
        self.subscriptions.iter().any(|s| s.matches(event))
    }

    /// Distinct event types (or patterns), sorted.
    pub fn event_types(&self) -> BTreeSet<String> {
        self.subscriptions
            .iter()
            .filter(|s| !s.event.is_empty())
            .map(|s| s.event.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Report `err` unless the loop is told to stop first. Returns `false` when
/// the loop must exit.
pub(crate) async fn report(
    ctx: &LoopContext,
    stop: &tokio::sync::Notify,
    errors: &mpsc::Sender<TransportError>,
    err: TransportError,
) -> bool {
    tracing::debug!(category = %err.retry_category(), "Transport error: {}", err);
    matches!(ctx.until_stopped(stop, errors.send(err)).await, Some(Ok(())))
}
