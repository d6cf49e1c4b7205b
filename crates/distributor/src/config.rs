use std::time::Duration;

use tracing::warn;

use uniform::{Integration, MetaData, Subscription, SubscriptionFilter};

/// Subject used by the fixed source when no topics are configured.
pub const ALL_EVENTS: &str = "sh.keptn.event.>";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_RELAY_PORT: u16 = 8081;

/// Floor for every loop interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// `configured`, raised to [`MIN_INTERVAL`]. A zero period would panic
/// inside the spawned loop.
pub(crate) fn loop_interval(configured: Duration) -> Duration {
    if configured < MIN_INTERVAL {
        warn!(
            configured_ms = configured.as_millis() as u64,
            min_ms = MIN_INTERVAL.as_millis() as u64,
            "Loop interval below minimum, clamping"
        );
        MIN_INTERVAL
    } else {
        configured
    }
}

/// Registry-polling subscription source settings.
#[derive(Debug, Clone)]
pub struct SubscriptionSourceConfig {
    /// Time between heartbeats / subscription refreshes (default 5s).
    pub fetch_interval: Duration,
}

impl Default for SubscriptionSourceConfig {
    fn default() -> Self {
        Self {
            fetch_interval: DEFAULT_INTERVAL,
        }
    }
}

/// Poll transport settings.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Time between pending-event queries (default 5s).
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Bus transport settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Retry interval for subjects whose subscription failed (default 5s).
    pub resubscribe_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            resubscribe_interval: DEFAULT_INTERVAL,
        }
    }
}

/// Channel sizes and shutdown bound for the control plane.
///
/// Every channel blocks when full; nothing is dropped. The filter channel
/// into a transport is latest-value, so a snapshot may supersede an
/// unapplied one.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Source → control plane snapshots (default 1).
    pub subscription_buffer: usize,
    /// Transport → control plane errors (default 16).
    pub error_buffer: usize,
    /// Transport → forwarder events (default 64).
    pub sink_buffer: usize,
    /// Upper bound on waiting for both loops to finish (default 30s).
    pub shutdown_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            subscription_buffer: 1,
            error_buffer: 16,
            sink_buffer: 64,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// How events reach the distributor from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Push over NATS (`PUBSUB_URL` set)
    Nats,
    /// Poll the registry's pending-event endpoint
    Http,
}

/// Top-level distributor configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Registry base URL (`KEPTN_API_ENDPOINT`)
    pub api_endpoint: String,
    /// Bound on every registry and forwarding request (`API_PROXY_TIMEOUT_SECS`)
    pub api_timeout: Duration,
    /// NATS server URL (`PUBSUB_URL`); selects the push transport when set
    pub pubsub_url: Option<String>,
    /// Port of the outbound event relay (`API_PROXY_PORT`)
    pub relay_port: u16,
    pub recipient: String,
    pub recipient_port: String,
    pub recipient_path: String,
    /// Event types the integration wants (`PUBSUB_TOPIC`, comma-separated)
    pub topics: Vec<String>,
    pub project_filter: Vec<String>,
    pub stage_filter: Vec<String>,
    pub service_filter: Vec<String>,
    /// Integration name (`K8S_DEPLOYMENT_COMPONENT`); no identity when unset
    pub component: Option<String>,
    pub namespace: String,
    pub node_name: String,
    pub pod_name: String,
    pub deployment_name: String,
    pub location: String,
    pub integration_version: String,
    pub distributor_version: String,
    pub source: SubscriptionSourceConfig,
    pub poll: PollConfig,
    pub bus: BusConfig,
    pub control_plane: ControlPlaneConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl DistributorConfig {
    /// Build from an arbitrary variable lookup (the environment in `Default`).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());
        let list = |key: &str| var(key).map(|v| split_list(&v)).unwrap_or_default();
        let seconds = |key: &str, default: Duration| match var(key) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!(key, value = %raw, "Ignoring invalid duration, using default");
                    default
                }
            },
            None => default,
        };

        Self {
            api_endpoint: or("KEPTN_API_ENDPOINT", "http://localhost:8080"),
            api_timeout: seconds("API_PROXY_TIMEOUT_SECS", Duration::from_secs(10)),
            pubsub_url: var("PUBSUB_URL"),
            relay_port: match var("API_PROXY_PORT") {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!(value = %raw, "Ignoring invalid API_PROXY_PORT, using 8081");
                    DEFAULT_RELAY_PORT
                }),
                None => DEFAULT_RELAY_PORT,
            },
            recipient: or("PUBSUB_RECIPIENT", "127.0.0.1"),
            recipient_port: or("PUBSUB_RECIPIENT_PORT", "8080"),
            recipient_path: or("PUBSUB_RECIPIENT_PATH", ""),
            topics: list("PUBSUB_TOPIC"),
            project_filter: list("PROJECT_FILTER"),
            stage_filter: list("STAGE_FILTER"),
            service_filter: list("SERVICE_FILTER"),
            component: var("K8S_DEPLOYMENT_COMPONENT"),
            namespace: or("K8S_NAMESPACE", ""),
            node_name: or("K8S_NODE_NAME", ""),
            pod_name: or("K8S_POD_NAME", ""),
            deployment_name: or("K8S_DEPLOYMENT_NAME", ""),
            location: or("LOCATION", "control-plane"),
            integration_version: or("VERSION", ""),
            distributor_version: or("DISTRIBUTOR_VERSION", env!("CARGO_PKG_VERSION")),
            source: SubscriptionSourceConfig {
                fetch_interval: seconds("SUBSCRIPTION_FETCH_INTERVAL", DEFAULT_INTERVAL),
            },
            poll: PollConfig {
                interval: seconds("HTTP_POLLING_INTERVAL", DEFAULT_INTERVAL),
            },
            bus: BusConfig {
                resubscribe_interval: seconds("PUBSUB_RESUBSCRIBE_INTERVAL", DEFAULT_INTERVAL),
            },
            control_plane: ControlPlaneConfig::default(),
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        if self.pubsub_url.is_some() {
            ConnectionType::Nats
        } else {
            ConnectionType::Http
        }
    }

    /// NATS queue group: replicas of a registered integration share one.
    pub fn queue_group(&self) -> Option<String> {
        if !self.validate_registration_constraints() {
            return None;
        }
        if self.deployment_name.is_empty() {
            self.component.clone()
        } else {
            Some(self.deployment_name.clone())
        }
    }

    /// Listen address of the outbound event relay.
    pub fn relay_addr(&self) -> String {
        format!("0.0.0.0:{}", self.relay_port)
    }

    /// Whether the integration has an identity to register with.
    pub fn validate_registration_constraints(&self) -> bool {
        self.component.is_some()
    }

    /// URL of the local integration events are forwarded to.
    pub fn recipient_url(&self) -> String {
        let host = if self.recipient.starts_with("http://") || self.recipient.starts_with("https://")
        {
            self.recipient.clone()
        } else {
            format!("http://{}", self.recipient)
        };
        let path = if self.recipient_path.is_empty() || self.recipient_path.starts_with('/') {
            self.recipient_path.clone()
        } else {
            format!("/{}", self.recipient_path)
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        format!("{}:{}{}", host, self.recipient_port, path)
    }

    fn filter(&self) -> SubscriptionFilter {
        SubscriptionFilter::new(
            self.project_filter.iter().cloned(),
            self.stage_filter.iter().cloned(),
            self.service_filter.iter().cloned(),
        )
    }

    /// One subscription per configured topic, carrying the scope filters.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.topics
            .iter()
            .map(|topic| Subscription::new(topic.clone()).with_filter(self.filter()))
            .collect()
    }

    /// Subscriptions for the no-identity mode: the configured topics, or
    /// every event when none are set.
    pub fn fixed_subscriptions(&self) -> Vec<Subscription> {
        if self.topics.is_empty() {
            return vec![Subscription::new(ALL_EVENTS).with_filter(self.filter())];
        }
        self.subscriptions()
    }

    /// The integration registered with the uniform.
    pub fn integration(&self) -> Integration {
        let metadata = MetaData {
            hostname: self.node_name.clone(),
            integration_version: self.integration_version.clone(),
            distributor_version: self.distributor_version.clone(),
            location: self.location.clone(),
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            deployment_name: self.deployment_name.clone(),
            last_seen: None,
        };
        let mut integration = Integration::new(self.component.clone().unwrap_or_default(), metadata);
        integration.subscriptions = self.subscriptions();
        integration
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
