//! Distributor: the client side of the uniform.
//!
//! Registers an integration with the registry, keeps its subscription set
//! fresh and delivers matching events to the local integration.
//!
//! - [`subscription_source`]: registry-polling or fixed subscription sets
//! - [`transport`]: bus (push) and poll (pull) event transports
//! - [`control_plane`]: orchestration, supervision and ordered shutdown
//! - [`api`]: registry HTTP client
//! - [`forwarder`]: HTTP delivery to the local integration
//! - [`relay`]: outbound events from the integration to the control plane
//! - [`error_log`]: error reports of the integration to the uniform log

#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod error;
pub mod error_log;
pub mod forwarder;
pub mod relay;
pub mod subscription_source;
pub mod transport;

pub use api::{ApiError, UniformApi, UniformClient};
pub use config::{
    BusConfig, ConnectionType, ControlPlaneConfig, DistributorConfig, PollConfig,
    SubscriptionSourceConfig,
};
pub use context::{LoopContext, RegistrationData, StopSignal};
pub use control_plane::ControlPlane;
pub use error::{ControlPlaneError, RetryCategory, TransportError};
pub use error_log::{ErrorLogForwarder, ERROR_LOG_EVENT};
pub use forwarder::Forwarder;
pub use relay::{EventPublisher, EventRelay, RegistryPublisher};
pub use subscription_source::{
    FixedSubscriptionSource, SubscriptionSource, UniformSubscriptionSource,
};
pub use transport::{
    ActiveFilter, BusMessage, BusSubscription, BusTransport, EventTransport, LocalBus, MessageBus,
    NatsBus, PollTransport,
};
