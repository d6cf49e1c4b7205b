//! Uniform: the integration registry of the control plane.
//!
//! This library provides:
//! - The shared data model (integrations, subscriptions, event envelopes)
//! - Subject and filter matching used by both transports
//! - Subscription validation
//! - The registry service with idempotent registration
//! - A pending-event queue for polling distributors
//! - The error log integrations report to
//! - The axum HTTP surface (feature `server`)
//!
//! # Usage
//!
//! ```bash
//! # Serve the registry on the default address
//! uniform-registry
//!
//! # Persist registrations across restarts
//! uniform-registry --bind 0.0.0.0:8080 --data-dir ./registry-state
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod error;
pub mod events;
pub mod filter;
pub mod logs;
pub mod models;
pub mod registry;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod validation;

pub use error::{ErrorBody, UniformError, UniformResult};
pub use events::EventQueue;
pub use filter::{is_wildcard, subject_matches};
pub use logs::ErrorLog;
pub use models::{
    ConsumedRequest, CreateSubscriptionResponse, EventEnvelope, Integration, IntegrationId,
    LogEntry, LogsBody, MetaData, RegisterResponse, Subscription, SubscriptionFilter,
};
pub use registry::{RegisterOutcome, UniformRegistry};
#[cfg(feature = "server")]
pub use server::{router, RegistryServer};
pub use store::{IntegrationQuery, MemoryRepo, UniformRepo};
pub use validation::{validate_integration, validate_subscription, ValidationError, WEBHOOK_SERVICE};
