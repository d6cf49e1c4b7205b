//! Distributor error taxonomy with retry classification.
//!
//! Loops never decide on their own whether an error is fatal. They report
//! every failure to the control plane, which queries `is_retriable()` and
//! either keeps supervising or shuts down.
//!
//! | Category  | Retriable | Examples |
//! |-----------|-----------|----------|
//! | Transient | yes | registry unreachable, 5xx, bus connect/publish/subscribe failure |
//! | Fatal     | no  | 4xx from the registry, sink closed, invalid URL |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;

/// Classification used by the control plane to decide whether to keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Logged; the next tick or reconnect attempt is the retry.
    Transient,
    /// Delivery cannot continue; triggers ordered shutdown.
    Fatal,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors raised by an event transport loop.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A registry call made by the poll transport failed.
    #[error("Registry request failed: {0}")]
    Registry(#[from] ApiError),

    /// The message bus could not be reached.
    #[error("Connecting to bus at '{url}' failed: {message}")]
    Connect { url: String, message: String },

    /// An outbound event could not be handed to the control plane.
    #[error("Publishing '{subject}' failed: {message}")]
    Publish { subject: String, message: String },

    /// The message bus refused a subscription.
    #[error("Subscribing to '{subject}' failed: {message}")]
    Subscribe { subject: String, message: String },

    /// Nobody is draining forwarded events any more.
    #[error("Event sink closed")]
    SinkClosed,
}

impl TransportError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Registry(e) => e.retry_category(),
            Self::Connect { .. } | Self::Publish { .. } | Self::Subscribe { .. } => {
                RetryCategory::Transient
            }
            Self::SinkClosed => RetryCategory::Fatal,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    pub fn connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn publish(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn subscribe(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Errors returned by the control plane orchestrator.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Initial registration failed; nothing can run without an identity.
    #[error("Registration failed: {0}")]
    Registration(#[source] ApiError),

    /// `unregister` was called before a successful `register`.
    #[error("Integration is not registered")]
    NotRegistered,

    #[error("Unregister failed: {0}")]
    Unregister(#[source] ApiError),

    /// A transport reported an error classified as fatal.
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// Loops did not report completion within the shutdown timeout.
    #[error("Loops did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}
