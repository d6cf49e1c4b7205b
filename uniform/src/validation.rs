//! Subscription filter validation.
//!
//! Two typed entry points: [`validate_subscription`] for standalone
//! subscriptions (checked against the stored owner) and
//! [`validate_integration`] for registration payloads with embedded
//! subscriptions.

use thiserror::Error;

use crate::models::{Integration, Subscription};

/// Integration name whose subscriptions must be scoped to one project.
pub const WEBHOOK_SERVICE: &str = "webhook-service";

/// A subscription violates a filter invariant. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("the event must be specified when setting up a subscription")]
    MissingEvent,

    #[error("at least one stage must be specified when setting up a subscription filter for a service")]
    ServiceWithoutStage,

    #[error("webhook should refer to exactly one project, got {0}")]
    WebhookProjectCount(usize),
}

/// Validate one subscription owned by the integration named `owner_name`.
///
/// `owner_name` is the name stored in the registry at write time, not a
/// name the caller claims.
pub fn validate_subscription(
    subscription: &Subscription,
    owner_name: Option<&str>,
) -> Result<(), ValidationError> {
    if subscription.event.trim().is_empty() {
        return Err(ValidationError::MissingEvent);
    }

    let filter = &subscription.filter;
    if !filter.services.is_empty() && filter.stages.is_empty() {
        return Err(ValidationError::ServiceWithoutStage);
    }

    if owner_name == Some(WEBHOOK_SERVICE) && filter.projects.len() != 1 {
        return Err(ValidationError::WebhookProjectCount(filter.projects.len()));
    }

    Ok(())
}

/// Validate every embedded subscription of a registration payload.
pub fn validate_integration(integration: &Integration) -> Result<(), ValidationError> {
    integration
        .subscriptions
        .iter()
        .try_for_each(|s| validate_subscription(s, Some(integration.name.as_str())))
}
