//! Subscription lifecycle events decoded from verified webhook payloads
//!
//! Only the fields the state machine needs are decoded. Everything else in the
//! processor payload is kept verbatim in the webhook ledger for replay.

use examprep_shared::SubscriptionStatus;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::client::map_status_str;
use crate::error::{BillingError, BillingResult};

/// Lifecycle event types this consumer acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEventKind {
    Created,
    Updated,
    Deleted,
    PaymentFailed,
}

impl LifecycleEventKind {
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "customer.subscription.created" => Some(Self::Created),
            "customer.subscription.updated" => Some(Self::Updated),
            "customer.subscription.deleted" => Some(Self::Deleted),
            "invoice.payment_failed" => Some(Self::PaymentFailed),
            _ => None,
        }
    }

    pub fn as_event_type(&self) -> &'static str {
        match self {
            Self::Created => "customer.subscription.created",
            Self::Updated => "customer.subscription.updated",
            Self::Deleted => "customer.subscription.deleted",
            Self::PaymentFailed => "invoice.payment_failed",
        }
    }
}

/// Subscription object as carried by `customer.subscription.*` events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub subscription_ref: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleData {
    Subscription(SubscriptionSnapshot),
    PaymentFailed {
        invoice_ref: String,
        subscription_ref: Option<String>,
    },
}

/// A verified, decoded subscription lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub event_id: String,
    pub kind: LifecycleEventKind,
    /// Processor timestamp; the only ordering signal between events
    pub occurred_at: OffsetDateTime,
    pub customer_ref: String,
    pub data: LifecycleData,
}

impl LifecycleEvent {
    /// Subscription this event concerns, if the payload names one
    pub fn subscription_ref(&self) -> Option<&str> {
        match &self.data {
            LifecycleData::Subscription(snapshot) => Some(&snapshot.subscription_ref),
            LifecycleData::PaymentFailed {
                subscription_ref, ..
            } => subscription_ref.as_deref(),
        }
    }
}

/// Outcome of decoding a verified payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    Lifecycle(LifecycleEvent),
    Unhandled { event_id: String, event_type: String },
}

#[derive(Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EventData,
}

#[derive(Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// Ids that may arrive expanded into full objects
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Expandable,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    trial_end: Option<i64>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct InvoiceObject {
    id: String,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    /// Newer API versions moved the subscription reference here
    parent: Option<InvoiceParent>,
}

#[derive(Deserialize)]
struct InvoiceParent {
    subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Deserialize)]
struct InvoiceSubscriptionDetails {
    subscription: Option<Expandable>,
}

fn timestamp(secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| BillingError::WebhookPayloadInvalid(format!("bad timestamp {}: {}", secs, e)))
}

fn optional_timestamp(secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(timestamp).transpose()
}

/// Decode a payload whose signature has already been verified
pub fn parse_event(payload: &str) -> BillingResult<ParsedEvent> {
    let envelope: EventEnvelope = serde_json::from_str(payload)
        .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

    let Some(kind) = LifecycleEventKind::from_event_type(&envelope.event_type) else {
        return Ok(ParsedEvent::Unhandled {
            event_id: envelope.id,
            event_type: envelope.event_type,
        });
    };

    let occurred_at = timestamp(envelope.created)?;

    let (customer_ref, data) = match kind {
        LifecycleEventKind::Created | LifecycleEventKind::Updated | LifecycleEventKind::Deleted => {
            let object: SubscriptionObject = serde_json::from_value(envelope.data.object)
                .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
            let status = map_status_str(&object.status).ok_or_else(|| {
                BillingError::WebhookPayloadInvalid(format!(
                    "unknown subscription status {}",
                    object.status
                ))
            })?;
            let snapshot = SubscriptionSnapshot {
                subscription_ref: object.id,
                status,
                cancel_at_period_end: object.cancel_at_period_end,
                canceled_at: optional_timestamp(object.canceled_at)?,
                trial_end: optional_timestamp(object.trial_end)?,
                current_period_start: optional_timestamp(object.current_period_start)?,
                current_period_end: optional_timestamp(object.current_period_end)?,
            };
            (
                object.customer.into_id(),
                LifecycleData::Subscription(snapshot),
            )
        }
        LifecycleEventKind::PaymentFailed => {
            let object: InvoiceObject = serde_json::from_value(envelope.data.object)
                .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
            let customer = object.customer.ok_or_else(|| {
                BillingError::WebhookPayloadInvalid(format!("invoice {} has no customer", object.id))
            })?;
            let subscription_ref = object
                .subscription
                .or_else(|| {
                    object
                        .parent
                        .and_then(|p| p.subscription_details)
                        .and_then(|d| d.subscription)
                })
                .map(Expandable::into_id);
            (
                customer.into_id(),
                LifecycleData::PaymentFailed {
                    invoice_ref: object.id,
                    subscription_ref,
                },
            )
        }
    };

    Ok(ParsedEvent::Lifecycle(LifecycleEvent {
        event_id: envelope.id,
        kind,
        occurred_at,
        customer_ref,
        data,
    }))
}
