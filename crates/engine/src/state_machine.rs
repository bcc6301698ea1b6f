//! Delivery state machine.
//!
//! ```text
//! QUEUED ──claim──▶ PROCESSING ──succeed──▶ SENT
//!                     │  ▲
//!               retry │  │ claim
//!                     ▼  │
//!                   RETRYING
//!
//! PROCESSING ──exhaust──▶ FAILED
//! ```
//!
//! `SENT` and `FAILED` are terminal: every event is rejected once a delivery
//! reaches them. The ledger only writes a status produced by [`transition`].

use thiserror::Error;

use herald_common::types::DeliveryStatus;

/// Something that happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A worker took ownership of the delivery for one attempt.
    Claim,
    /// The attempt succeeded and the rendered message is ready to store.
    Succeed { message: String },
    /// The attempt failed and attempts remain.
    Retry,
    /// The attempt failed and it was the last one allowed.
    Exhaust,
}

impl DeliveryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryEvent::Claim => "claim",
            DeliveryEvent::Succeed { .. } => "succeed",
            DeliveryEvent::Retry => "retry",
            DeliveryEvent::Exhaust => "exhaust",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid delivery transition: {event} from {from}")]
pub struct TransitionError {
    pub from: DeliveryStatus,
    pub event: &'static str,
}

pub fn transition(
    current: DeliveryStatus,
    event: &DeliveryEvent,
) -> Result<DeliveryStatus, TransitionError> {
    match (current, event) {
        (DeliveryStatus::Queued, DeliveryEvent::Claim) => Ok(DeliveryStatus::Processing),
        (DeliveryStatus::Retrying, DeliveryEvent::Claim) => Ok(DeliveryStatus::Processing),
        (DeliveryStatus::Processing, DeliveryEvent::Succeed { .. }) => Ok(DeliveryStatus::Sent),
        (DeliveryStatus::Processing, DeliveryEvent::Retry) => Ok(DeliveryStatus::Retrying),
        (DeliveryStatus::Processing, DeliveryEvent::Exhaust) => Ok(DeliveryStatus::Failed),
        _ => Err(TransitionError {
            from: current,
            event: event.name(),
        }),
    }
}

/// Is `to` reachable from `from` in a single step?
pub fn is_valid_step(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    let events = [
        DeliveryEvent::Claim,
        DeliveryEvent::Succeed {
            message: String::new(),
        },
        DeliveryEvent::Retry,
        DeliveryEvent::Exhaust,
    ];
    events
        .iter()
        .any(|event| transition(from, event) == Ok(to))
}

/// Check that a sequence of observed statuses is a walk of the graph that
/// starts at `QUEUED`.
pub fn is_valid_walk(statuses: &[DeliveryStatus]) -> bool {
    match statuses.first() {
        Some(DeliveryStatus::Queued) => statuses
            .windows(2)
            .all(|pair| is_valid_step(pair[0], pair[1])),
        _ => false,
    }
}
