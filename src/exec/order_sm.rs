use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Intent,
    Validated,
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Unknown,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Intent => "INTENT",
            OrderState::Validated => "VALIDATED",
            OrderState::Submitted => "SUBMITTED",
            OrderState::Open => "OPEN",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::Filled => "FILLED",
            OrderState::Canceled => "CANCELED",
            OrderState::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
}

/// Venue-reported status used by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl VenueStatus {
    pub fn as_order_state(&self) -> OrderState {
        match self {
            VenueStatus::Open => OrderState::Open,
            VenueStatus::PartiallyFilled => OrderState::PartiallyFilled,
            VenueStatus::Filled => OrderState::Filled,
            VenueStatus::Canceled => OrderState::Canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
    pub state: OrderState,
    pub spec: OrderSpec,
    pub filled_qty: f64,
    pub seen_fills: BTreeSet<String>,
    /// Gate decision that authorized the intent.
    pub gate_id: String,
    pub inputs_digest: String,
    pub limits_snapshot: Value,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    /// Set when the order reaches FILLED or CANCELED.
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub revision: u64,
    pub escalated: bool,
    pub status_reason: Option<String>,
}

impl Order {
    pub fn new(
        client_order_id: &str,
        spec: OrderSpec,
        gate_id: &str,
        inputs_digest: &str,
        limits_snapshot: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_order_id: client_order_id.to_string(),
            venue_order_id: None,
            state: OrderState::Intent,
            spec,
            filled_qty: 0.0,
            seen_fills: BTreeSet::new(),
            gate_id: gate_id.to_string(),
            inputs_digest: inputs_digest.to_string(),
            limits_snapshot,
            created_at,
            submitted_at: None,
            last_reconciled_at: None,
            closed_at: None,
            revision: 0,
            escalated: false,
            status_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Validate,
    Submit { at: DateTime<Utc> },
    Ack { venue_order_id: String },
    Fill { fill_id: String, qty: f64, price: f64 },
    Canceled { reason: String },
    /// Timeout, cancellation or a mismatch the live path cannot resolve.
    Ambiguous { reason: String },
    /// Closes an order that never reached the venue.
    Abandon { reason: String },
    Reconciled {
        status: VenueStatus,
        venue_order_id: Option<String>,
        filled_qty: f64,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Validate => "validate",
            Event::Submit { .. } => "submit",
            Event::Ack { .. } => "ack",
            Event::Fill { .. } => "fill",
            Event::Canceled { .. } => "canceled",
            Event::Ambiguous { .. } => "ambiguous",
            Event::Abandon { .. } => "abandon",
            Event::Reconciled { .. } => "reconciled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: OrderState,
    pub event: &'static str,
}

fn apply_fill(order: &mut Order, fill_id: String, qty: f64) -> bool {
    if !order.seen_fills.insert(fill_id) {
        return false;
    }
    order.filled_qty += qty;
    order.state = if order.filled_qty + 1e-9 >= order.spec.qty {
        OrderState::Filled
    } else {
        OrderState::PartiallyFilled
    };
    true
}

/// Applies `event` in place. Returns whether anything changed; a duplicate
/// fill or a late event on a terminal order is a no-op, not an error.
pub fn apply_event(order: &mut Order, event: Event) -> Result<bool, TransitionError> {
    use OrderState::*;
    let name = event.name();
    let invalid = |from: OrderState| -> Result<bool, TransitionError> { Err(TransitionError { from, event: name }) };

    match (order.state, event) {
        (Intent, Event::Validate) => {
            order.state = Validated;
            Ok(true)
        }
        (Validated, Event::Submit { at }) => {
            order.state = Submitted;
            order.submitted_at = Some(at);
            Ok(true)
        }
        (Intent | Validated, Event::Abandon { reason }) => {
            order.state = Canceled;
            order.status_reason = Some(reason);
            Ok(true)
        }
        (Submitted, Event::Ack { venue_order_id }) => {
            order.venue_order_id = Some(venue_order_id);
            order.state = Open;
            Ok(true)
        }
        (Open | PartiallyFilled, Event::Ack { venue_order_id }) => {
            order.venue_order_id.get_or_insert(venue_order_id);
            Ok(false)
        }
        (Submitted | Open | PartiallyFilled, Event::Fill { fill_id, qty, .. }) => Ok(apply_fill(order, fill_id, qty)),
        (Submitted | Open | PartiallyFilled, Event::Canceled { reason }) => {
            order.state = Canceled;
            order.status_reason = Some(reason);
            Ok(true)
        }
        (Submitted | Open | PartiallyFilled, Event::Ambiguous { reason }) => {
            order.state = Unknown;
            order.status_reason = Some(reason);
            Ok(true)
        }
        (Unknown, Event::Ambiguous { .. }) => Ok(false),
        (
            Submitted | Open | PartiallyFilled | Unknown,
            Event::Reconciled { status, venue_order_id, filled_qty, at },
        ) => {
            let before = (order.state, order.venue_order_id.clone(), order.filled_qty);
            order.last_reconciled_at = Some(at);
            if venue_order_id.is_some() {
                order.venue_order_id = venue_order_id;
            }
            order.filled_qty = order.filled_qty.max(filled_qty);
            order.state = status.as_order_state();
            if order.state == Canceled && order.status_reason.is_none() {
                order.status_reason = Some("reconciled".to_string());
            }
            Ok(before != (order.state, order.venue_order_id.clone(), order.filled_qty))
        }
        (Filled | Canceled, _) => Ok(false),
        (from, _) => invalid(from),
    }
}
