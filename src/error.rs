//! Error taxonomy. Every variant maps to a stable reason code that is
//! persisted next to the run or order it halted.

use thiserror::Error;

use crate::scope::ActionKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeViolation {
    #[error("layer {layer_id} is not permitted to {action_kind}")]
    ActionNotAllowed { layer_id: String, action_kind: ActionKind },
    #[error("layer {layer_id} has no loaded scope (requested {action_kind})")]
    UnknownLayer { layer_id: String, action_kind: ActionKind },
    #[error("layer {layer_id} evidence references scope {recorded}, loaded scope is {loaded}")]
    StaleScopeRef { layer_id: String, recorded: String, loaded: String },
}

impl ScopeViolation {
    pub fn layer_id(&self) -> &str {
        match self {
            ScopeViolation::ActionNotAllowed { layer_id, .. } => layer_id,
            ScopeViolation::UnknownLayer { layer_id, .. } => layer_id,
            ScopeViolation::StaleScopeRef { layer_id, .. } => layer_id,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            ScopeViolation::ActionNotAllowed { .. } => "SCOPE_VIOLATION",
            ScopeViolation::UnknownLayer { .. } => "UNKNOWN_LAYER",
            ScopeViolation::StaleScopeRef { .. } => "STALE_SCOPE_REF",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema mismatch on {field}: {detail}")]
pub struct SchemaMismatch {
    pub field: String,
    pub detail: String,
}

impl SchemaMismatch {
    pub fn new(field: &str, detail: impl Into<String>) -> Self {
        Self { field: field.to_string(), detail: detail.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("invocation timed out after {0} ms")]
    Timeout(u64),
    #[error("invocation cancelled")]
    Cancelled,
    #[error("invocation failed: {0}")]
    Failed(String),
    #[error("malformed output: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerRunCause {
    #[error("no capability scope loaded for layer")]
    UnknownLayer,
    #[error("no eligible profile")]
    NoEligibleProfile,
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error(transparent)]
    Scope(#[from] ScopeViolation),
    #[error(transparent)]
    Schema(#[from] SchemaMismatch),
    #[error("evidence store: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("layer {layer_id} run failed: {cause}")]
pub struct LayerRunError {
    pub layer_id: String,
    pub cause: LayerRunCause,
}

impl LayerRunError {
    pub fn new(layer_id: &str, cause: impl Into<LayerRunCause>) -> Self {
        Self { layer_id: layer_id.to_string(), cause: cause.into() }
    }

    pub fn reason_code(&self) -> &'static str {
        match &self.cause {
            LayerRunCause::UnknownLayer => "UNKNOWN_LAYER",
            LayerRunCause::NoEligibleProfile => "NO_ELIGIBLE_PROFILE",
            LayerRunCause::Invocation(InvocationError::Timeout(_)) => "MODEL_TIMEOUT",
            LayerRunCause::Invocation(InvocationError::Cancelled) => "MODEL_CANCELLED",
            LayerRunCause::Invocation(InvocationError::Failed(_)) => "MODEL_ERROR",
            LayerRunCause::Invocation(InvocationError::Malformed(_)) => "MODEL_OUTPUT_MALFORMED",
            LayerRunCause::Scope(v) => v.reason_code(),
            LayerRunCause::Schema(_) => "SCHEMA_MISMATCH",
            LayerRunCause::Store(_) => "EVIDENCE_STORE_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    #[error("venue timeout")]
    Timeout,
    #[error("venue rejected order: {0}")]
    Rejected(String),
    #[error("venue unavailable: {0}")]
    Unavailable(String),
    #[error("order not found at venue")]
    NotFound,
    #[error("order not cancelable in state {0}")]
    NotCancelable(String),
    #[error("request abandoned locally before a venue answer")]
    Cancelled,
}

impl VenueError {
    /// Failures that say nothing about whether the venue acted on the request.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, VenueError::Timeout | VenueError::Unavailable(_) | VenueError::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operator token rejected")]
pub struct NotAuthorized;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("kill switch engaged")]
    KillSwitchEngaged,
    #[error("risk gate blocked: {0:?}")]
    GateBlocked(Vec<String>),
    #[error("risk decision is stale")]
    StaleDecision,
    #[error("risk decision digest does not match current inputs")]
    DigestMismatch,
    #[error("unknown order {0}")]
    UnknownOrder(String),
    #[error("duplicate client order id {0}")]
    DuplicateOrder(String),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("order journal: {0}")]
    Journal(String),
}

impl ExecError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ExecError::KillSwitchEngaged => "KILL_SWITCH_ENGAGED",
            ExecError::GateBlocked(_) => "RISK_GATE_BLOCK",
            ExecError::StaleDecision => "STALE_RISK_DECISION",
            ExecError::DigestMismatch => "RISK_INPUTS_CHANGED",
            ExecError::UnknownOrder(_) => "UNKNOWN_ORDER",
            ExecError::DuplicateOrder(_) => "DUPLICATE_ORDER",
            ExecError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ExecError::Journal(_) => "ORDER_JOURNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_error_reason_codes() {
        let e = LayerRunError::new("research", InvocationError::Timeout(50));
        assert_eq!(e.reason_code(), "MODEL_TIMEOUT");
        let e = LayerRunError::new(
            "research",
            ScopeViolation::ActionNotAllowed {
                layer_id: "research".to_string(),
                action_kind: ActionKind::SubmitOrder,
            },
        );
        assert_eq!(e.reason_code(), "SCOPE_VIOLATION");
    }

    #[test]
    fn test_ambiguous_venue_errors() {
        assert!(VenueError::Timeout.is_ambiguous());
        assert!(VenueError::Unavailable("503".into()).is_ambiguous());
        assert!(VenueError::Cancelled.is_ambiguous());
        assert!(!VenueError::Rejected("bad qty".into()).is_ambiguous());
    }
}
