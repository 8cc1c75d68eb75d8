//! Capability scopes: the permission boundary of each pipeline layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::digest_of;
use crate::error::ScopeViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ReadMarketData,
    ReadMacroData,
    WriteResearchNote,
    PublishOutlook,
    RecommendTrade,
    ProposeOrder,
    Critique,
    EvaluateRisk,
    SubmitOrder,
    CancelOrder,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::ReadMarketData,
        ActionKind::ReadMacroData,
        ActionKind::WriteResearchNote,
        ActionKind::PublishOutlook,
        ActionKind::RecommendTrade,
        ActionKind::ProposeOrder,
        ActionKind::Critique,
        ActionKind::EvaluateRisk,
        ActionKind::SubmitOrder,
        ActionKind::CancelOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ReadMarketData => "READ_MARKET_DATA",
            ActionKind::ReadMacroData => "READ_MACRO_DATA",
            ActionKind::WriteResearchNote => "WRITE_RESEARCH_NOTE",
            ActionKind::PublishOutlook => "PUBLISH_OUTLOOK",
            ActionKind::RecommendTrade => "RECOMMEND_TRADE",
            ActionKind::ProposeOrder => "PROPOSE_ORDER",
            ActionKind::Critique => "CRITIQUE",
            ActionKind::EvaluateRisk => "EVALUATE_RISK",
            ActionKind::SubmitOrder => "SUBMIT_ORDER",
            ActionKind::CancelOrder => "CANCEL_ORDER",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, ActionKind::ReadMarketData | ActionKind::ReadMacroData)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Autonomy {
    ReadOnly,
    Recommend,
    Propose,
    Execute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityScope {
    pub layer_id: String,
    pub allowed_actions: BTreeSet<ActionKind>,
    pub read_only: bool,
    pub max_autonomy: Autonomy,
}

impl CapabilityScope {
    pub fn new(layer_id: &str, actions: &[ActionKind], read_only: bool, max_autonomy: Autonomy) -> Self {
        Self {
            layer_id: layer_id.to_string(),
            allowed_actions: actions.iter().copied().collect(),
            read_only,
            max_autonomy,
        }
    }

    pub fn allows(&self, action: ActionKind) -> bool {
        self.allowed_actions.contains(&action)
    }

    /// `<layer_id>@<digest>`; changes whenever any field of the scope changes.
    pub fn scope_ref(&self) -> String {
        let digest = digest_of(self).unwrap_or_default();
        format!("{}@{}", self.layer_id, &digest[..16.min(digest.len())])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeLoadError {
    #[error("duplicate scope for layer {0}")]
    Duplicate(String),
    #[error("read-only layer {layer_id} lists non-read action {action}")]
    ReadOnlyWithWrite { layer_id: String, action: ActionKind },
    #[error("layer {0} allows order actions without EXECUTE autonomy")]
    ExecuteBeyondAutonomy(String),
}

/// Immutable table of scopes for one process lifetime.
#[derive(Debug, Clone, Default)]
pub struct ScopeTable {
    scopes: BTreeMap<String, CapabilityScope>,
}

impl ScopeTable {
    pub fn from_scopes(scopes: Vec<CapabilityScope>) -> Result<Self, ScopeLoadError> {
        let mut map = BTreeMap::new();
        for scope in scopes {
            if scope.read_only {
                if let Some(action) = scope.allowed_actions.iter().find(|a| !a.is_read()) {
                    return Err(ScopeLoadError::ReadOnlyWithWrite {
                        layer_id: scope.layer_id.clone(),
                        action: *action,
                    });
                }
            }
            let places_orders = scope.allows(ActionKind::SubmitOrder) || scope.allows(ActionKind::CancelOrder);
            if places_orders && scope.max_autonomy < Autonomy::Execute {
                return Err(ScopeLoadError::ExecuteBeyondAutonomy(scope.layer_id.clone()));
            }
            if map.contains_key(&scope.layer_id) {
                return Err(ScopeLoadError::Duplicate(scope.layer_id.clone()));
            }
            map.insert(scope.layer_id.clone(), scope);
        }
        Ok(Self { scopes: map })
    }

    /// research → outlook → advisory → critic → risk_gate → execution
    pub fn default_pipeline() -> Self {
        use ActionKind::*;
        let scopes = vec![
            CapabilityScope::new("research", &[ReadMarketData, ReadMacroData, WriteResearchNote], false, Autonomy::Recommend),
            CapabilityScope::new("outlook", &[ReadMarketData, ReadMacroData, PublishOutlook], false, Autonomy::Recommend),
            CapabilityScope::new("advisory", &[ReadMarketData, RecommendTrade, ProposeOrder], false, Autonomy::Propose),
            CapabilityScope::new("critic", &[ReadMarketData, Critique], false, Autonomy::Recommend),
            CapabilityScope::new("risk_gate", &[ReadMarketData, EvaluateRisk], false, Autonomy::Propose),
            CapabilityScope::new("execution", &[SubmitOrder, CancelOrder], false, Autonomy::Execute),
        ];
        // the literal table above always satisfies the load rules
        Self::from_scopes(scopes).unwrap_or_default()
    }

    pub fn get(&self, layer_id: &str) -> Option<&CapabilityScope> {
        self.scopes.get(layer_id)
    }

    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(|k| k.as_str())
    }

    /// Pure check against static configuration.
    pub fn authorize(&self, layer_id: &str, action_kind: ActionKind) -> Result<(), ScopeViolation> {
        match self.scopes.get(layer_id) {
            None => Err(ScopeViolation::UnknownLayer {
                layer_id: layer_id.to_string(),
                action_kind,
            }),
            Some(scope) if scope.allows(action_kind) => Ok(()),
            Some(_) => Err(ScopeViolation::ActionNotAllowed {
                layer_id: layer_id.to_string(),
                action_kind,
            }),
        }
    }

    /// First violation in recording order, if any.
    pub fn authorize_all<'a, I>(&self, layer_id: &str, actions: I) -> Result<(), ScopeViolation>
    where
        I: IntoIterator<Item = &'a ActionKind>,
    {
        for action in actions {
            self.authorize(layer_id, *action)?;
        }
        Ok(())
    }
}
