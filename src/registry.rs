//! Model registry: candidate capability profiles per layer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::scope::{ActionKind, Autonomy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileKind {
    LlmCall { endpoint: String, model: String },
    DeterministicAlgorithm { algorithm: String },
    HumanApprovalStub { approver: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model_id: String,
    pub version: String,
    pub layer_id: String,
    /// Higher wins.
    pub priority: u32,
    pub autonomy: Autonomy,
    pub capabilities: BTreeSet<ActionKind>,
    pub kind: ProfileKind,
}

impl ModelProfile {
    pub fn deterministic(layer_id: &str, model_id: &str, algorithm: &str, priority: u32, autonomy: Autonomy, caps: &[ActionKind]) -> Self {
        Self {
            model_id: model_id.to_string(),
            version: "1".to_string(),
            layer_id: layer_id.to_string(),
            priority,
            autonomy,
            capabilities: caps.iter().copied().collect(),
            kind: ProfileKind::DeterministicAlgorithm { algorithm: algorithm.to_string() },
        }
    }

    /// `model_id@version`, the identifier recorded in evidence packs.
    pub fn qualified_id(&self) -> String {
        format!("{}@{}", self.model_id, self.version)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    by_layer: BTreeMap<String, Vec<ModelProfile>>,
}

impl ModelRegistry {
    pub fn from_profiles(profiles: Vec<ModelProfile>) -> Self {
        let mut by_layer: BTreeMap<String, Vec<ModelProfile>> = BTreeMap::new();
        for p in profiles {
            by_layer.entry(p.layer_id.clone()).or_default().push(p);
        }
        for list in by_layer.values_mut() {
            list.sort_by(|a, b| a.model_id.cmp(&b.model_id).then(a.version.cmp(&b.version)));
        }
        Self { by_layer }
    }

    pub fn candidates(&self, layer_id: &str) -> &[ModelProfile] {
        self.by_layer.get(layer_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_layer.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic built-ins for every default layer; no network required.
    pub fn default_pipeline() -> Self {
        use ActionKind::*;
        Self::from_profiles(vec![
            ModelProfile::deterministic("research", "digest-summarizer", "summarize", 10, Autonomy::Recommend, &[ReadMarketData, WriteResearchNote]),
            ModelProfile::deterministic("outlook", "outlook-rules", "summarize", 10, Autonomy::Recommend, &[ReadMarketData, PublishOutlook]),
            ModelProfile::deterministic("advisory", "proposal-relay", "relay_proposal", 10, Autonomy::Propose, &[ReadMarketData, RecommendTrade, ProposeOrder]),
            ModelProfile::deterministic("critic", "limits-critic", "critique", 10, Autonomy::Recommend, &[ReadMarketData, Critique]),
            ModelProfile::deterministic("risk_gate", "risk-evaluator", "summarize", 10, Autonomy::Propose, &[EvaluateRisk]),
            ModelProfile {
                model_id: "operator-approval".to_string(),
                version: "1".to_string(),
                layer_id: "execution".to_string(),
                priority: 10,
                autonomy: Autonomy::Execute,
                capabilities: [SubmitOrder].into_iter().collect(),
                kind: ProfileKind::HumanApprovalStub { approver: "desk".to_string() },
            },
        ])
    }
}
