//! Opaque capability calls. The orchestrator only sees `Capability::invoke`;
//! timeboxing and cancellation are applied around it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cancel::CancellationToken;
use crate::error::InvocationError;
use crate::evidence::{Finding, LayerInputs, RecordedAction, Severity};
use crate::registry::{ModelProfile, ModelRegistry, ProfileKind};
use crate::scope::ActionKind;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawOutput {
    pub actions: Vec<RecordedAction>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, profile: &ModelProfile, inputs: &LayerInputs) -> Result<RawOutput, InvocationError>;
}

/// Run a capability under a deadline and a cancellation token. A cancelled
/// or expired call yields an error and never a partial output.
pub async fn invoke_timeboxed(
    capability: &dyn Capability,
    profile: &ModelProfile,
    inputs: &LayerInputs,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<RawOutput, InvocationError> {
    if cancel.is_cancelled() {
        return Err(InvocationError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(InvocationError::Cancelled),
        res = tokio::time::timeout(timeout, capability.invoke(profile, inputs)) => match res {
            Ok(inner) => inner,
            Err(_) => Err(InvocationError::Timeout(timeout.as_millis() as u64)),
        },
    }
}

// =============================================================================
// LLM call over HTTP
// =============================================================================

pub struct LlmCall {
    client: reqwest::Client,
    endpoint: url::Url,
    model: String,
}

impl LlmCall {
    pub fn new(endpoint: &str, model: &str, request_timeout: Duration) -> Result<Self> {
        let endpoint = url::Url::parse(endpoint).map_err(|e| anyhow!("invalid endpoint {}: {}", endpoint, e))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!("endpoint {} must be http(s)", endpoint));
        }
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, endpoint, model: model.to_string() })
    }
}

#[async_trait]
impl Capability for LlmCall {
    async fn invoke(&self, profile: &ModelProfile, inputs: &LayerInputs) -> Result<RawOutput, InvocationError> {
        let body = json!({
            "model": self.model,
            "layer_id": profile.layer_id,
            "capabilities": profile.capabilities,
            "inputs": inputs,
        });
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvocationError::Timeout(0)
                } else {
                    InvocationError::Failed(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(InvocationError::Failed(format!("{}: {}", status, text)));
        }
        resp.json::<RawOutput>()
            .await
            .map_err(|e| InvocationError::Malformed(e.to_string()))
    }
}

// =============================================================================
// Deterministic algorithms
// =============================================================================

type AlgorithmFn = dyn Fn(&ModelProfile, &LayerInputs) -> Result<RawOutput, InvocationError> + Send + Sync;

pub struct DeterministicAlgorithm {
    name: String,
    func: Arc<AlgorithmFn>,
}

impl DeterministicAlgorithm {
    pub fn from_fn<F>(name: &str, f: F) -> Self
    where
        F: Fn(&ModelProfile, &LayerInputs) -> Result<RawOutput, InvocationError> + Send + Sync + 'static,
    {
        Self { name: name.to_string(), func: Arc::new(f) }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "summarize" => Some(Self::from_fn(name, summarize)),
            "relay_proposal" => Some(Self::from_fn(name, relay_proposal)),
            "critique" => Some(Self::from_fn(name, critique)),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Capability for DeterministicAlgorithm {
    async fn invoke(&self, profile: &ModelProfile, inputs: &LayerInputs) -> Result<RawOutput, InvocationError> {
        (self.func)(profile, inputs)
    }
}

fn read_action(profile: &ModelProfile) -> Option<RecordedAction> {
    profile
        .capabilities
        .contains(&ActionKind::ReadMarketData)
        .then(|| RecordedAction::new(ActionKind::ReadMarketData, Value::Null))
}

fn primary_action(profile: &ModelProfile) -> Option<ActionKind> {
    profile.capabilities.iter().copied().find(|a| !a.is_read())
}

/// Records what was read and the layer's primary action with a digest-level summary.
fn summarize(profile: &ModelProfile, inputs: &LayerInputs) -> Result<RawOutput, InvocationError> {
    let mut keys: Vec<&String> = match &inputs.snapshot.data {
        Value::Object(map) => map.keys().collect(),
        _ => Vec::new(),
    };
    keys.sort();
    let upstream: Vec<&str> = inputs.upstream.iter().map(|u| u.layer_id.as_str()).collect();
    let mut actions: Vec<RecordedAction> = read_action(profile).into_iter().collect();
    if let Some(kind) = primary_action(profile) {
        actions.push(RecordedAction::new(kind, json!({ "snapshot_digest": inputs.snapshot.digest() })));
    }
    Ok(RawOutput {
        actions,
        payload: json!({
            "source": inputs.snapshot.source,
            "fields": keys,
            "upstream": upstream,
        }),
        findings: Vec::new(),
    })
}

/// Copies an operator- or data-supplied `proposal` into a PROPOSE_ORDER action.
fn relay_proposal(profile: &ModelProfile, inputs: &LayerInputs) -> Result<RawOutput, InvocationError> {
    let mut actions: Vec<RecordedAction> = read_action(profile).into_iter().collect();
    let mut findings = Vec::new();
    let proposal = inputs.snapshot.data.get("proposal").cloned().unwrap_or(Value::Null);
    if proposal.is_object() {
        actions.push(RecordedAction::new(ActionKind::RecommendTrade, proposal.clone()));
        actions.push(RecordedAction::new(ActionKind::ProposeOrder, proposal.clone()));
    } else {
        actions.push(RecordedAction::new(ActionKind::RecommendTrade, json!({ "action": "HOLD" })));
        findings.push(Finding::new("NO_PROPOSAL", Severity::Info, "no proposal in inputs"));
    }
    Ok(RawOutput { actions, payload: json!({ "proposal": proposal }), findings })
}

/// Governance critique: compares a proposal against declared limits.
fn critique(profile: &ModelProfile, inputs: &LayerInputs) -> Result<RawOutput, InvocationError> {
    let data = &inputs.snapshot.data;
    let mut findings = Vec::new();
    let qty = data.pointer("/proposal/qty").and_then(|v| v.as_f64());
    let max_qty = data.pointer("/limits/max_order_qty").and_then(|v| v.as_f64());
    match (qty, max_qty) {
        (Some(q), Some(m)) if q > m => findings.push(Finding::new(
            "QTY_ABOVE_LIMIT",
            Severity::Blocking,
            &format!("proposed qty {} exceeds limit {}", q, m),
        )),
        (Some(q), _) if !(q.is_finite() && q > 0.0) => {
            findings.push(Finding::new("QTY_INVALID", Severity::Blocking, "proposed qty must be positive"))
        }
        (Some(_), None) => findings.push(Finding::new("LIMITS_MISSING", Severity::Warn, "no max_order_qty declared")),
        _ => {}
    }
    let mut actions: Vec<RecordedAction> = read_action(profile).into_iter().collect();
    actions.push(RecordedAction::new(ActionKind::Critique, json!({ "findings": findings.len() })));
    Ok(RawOutput { actions, payload: json!({ "reviewed": qty.is_some() }), findings })
}

// =============================================================================
// Human approval stub
// =============================================================================

/// Pre-recorded approval. Approves when configured to, or when the inputs
/// carry `approval.approved = true`.
pub struct HumanApprovalStub {
    approver: String,
    auto_approve: bool,
}

impl HumanApprovalStub {
    pub fn new(approver: &str, auto_approve: bool) -> Self {
        Self { approver: approver.to_string(), auto_approve }
    }
}

#[async_trait]
impl Capability for HumanApprovalStub {
    async fn invoke(&self, profile: &ModelProfile, inputs: &LayerInputs) -> Result<RawOutput, InvocationError> {
        let recorded = inputs
            .snapshot
            .data
            .pointer("/approval/approved")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let approved = self.auto_approve || recorded;
        let mut actions = Vec::new();
        let mut findings = Vec::new();
        if approved {
            if let Some(kind) = primary_action(profile) {
                actions.push(RecordedAction::new(kind, json!({ "approver": self.approver })));
            }
        } else {
            findings.push(Finding::new("NOT_APPROVED", Severity::Blocking, "no recorded approval"));
        }
        Ok(RawOutput {
            actions,
            payload: json!({ "approver": self.approver, "approved": approved }),
            findings,
        })
    }
}

// =============================================================================
// Binding profiles to capabilities
// =============================================================================

#[derive(Default, Clone)]
pub struct CapabilitySet {
    by_profile: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One capability per registered profile, built from its declared kind.
    pub fn from_registry(registry: &ModelRegistry, layers: &[&str], llm_timeout: Duration) -> Result<Self> {
        let mut set = Self::new();
        for layer in layers {
            for profile in registry.candidates(layer) {
                let cap: Arc<dyn Capability> = match &profile.kind {
                    ProfileKind::LlmCall { endpoint, model } => Arc::new(LlmCall::new(endpoint, model, llm_timeout)?),
                    ProfileKind::DeterministicAlgorithm { algorithm } => Arc::new(
                        DeterministicAlgorithm::builtin(algorithm)
                            .ok_or_else(|| anyhow!("unknown algorithm {} for {}", algorithm, profile.model_id))?,
                    ),
                    ProfileKind::HumanApprovalStub { approver } => Arc::new(HumanApprovalStub::new(approver, false)),
                };
                set.insert(profile, cap);
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, profile: &ModelProfile, capability: Arc<dyn Capability>) {
        self.by_profile.insert(profile.qualified_id(), capability);
    }

    pub fn get(&self, profile: &ModelProfile) -> Option<Arc<dyn Capability>> {
        self.by_profile.get(&profile.qualified_id()).cloned()
    }
}
