//! Layer orchestration: pick a profile for a layer, run it as an opaque
//! timeboxed call, and turn the result into a validated evidence pack.
//!
//! The orchestrator never writes execution state. A failed layer yields a
//! [`LayerRunError`] and no pack; the orchestrator itself stays usable.

pub mod invoke;
pub mod pool;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::cancel::CancellationToken;
use crate::error::{LayerRunCause, LayerRunError};
use crate::evidence::{schema, EvidenceArena, EvidencePack, InputSnapshot, LayerInputs, LayerOutputs, PackDraft};
use crate::kill_switch::KillSwitch;
use crate::logging::{log_layer_run, log_profile_selected, log_run_error};
use crate::registry::{ModelProfile, ModelRegistry};
use crate::scope::{CapabilityScope, ScopeTable};

pub use invoke::{Capability, CapabilitySet, DeterministicAlgorithm, HumanApprovalStub, LlmCall, RawOutput};
pub use pool::WorkerPool;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub layer_id: String,
    pub run_reason: String,
    pub profile: ModelProfile,
    pub scope: CapabilityScope,
}

/// Per-run mutable state. Each run owns its own session; concurrent runs
/// share nothing mutable.
#[derive(Debug)]
pub struct RunSession {
    run_id: String,
    git_ref: String,
    seq: u64,
    last_created_at: Option<DateTime<Utc>>,
    arena: EvidenceArena,
    errors: Vec<LayerRunError>,
}

impl RunSession {
    pub fn new(run_id: &str, git_ref: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            git_ref: git_ref.to_string(),
            seq: 0,
            last_created_at: None,
            arena: EvidenceArena::new(),
            errors: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn arena(&self) -> &EvidenceArena {
        &self.arena
    }

    pub fn errors(&self) -> &[LayerRunError] {
        &self.errors
    }

    /// Non-superseded packs in creation order.
    pub fn packs(&self) -> Vec<EvidencePack> {
        self.arena.heads().into_iter().cloned().collect()
    }

    /// Strictly increasing within the run even if the wall clock steps back.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_created_at {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_created_at = Some(ts);
        ts
    }
}

/// Result of chaining several layers within one run.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub packs: Vec<EvidencePack>,
    pub error: Option<LayerRunError>,
}

impl PipelineOutcome {
    pub fn completed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    scopes: Arc<ScopeTable>,
    registry: Arc<ModelRegistry>,
    capabilities: Arc<CapabilitySet>,
    invoke_timeout: Duration,
    kill_switch: Option<KillSwitch>,
}

impl Orchestrator {
    pub fn new(
        scopes: Arc<ScopeTable>,
        registry: Arc<ModelRegistry>,
        capabilities: Arc<CapabilitySet>,
        invoke_timeout: Duration,
    ) -> Self {
        Self { scopes, registry, capabilities, invoke_timeout, kill_switch: None }
    }

    /// Engaging the switch cancels in-flight capability calls.
    pub fn with_kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn scopes(&self) -> &Arc<ScopeTable> {
        &self.scopes
    }

    fn cancel_token(&self) -> CancellationToken {
        self.kill_switch
            .as_ref()
            .map(|ks| ks.cancel_token())
            .unwrap_or_default()
    }

    /// Highest priority among profiles that fit inside the layer's scope;
    /// ties go to the lexicographically smallest `model_id`.
    pub fn select_profile(&self, layer_id: &str, run_reason: &str) -> Result<ModelSelection, LayerRunError> {
        let scope = self
            .scopes
            .get(layer_id)
            .ok_or_else(|| LayerRunError::new(layer_id, LayerRunCause::UnknownLayer))?;
        let candidates = self.registry.candidates(layer_id);
        let chosen = candidates
            .iter()
            .filter(|p| p.autonomy <= scope.max_autonomy)
            .filter(|p| p.capabilities.is_subset(&scope.allowed_actions))
            .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.model_id.cmp(&a.model_id)))
            .ok_or_else(|| LayerRunError::new(layer_id, LayerRunCause::NoEligibleProfile))?;
        log_profile_selected(layer_id, run_reason, &chosen.qualified_id(), chosen.priority, candidates.len());
        Ok(ModelSelection {
            layer_id: layer_id.to_string(),
            run_reason: run_reason.to_string(),
            profile: chosen.clone(),
            scope: scope.clone(),
        })
    }

    pub async fn run_layer(
        &self,
        session: &mut RunSession,
        selection: &ModelSelection,
        inputs: &LayerInputs,
    ) -> Result<EvidencePack, LayerRunError> {
        let result = self.run_layer_inner(session, selection, inputs).await;
        if let Err(err) = &result {
            log_run_error(&session.run_id, &err.layer_id, err.reason_code(), &err.cause.to_string());
            session.errors.push(err.clone());
        }
        result
    }

    async fn run_layer_inner(
        &self,
        session: &mut RunSession,
        selection: &ModelSelection,
        inputs: &LayerInputs,
    ) -> Result<EvidencePack, LayerRunError> {
        let layer_id = selection.layer_id.as_str();
        let started = Instant::now();
        let capability = self.capabilities.get(&selection.profile).ok_or_else(|| {
            LayerRunError::new(
                layer_id,
                crate::error::InvocationError::Failed(format!("no capability bound to {}", selection.profile.qualified_id())),
            )
        })?;

        let raw = invoke::invoke_timeboxed(
            capability.as_ref(),
            &selection.profile,
            inputs,
            self.invoke_timeout,
            &self.cancel_token(),
        )
        .await
        .map_err(|e| LayerRunError::new(layer_id, e))?;

        // Checked against the table loaded now, not the copy in the selection.
        let actions: Vec<_> = raw.actions.iter().map(|a| &a.kind).collect();
        self.scopes
            .authorize_all(layer_id, actions)
            .map_err(|v| LayerRunError::new(layer_id, v))?;

        let draft = PackDraft {
            layer_id: layer_id.to_string(),
            run_id: session.run_id.clone(),
            git_ref: session.git_ref.clone(),
            model_id: selection.profile.qualified_id(),
            inputs_digest: inputs.digest(),
            outputs: LayerOutputs { actions: raw.actions, payload: raw.payload },
            capability_scope_ref: selection.scope.scope_ref(),
            findings: raw.findings,
            supersedes: None,
        };
        let created_at = session.next_created_at();
        let pack = draft
            .finalize(created_at, session.seq)
            .map_err(|e| LayerRunError::new(layer_id, e))?;
        schema::validate(&pack).map_err(|e| LayerRunError::new(layer_id, e))?;
        session
            .arena
            .append(pack.clone())
            .map_err(|e| LayerRunError::new(layer_id, LayerRunCause::Store(e.to_string())))?;
        session.seq += 1;

        log_layer_run(
            &session.run_id,
            layer_id,
            pack.pack_id(),
            pack.determinism_hash(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(pack)
    }

    /// Runs `layers` in order against one snapshot. Each layer sees the
    /// determinism hashes of every pack produced before it in this run.
    /// Stops at the first failing layer.
    pub async fn run_pipeline(
        &self,
        session: &mut RunSession,
        layers: &[&str],
        snapshot: &InputSnapshot,
        run_reason: &str,
    ) -> PipelineOutcome {
        let mut packs: Vec<EvidencePack> = Vec::new();
        for layer_id in layers {
            let mut inputs = LayerInputs::new(snapshot.clone());
            for p in session.arena.heads() {
                inputs = inputs.with_upstream(p.layer_id(), p.determinism_hash());
            }
            let step = match self.select_profile(layer_id, run_reason) {
                Ok(selection) => self.run_layer(session, &selection, &inputs).await,
                Err(e) => {
                    log_run_error(&session.run_id, layer_id, e.reason_code(), &e.cause.to_string());
                    session.errors.push(e.clone());
                    Err(e)
                }
            };
            match step {
                Ok(pack) => packs.push(pack),
                Err(e) => return PipelineOutcome { packs, error: Some(e) },
            }
        }
        PipelineOutcome { packs, error: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OperatorAuth;
    use crate::error::InvocationError;
    use crate::evidence::RecordedAction;
    use crate::scope::{ActionKind, Autonomy};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn orchestrator_with(profiles: Vec<ModelProfile>, caps: Vec<(usize, Arc<dyn Capability>)>) -> Orchestrator {
        let mut set = CapabilitySet::new();
        for (i, cap) in caps {
            set.insert(&profiles[i], cap);
        }
        Orchestrator::new(
            Arc::new(ScopeTable::default_pipeline()),
            Arc::new(ModelRegistry::from_profiles(profiles)),
            Arc::new(set),
            Duration::from_millis(200),
        )
    }

    fn default_orchestrator() -> Orchestrator {
        let registry = ModelRegistry::default_pipeline();
        let layers: Vec<&str> = vec!["research", "outlook", "advisory", "critic", "risk_gate", "execution"];
        let caps = CapabilitySet::from_registry(&registry, &layers, Duration::from_secs(1)).unwrap();
        Orchestrator::new(
            Arc::new(ScopeTable::default_pipeline()),
            Arc::new(registry),
            Arc::new(caps),
            Duration::from_millis(200),
        )
    }

    fn snapshot() -> InputSnapshot {
        InputSnapshot::new("md", Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap(), json!({"symbol": "NQ"}))
    }

    struct Emits(Vec<ActionKind>);

    #[async_trait]
    impl Capability for Emits {
        async fn invoke(&self, _p: &ModelProfile, _i: &LayerInputs) -> Result<RawOutput, InvocationError> {
            Ok(RawOutput {
                actions: self.0.iter().map(|k| RecordedAction::new(*k, Value::Null)).collect(),
                payload: json!({}),
                findings: vec![],
            })
        }
    }

    #[test]
    fn test_selection_prefers_priority_then_smallest_id() {
        use ActionKind::*;
        let orch = orchestrator_with(
            vec![
                ModelProfile::deterministic("research", "zulu", "summarize", 5, Autonomy::Recommend, &[ReadMarketData]),
                ModelProfile::deterministic("research", "bravo", "summarize", 5, Autonomy::Recommend, &[ReadMarketData]),
                ModelProfile::deterministic("research", "alpha", "summarize", 1, Autonomy::Recommend, &[ReadMarketData]),
                // would win on priority but exceeds the scope
                ModelProfile::deterministic("research", "aaa", "summarize", 99, Autonomy::Recommend, &[SubmitOrder]),
                ModelProfile::deterministic("research", "aab", "summarize", 99, Autonomy::Execute, &[ReadMarketData]),
            ],
            vec![],
        );
        let sel = orch.select_profile("research", "scheduled").unwrap();
        assert_eq!(sel.profile.model_id, "bravo");
    }

    #[test]
    fn test_no_eligible_profile() {
        let orch = orchestrator_with(vec![], vec![]);
        let err = orch.select_profile("research", "r").unwrap_err();
        assert_eq!(err.reason_code(), "NO_ELIGIBLE_PROFILE");
        let err = orch.select_profile("nowhere", "r").unwrap_err();
        assert_eq!(err.reason_code(), "UNKNOWN_LAYER");
    }

    #[tokio::test]
    async fn test_out_of_scope_action_emits_no_pack() {
        use ActionKind::*;
        let profiles = vec![ModelProfile::deterministic("research", "rogue", "-", 1, Autonomy::Recommend, &[ReadMarketData])];
        let orch = orchestrator_with(profiles, vec![(0, Arc::new(Emits(vec![ReadMarketData, SubmitOrder])))]);
        let mut session = RunSession::new("run-1", "abc");
        let sel = orch.select_profile("research", "r").unwrap();
        let err = orch
            .run_layer(&mut session, &sel, &LayerInputs::new(snapshot()))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "SCOPE_VIOLATION");
        assert!(session.arena().is_empty());
        assert_eq!(session.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_is_deterministic_across_runs() {
        let orch = default_orchestrator();
        let layers = ["research", "outlook", "advisory", "critic"];
        let mut a = RunSession::new("run-a", "abc");
        let mut b = RunSession::new("run-b", "abc");
        let out_a = orch.run_pipeline(&mut a, &layers, &snapshot(), "test").await;
        let out_b = orch.run_pipeline(&mut b, &layers, &snapshot(), "test").await;
        assert!(out_a.completed() && out_b.completed());
        let ha: Vec<_> = out_a.packs.iter().map(|p| p.determinism_hash().to_string()).collect();
        let hb: Vec<_> = out_b.packs.iter().map(|p| p.determinism_hash().to_string()).collect();
        assert_eq!(ha, hb);
        assert_ne!(out_a.packs[0].pack_id(), out_b.packs[0].pack_id());
    }

    #[tokio::test]
    async fn test_created_at_is_monotonic_within_run() {
        let orch = default_orchestrator();
        let mut s = RunSession::new("run-m", "abc");
        let out = orch.run_pipeline(&mut s, &["research", "outlook", "advisory"], &snapshot(), "t").await;
        let ts: Vec<_> = out.packs.iter().map(|p| p.created_at()).collect();
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_engaged_switch_cancels_layer() {
        let ks = KillSwitch::new(OperatorAuth::new("s"));
        let orch = default_orchestrator().with_kill_switch(ks.clone());
        ks.engage("halt");
        let mut s = RunSession::new("run-k", "abc");
        let out = orch.run_pipeline(&mut s, &["research"], &snapshot(), "t").await;
        assert_eq!(out.error.map(|e| e.reason_code()), Some("MODEL_CANCELLED"));
        assert!(out.packs.is_empty());
    }

    #[tokio::test]
    async fn test_orchestrator_usable_after_failure() {
        let orch = default_orchestrator();
        let mut s = RunSession::new("run-x", "abc");
        let bad = orch.run_pipeline(&mut s, &["nowhere"], &snapshot(), "t").await;
        assert!(!bad.completed());
        let good = orch.run_pipeline(&mut s, &["research"], &snapshot(), "t").await;
        assert!(good.completed());
    }
}
