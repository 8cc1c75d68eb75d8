//! Scope containment: whatever a capability emits, a stored pack never
//! carries an action outside its layer's scope.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use govfx::error::InvocationError;
use govfx::evidence::{schema, InputSnapshot, LayerInputs, RecordedAction};
use govfx::orchestrator::{CapabilitySet, DeterministicAlgorithm, Orchestrator, RawOutput, RunSession};
use govfx::registry::{ModelProfile, ModelRegistry};
use govfx::scope::{ActionKind, Autonomy, ScopeTable};

const LAYERS: [&str; 6] = ["research", "outlook", "advisory", "critic", "risk_gate", "execution"];

fn arb_action() -> impl Strategy<Value = ActionKind> {
    prop::sample::select(ActionKind::ALL.to_vec())
}

fn arb_layer() -> impl Strategy<Value = &'static str> {
    prop::sample::select(LAYERS.to_vec())
}

/// A profile that claims nothing, bound to a capability emitting `emitted`.
fn orchestrator_emitting(layer: &str, emitted: Vec<ActionKind>) -> Orchestrator {
    let profile = ModelProfile::deterministic(layer, "emitter", "emit", 1, Autonomy::ReadOnly, &[]);
    let mut caps = CapabilitySet::new();
    caps.insert(
        &profile,
        Arc::new(DeterministicAlgorithm::from_fn(
            "emit",
            move |_p: &ModelProfile, _i: &LayerInputs| -> Result<RawOutput, InvocationError> {
                Ok(RawOutput {
                    actions: emitted.iter().map(|k| RecordedAction::new(*k, json!(null))).collect(),
                    payload: json!({ "n": emitted.len() }),
                    findings: vec![],
                })
            },
        )),
    );
    Orchestrator::new(
        Arc::new(ScopeTable::default_pipeline()),
        Arc::new(ModelRegistry::from_profiles(vec![profile])),
        Arc::new(caps),
        Duration::from_secs(1),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_authorize_all_matches_allowed_set(
        layer in arb_layer(),
        actions in prop::collection::vec(arb_action(), 0..8),
    ) {
        let table = ScopeTable::default_pipeline();
        let scope = table.get(layer).unwrap();
        let allowed = actions.iter().all(|a| scope.allowed_actions.contains(a));
        prop_assert_eq!(table.authorize_all(layer, actions.iter()).is_ok(), allowed);
    }

    #[test]
    fn prop_unknown_layer_never_authorized(action in arb_action(), layer in "[a-z]{1,6}_x") {
        let table = ScopeTable::default_pipeline();
        prop_assert!(table.authorize(&layer, action).is_err());
    }

    #[test]
    fn prop_packs_stay_inside_scope(
        layer in arb_layer(),
        emitted in prop::collection::vec(arb_action(), 0..6),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        let orch = orchestrator_emitting(layer, emitted.clone());
        let table = ScopeTable::default_pipeline();
        let scope = table.get(layer).unwrap().clone();
        let snapshot = InputSnapshot::new(
            "prop",
            Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap(),
            json!({ "x": 1 }),
        );

        let mut session = RunSession::new("run-p", "deadbeef");
        let out = rt.block_on(orch.run_pipeline(&mut session, &[layer], &snapshot, "prop"));
        let within = emitted.iter().all(|a| scope.allowed_actions.contains(a));

        prop_assert_eq!(out.completed(), within);
        for pack in session.arena().iter() {
            prop_assert!(schema::check_scope(pack, &table).is_ok());
            prop_assert!(pack.outputs().actions.iter().all(|a| scope.allowed_actions.contains(&a.kind)));
        }
        if !within {
            prop_assert!(session.arena().is_empty());
            prop_assert_eq!(out.error.unwrap().reason_code(), "SCOPE_VIOLATION");
        }
    }
}
