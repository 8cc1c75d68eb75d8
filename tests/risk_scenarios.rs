//! Risk gate scenarios driven through full cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use govfx::auth::OperatorAuth;
use govfx::evidence::InputSnapshot;
use govfx::exec::{ExecConfig, ExecutionStateMachine, PaperVenue};
use govfx::kill_switch::KillSwitch;
use govfx::orchestrator::{CapabilitySet, Orchestrator};
use govfx::pipeline::{CycleInput, CycleSettings, Governor, DECISION_LAYERS, EXECUTION_LAYER, GATE_LAYER};
use govfx::registry::ModelRegistry;
use govfx::risk::{GateStatus, ReasonCode, RiskGate, RiskInputs, RiskLimits};
use govfx::scope::ScopeTable;

fn governor(dir: &tempfile::TempDir, limits: RiskLimits, ks: KillSwitch) -> Governor {
    let scopes = Arc::new(ScopeTable::default_pipeline());
    let registry = ModelRegistry::default_pipeline();
    let mut layers: Vec<&str> = DECISION_LAYERS.to_vec();
    layers.extend([GATE_LAYER, EXECUTION_LAYER]);
    let caps = CapabilitySet::from_registry(&registry, &layers, Duration::from_secs(1)).unwrap();
    let orchestrator = Orchestrator::new(scopes.clone(), Arc::new(registry), Arc::new(caps), Duration::from_secs(1))
        .with_kill_switch(ks.clone());
    let machine = ExecutionStateMachine::open(
        dir.path().join("orders.wal"),
        false,
        Arc::new(PaperVenue::new()),
        ks.clone(),
        ExecConfig::default(),
    )
    .unwrap();
    Governor::new(
        orchestrator,
        RiskGate::new(limits, scopes).with_kill_switch(ks),
        Arc::new(machine),
        None,
        CycleSettings { git_ref: "deadbeef".into(), symbol: "NQ".into(), auto_approve: true },
    )
}

fn cycle_input(now: DateTime<Utc>) -> CycleInput {
    CycleInput {
        snapshot: InputSnapshot::new(
            "paper",
            now,
            json!({
                "proposal": { "symbol": "NQ", "side": "BUY", "qty": 1 },
                "limits": { "max_order_qty": 1 },
            }),
        ),
        risk: RiskInputs {
            symbol: "NQ".into(),
            data_as_of: Some(now),
            equity: Some(250_000.0),
            exposure_notional: Some(0.0),
            realized_pnl_today: Some(0.0),
            unrealized_pnl: Some(0.0),
            trades_today: None,
            last_loss_at: None,
            spread_bps: Some(1.5),
            volatility: Some(0.01),
        },
    }
}

#[tokio::test]
async fn test_fourth_trade_of_the_day_is_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let limits = RiskLimits { max_trades_per_day: 3, ..RiskLimits::default() };
    let gov = governor(&dir, limits, KillSwitch::new(OperatorAuth::new("s")));

    let now = Utc::now();
    for i in 0..3 {
        let report = gov.run_cycle(&format!("run-{}", i), &cycle_input(now)).await;
        assert!(report.submitted(), "cycle {} halted: {:?}", i, report.halted);
    }

    let report = gov.run_cycle("run-3", &cycle_input(now)).await;
    let decision = report.decision.unwrap();
    assert_eq!(decision.status, GateStatus::Block);
    assert_eq!(decision.reason_strings(), vec!["MAX_TRADES_PER_DAY".to_string()]);
    assert_eq!(report.halted.as_deref(), Some("RISK_GATE_BLOCK"));
    assert_eq!(gov.machine().orders().await.len(), 3);
}

#[tokio::test]
async fn test_engaged_switch_blocks_before_any_layer_output() {
    let dir = tempfile::tempdir().unwrap();
    let ks = KillSwitch::new(OperatorAuth::new("s"));
    let gov = governor(&dir, RiskLimits::default(), ks.clone());
    ks.engage("pre-open halt");

    let now = Utc::now();
    let report = gov.run_cycle("run-0", &cycle_input(now)).await;
    assert_eq!(report.halted.as_deref(), Some("MODEL_CANCELLED"));
    assert!(report.packs.is_empty());
    assert!(gov.machine().orders().await.is_empty());
}

#[test]
fn test_every_unknown_input_blocks() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
    let gate = RiskGate::new(RiskLimits::default(), Arc::new(ScopeTable::default_pipeline()));
    let decision = gate.evaluate(&RiskInputs { symbol: "NQ".into(), ..Default::default() }, &[], now);
    assert_eq!(decision.status, GateStatus::Block);
    assert_eq!(
        decision.reasons,
        vec![
            ReasonCode::DataMissing,
            ReasonCode::ExposureUnavailable,
            ReasonCode::DailyLossUnavailable,
            ReasonCode::TradeCountUnavailable,
            ReasonCode::SpreadUnavailable,
            ReasonCode::UpstreamEvidenceMissing,
        ]
    );
}

#[test]
fn test_non_finite_inputs_block() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
    let limits = RiskLimits { required_upstream: vec![], ..RiskLimits::default() };
    let gate = RiskGate::new(limits, Arc::new(ScopeTable::default_pipeline()));
    let mut inputs = cycle_input(now).risk;
    inputs.trades_today = Some(0);
    inputs.equity = Some(f64::NAN);
    inputs.volatility = Some(f64::INFINITY);
    let decision = gate.evaluate(&inputs, &[], now);
    assert_eq!(
        decision.reasons,
        vec![ReasonCode::ExposureUnavailable, ReasonCode::VolatilityUnavailable]
    );
}

#[test]
fn test_same_inputs_same_decision() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
    let limits = RiskLimits { required_upstream: vec![], ..RiskLimits::default() };
    let gate = RiskGate::new(limits, Arc::new(ScopeTable::default_pipeline()));
    let mut inputs = cycle_input(now).risk;
    inputs.trades_today = Some(1);
    let a = gate.evaluate(&inputs, &[], now);
    let b = gate.evaluate(&inputs, &[], now);
    assert_eq!(a, b);
    assert_eq!(a.decision_hash(), b.decision_hash());
    assert!(a.is_allow());
}
