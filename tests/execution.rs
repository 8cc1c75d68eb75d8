//! Execution state machine against the paper venue: idempotent submission,
//! crash recovery through the order journal, and kill-switch precedence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use govfx::auth::OperatorAuth;
use govfx::error::{ExecError, VenueError};
use govfx::exec::{
    reconcile_once, ExecConfig, ExecutionStateMachine, Order, OrderSpec, OrderState, PaperVenue, ReconcileMode,
    RetryConfig, Side, VenueAdapter,
};
use govfx::exec::venue::OrderRequest;
use govfx::kill_switch::{KillSwitch, ACTION_RESET};
use govfx::risk::{GateStatus, RiskGateDecision};
use govfx::wal::{OrderJournal, WalEntry};

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn allow_at(as_of: DateTime<Utc>) -> RiskGateDecision {
    RiskGateDecision {
        gate_id: "gate-1".to_string(),
        status: GateStatus::Allow,
        reasons: vec![],
        as_of_utc: as_of,
        inputs_snapshot_digest: "digest-1".to_string(),
    }
}

fn spec(qty: f64) -> OrderSpec {
    OrderSpec { symbol: "NQ".to_string(), side: Side::Buy, qty, limit_price: None }
}

fn fast_retry(max_retries: u32) -> ExecConfig {
    ExecConfig {
        retry: RetryConfig { max_retries, base_delay_ms: 20, max_delay_ms: 40, jitter_factor: 0.0 },
        ..ExecConfig::default()
    }
}

fn machine_at(
    path: &std::path::Path,
    venue: Arc<PaperVenue>,
    ks: KillSwitch,
    config: ExecConfig,
) -> ExecutionStateMachine {
    let venue: Arc<dyn VenueAdapter> = venue;
    ExecutionStateMachine::open(path, false, venue, ks, config).unwrap()
}

async fn validated(machine: &ExecutionStateMachine, qty: f64) -> String {
    let t = now();
    let decision = allow_at(t);
    let coid = machine.create_intent(&decision, spec(qty), json!({"max_trades_per_day": 3})).await.unwrap();
    machine.validate(&coid, &decision, "digest-1", t).await.unwrap();
    coid
}

#[tokio::test]
async fn test_submit_twice_reaches_venue_once() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(PaperVenue::new());
    let machine = machine_at(&dir.path().join("orders.wal"), venue.clone(), KillSwitch::new(OperatorAuth::new("s")), fast_retry(2));

    let coid = validated(&machine, 1.0).await;
    assert_eq!(machine.submit(&coid).await.unwrap(), OrderState::Open);
    assert_eq!(machine.submit(&coid).await.unwrap(), OrderState::Open);
    assert_eq!(venue.submit_calls(&coid), 1);
    assert_eq!(venue.order_count(&coid), 1);
}

#[tokio::test]
async fn test_timeout_after_accept_does_not_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(PaperVenue::new());
    venue.script_submit(govfx::exec::Scripted::AcceptThenTimeout);
    let machine = machine_at(&dir.path().join("orders.wal"), venue.clone(), KillSwitch::new(OperatorAuth::new("s")), fast_retry(2));

    let coid = validated(&machine, 1.0).await;
    // the retry lands on the order the venue already holds
    assert_eq!(machine.submit(&coid).await.unwrap(), OrderState::Open);
    assert_eq!(venue.order_count(&coid), 1);
    assert_eq!(venue.submit_calls(&coid), 2);
}

#[tokio::test]
async fn test_crash_while_submitted_converges_in_one_pass() {
    let dir = tempfile::tempdir().unwrap();
    let wal = dir.path().join("orders.wal");
    let venue = Arc::new(PaperVenue::new());

    // journal as a crashed process left it: two orders SUBMITTED, only one
    // of which ever reached the venue
    {
        let mut journal = OrderJournal::open(&wal, false).unwrap();
        for (i, coid) in ["gfx-reached", "gfx-lost"].iter().enumerate() {
            let mut order = Order::new(coid, spec(1.0), "gate-1", "digest-1", json!({}), now());
            order.state = OrderState::Submitted;
            order.submitted_at = Some(now());
            order.revision = 3;
            journal
                .append_entry(&WalEntry::Revision {
                    ts: i as u64,
                    client_order_id: coid.to_string(),
                    revision: 3,
                    event: "submit".to_string(),
                    source: "pipeline".to_string(),
                    order,
                })
                .unwrap();
        }
    }
    venue
        .submit(&OrderRequest { client_order_id: "gfx-reached".to_string(), spec: spec(1.0) })
        .await
        .unwrap();
    venue.fill("gfx-reached", 1.0);

    let machine = machine_at(&wal, venue.clone(), KillSwitch::new(OperatorAuth::new("s")), fast_retry(0));
    let first = reconcile_once(&machine, ReconcileMode::Startup).await;
    assert_eq!(first.checked, 2);
    assert!(first.errors.is_empty());
    assert_eq!(machine.get("gfx-reached").await.unwrap().state, OrderState::Filled);
    assert_eq!(machine.get("gfx-lost").await.unwrap().state, OrderState::Canceled);

    // nothing left to do on the next pass
    let second = reconcile_once(&machine, ReconcileMode::Periodic).await;
    assert_eq!(second.checked, 0);

    // and the converged states survive another restart
    drop(machine);
    let recovered = OrderJournal::recover(&wal).unwrap();
    assert_eq!(recovered.orders["gfx-reached"].state, OrderState::Filled);
    assert_eq!(recovered.orders["gfx-lost"].state, OrderState::Canceled);
}

#[tokio::test]
async fn test_transient_query_timeout_leaves_open_order_open() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(PaperVenue::new());
    let machine = machine_at(&dir.path().join("orders.wal"), venue.clone(), KillSwitch::new(OperatorAuth::new("s")), fast_retry(3));
    let coid = validated(&machine, 1.0).await;
    assert_eq!(machine.submit(&coid).await.unwrap(), OrderState::Open);

    venue.script_query(VenueError::Timeout);
    let report = reconcile_once(&machine, ReconcileMode::Periodic).await;
    assert!(report.unknown.is_empty());
    assert!(report.errors.is_empty());
    assert_eq!(machine.get(&coid).await.unwrap().state, OrderState::Open);

    // a fill seen on the retried query is still applied
    venue.script_query(VenueError::Unavailable("503".into()));
    venue.fill(&coid, 1.0);
    reconcile_once(&machine, ReconcileMode::Periodic).await;
    assert_eq!(machine.get(&coid).await.unwrap().state, OrderState::Filled);
}

#[tokio::test]
async fn test_exhausted_query_budget_marks_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(PaperVenue::new());
    let machine = machine_at(&dir.path().join("orders.wal"), venue.clone(), KillSwitch::new(OperatorAuth::new("s")), fast_retry(1));
    let coid = validated(&machine, 1.0).await;
    machine.submit(&coid).await.unwrap();

    venue.script_query(VenueError::Timeout);
    venue.script_query(VenueError::Timeout);
    let report = reconcile_once(&machine, ReconcileMode::Periodic).await;
    assert_eq!(report.unknown, vec![coid.clone()]);
    assert_eq!(machine.get(&coid).await.unwrap().state, OrderState::Unknown);
}

#[tokio::test]
async fn test_journal_with_torn_tail_keeps_orders_written_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let wal = dir.path().join("orders.wal");
    let venue = Arc::new(PaperVenue::new());
    let first = {
        let machine = machine_at(&wal, venue.clone(), KillSwitch::new(OperatorAuth::new("s")), fast_retry(0));
        validated(&machine, 1.0).await
    };
    // the process died halfway through its next line
    let mut raw = std::fs::OpenOptions::new().append(true).open(&wal).unwrap();
    std::io::Write::write_all(&mut raw, b"{\"operation\":\"revision\",\"ts\":17").unwrap();
    drop(raw);

    let machine = machine_at(&wal, venue.clone(), KillSwitch::new(OperatorAuth::new("s")), fast_retry(0));
    assert_eq!(machine.get(&first).await.unwrap().state, OrderState::Validated);
    let second = validated(&machine, 2.0).await;
    drop(machine);

    let recovered = OrderJournal::recover(&wal).unwrap();
    assert_eq!(recovered.skipped_lines, 0);
    assert_eq!(recovered.orders[&first].state, OrderState::Validated);
    assert_eq!(recovered.orders[&second].state, OrderState::Validated);
}

#[tokio::test]
async fn test_kill_switch_refuses_validation() {
    let dir = tempfile::tempdir().unwrap();
    let auth = OperatorAuth::new("desk-secret");
    let ks = KillSwitch::new(auth.clone());
    let machine = machine_at(&dir.path().join("orders.wal"), Arc::new(PaperVenue::new()), ks.clone(), fast_retry(0));

    let t = now();
    let decision = allow_at(t);
    let coid = machine.create_intent(&decision, spec(1.0), json!({})).await.unwrap();
    ks.engage("operator halt");
    assert_eq!(
        machine.validate(&coid, &decision, "digest-1", t).await,
        Err(ExecError::KillSwitchEngaged)
    );
    assert_eq!(machine.get(&coid).await.unwrap().state, OrderState::Intent);

    ks.reset(&auth.issue(ACTION_RESET, "n-1").unwrap()).unwrap();
    machine.validate(&coid, &decision, "digest-1", t).await.unwrap();
    assert_eq!(machine.get(&coid).await.unwrap().state, OrderState::Validated);
}

#[tokio::test]
async fn test_engage_during_submit_leaves_order_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(PaperVenue::new());
    venue.set_down(true);
    let ks = KillSwitch::new(OperatorAuth::new("s"));
    let config = ExecConfig {
        retry: RetryConfig { max_retries: 50, base_delay_ms: 50, max_delay_ms: 50, jitter_factor: 0.0 },
        ..ExecConfig::default()
    };
    let machine = Arc::new(machine_at(&dir.path().join("orders.wal"), venue.clone(), ks.clone(), config));
    let coid = validated(&machine, 1.0).await;

    let task = {
        let machine = machine.clone();
        let coid = coid.clone();
        tokio::spawn(async move { machine.submit(&coid).await })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    ks.engage("halt during submit");

    let state = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
    assert_eq!(state, OrderState::Unknown);
    assert!(venue.submit_calls(&coid) < 50);
}

#[tokio::test]
async fn test_stale_or_mismatched_decision_refused() {
    let dir = tempfile::tempdir().unwrap();
    let machine = machine_at(&dir.path().join("orders.wal"), Arc::new(PaperVenue::new()), KillSwitch::new(OperatorAuth::new("s")), fast_retry(0));

    let t = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
    let decision = allow_at(t);
    let coid = machine.create_intent(&decision, spec(1.0), json!({})).await.unwrap();
    assert_eq!(
        machine.validate(&coid, &decision, "digest-1", t + chrono::Duration::seconds(31)).await,
        Err(ExecError::StaleDecision)
    );
    assert_eq!(
        machine.validate(&coid, &decision, "digest-2", t).await,
        Err(ExecError::DigestMismatch)
    );
}
