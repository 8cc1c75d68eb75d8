//! Aligns local order state with the venue. Runs once at start-up and then
//! periodically, taking the same per-order lock as the live path.
//!
//! An order that stays ambiguous is canceled if the venue allows it and
//! escalated to the operator otherwise. It is never retried in a loop.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::{ExecError, VenueError};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

use super::machine::ExecutionStateMachine;
use super::order_sm::{Event, Order, OrderState, VenueStatus};
use super::retry::retry_venue;
use super::venue::VenueOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrphanPolicy {
    /// Cancel venue orders we have no record of.
    Cancel,
    /// Leave them in place and report them for review.
    Flag,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cancel" => Ok(OrphanPolicy::Cancel),
            "flag" => Ok(OrphanPolicy::Flag),
            other => Err(format!("unknown orphan policy {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// After a restart: orders that never reached the venue are closed out.
    Startup,
    Periodic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub aligned: Vec<String>,
    pub abandoned: Vec<String>,
    pub unknown: Vec<String>,
    pub escalated: Vec<String>,
    pub orphans_canceled: Vec<String>,
    pub orphans_flagged: Vec<String>,
    /// Closed orders dropped from memory after their retention window.
    pub retired: Vec<String>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    fn log(&self, mode: ReconcileMode) {
        let level = if self.escalated.is_empty() && self.errors.is_empty() { Level::Info } else { Level::Warn };
        log(
            level,
            Domain::Reconcile,
            "reconcile",
            obj(&[
                ("mode", v_str(if mode == ReconcileMode::Startup { "startup" } else { "periodic" })),
                ("checked", v_num(self.checked as f64)),
                ("aligned", v_num(self.aligned.len() as f64)),
                ("abandoned", v_num(self.abandoned.len() as f64)),
                ("unknown", v_num(self.unknown.len() as f64)),
                ("escalated", v_num(self.escalated.len() as f64)),
                ("orphans_canceled", v_num(self.orphans_canceled.len() as f64)),
                ("orphans_flagged", v_num(self.orphans_flagged.len() as f64)),
                ("retired", v_num(self.retired.len() as f64)),
                ("errors", v_num(self.errors.len() as f64)),
            ]),
        );
    }
}

/// One pass over every non-terminal order, then orphan detection.
pub async fn reconcile_once(machine: &ExecutionStateMachine, mode: ReconcileMode) -> ReconcileReport {
    reconcile_with(machine, mode, &CancellationToken::new()).await
}

/// As [`reconcile_once`]; `cancel` interrupts venue calls and their backoff.
/// Venue calls go through the configured retry budget before an answer
/// counts as ambiguous.
pub async fn reconcile_with(
    machine: &ExecutionStateMachine,
    mode: ReconcileMode,
    cancel: &CancellationToken,
) -> ReconcileReport {
    let venue = Venue { machine, token: cancel };
    let mut report = ReconcileReport::default();
    for id in machine.order_ids() {
        let Ok(handle) = machine.handle(&id) else {
            continue;
        };
        let mut order = handle.lock().await;
        if order.state.is_terminal() {
            continue;
        }
        report.checked += 1;
        if let Err(e) = reconcile_order(&venue, &mut order, mode, &mut report).await {
            report.errors.push(format!("{}: {}", id, e));
        }
    }
    sweep_orphans(&venue, &mut report).await;
    let retention = chrono::Duration::seconds(machine.config().closed_retention_secs as i64);
    report.retired = machine.retire_closed(Utc::now() - retention);
    report.log(mode);
    report
}

/// Venue access for one pass, retried under the machine's policy.
struct Venue<'a> {
    machine: &'a ExecutionStateMachine,
    token: &'a CancellationToken,
}

impl Venue<'_> {
    async fn query(&self, id: &str) -> Result<VenueOrder, VenueError> {
        let venue = self.machine.venue().clone();
        retry_venue(&self.machine.config().retry, "query_order", self.token, || {
            let venue = venue.clone();
            let id = id.to_string();
            async move { venue.query_order(&id).await }
        })
        .await
    }

    async fn cancel(&self, id: &str) -> Result<(), VenueError> {
        let venue = self.machine.venue().clone();
        retry_venue(&self.machine.config().retry, "cancel", self.token, || {
            let venue = venue.clone();
            let id = id.to_string();
            async move { venue.cancel(&id).await }
        })
        .await
    }

    async fn list_open(&self) -> Result<Vec<VenueOrder>, VenueError> {
        let venue = self.machine.venue().clone();
        retry_venue(&self.machine.config().retry, "list_open_orders", self.token, || {
            let venue = venue.clone();
            async move { venue.list_open_orders().await }
        })
        .await
    }
}

async fn reconcile_order(
    venue: &Venue<'_>,
    order: &mut Order,
    mode: ReconcileMode,
    report: &mut ReconcileReport,
) -> Result<(), ExecError> {
    let machine = venue.machine;
    let id = order.client_order_id.clone();
    if matches!(order.state, OrderState::Intent | OrderState::Validated) {
        // the live path may be between steps; only a restart proves it never will continue
        if mode == ReconcileMode::Startup {
            machine.commit(order, Event::Abandon { reason: "not submitted before restart".to_string() }, "reconcile")?;
            report.abandoned.push(id);
        }
        return Ok(());
    }

    match venue.query(&id).await {
        Ok(vo) if vo.symbol != order.spec.symbol => {
            let reason = format!("venue reports symbol {}", vo.symbol);
            on_ambiguity(venue, order, &reason, report).await
        }
        Ok(vo) => {
            let changed = machine.commit(
                order,
                Event::Reconciled {
                    status: vo.status,
                    venue_order_id: Some(vo.venue_order_id),
                    filled_qty: vo.filled_qty,
                    at: Utc::now(),
                },
                "reconcile",
            )?;
            if changed {
                report.aligned.push(id);
            }
            Ok(())
        }
        Err(VenueError::NotFound) => {
            // never reached the venue; fence with a cancel so a late arrival cannot go live
            match venue.cancel(&id).await {
                Ok(()) | Err(VenueError::NotFound) => {
                    close_canceled(machine, order, report)?;
                    Ok(())
                }
                Err(e) => on_ambiguity(venue, order, &e.to_string(), report).await,
            }
        }
        Err(e) => on_ambiguity(venue, order, &e.to_string(), report).await,
    }
}

fn close_canceled(machine: &ExecutionStateMachine, order: &mut Order, report: &mut ReconcileReport) -> Result<(), ExecError> {
    let filled_qty = order.filled_qty;
    machine.commit(
        order,
        Event::Reconciled { status: VenueStatus::Canceled, venue_order_id: None, filled_qty, at: Utc::now() },
        "reconcile",
    )?;
    report.aligned.push(order.client_order_id.clone());
    Ok(())
}

/// First strike moves the order to UNKNOWN. A second strike tries to cancel
/// and escalates if that fails too.
async fn on_ambiguity(
    venue: &Venue<'_>,
    order: &mut Order,
    reason: &str,
    report: &mut ReconcileReport,
) -> Result<(), ExecError> {
    let machine = venue.machine;
    let id = order.client_order_id.clone();
    if order.state != OrderState::Unknown {
        machine.commit(order, Event::Ambiguous { reason: reason.to_string() }, "reconcile")?;
        report.unknown.push(id);
        return Ok(());
    }
    if order.escalated {
        report.unknown.push(id);
        return Ok(());
    }
    match venue.cancel(&id).await {
        Ok(()) | Err(VenueError::NotFound) => close_canceled(machine, order, report),
        Err(e) => {
            machine.escalate(order, &format!("{}; cancel failed: {}", reason, e))?;
            report.escalated.push(id);
            Ok(())
        }
    }
}

async fn sweep_orphans(venue: &Venue<'_>, report: &mut ReconcileReport) {
    let machine = venue.machine;
    let open = match venue.list_open().await {
        Ok(open) => open,
        Err(e) => {
            report.errors.push(format!("list_open_orders: {}", e));
            return;
        }
    };
    for vo in open {
        if machine.contains(&vo.client_order_id) {
            continue;
        }
        match machine.config().orphan_policy {
            OrphanPolicy::Cancel => match venue.cancel(&vo.client_order_id).await {
                Ok(()) => report.orphans_canceled.push(vo.client_order_id),
                Err(e) => {
                    report.errors.push(format!("orphan {}: {}", vo.client_order_id, e));
                    report.orphans_flagged.push(vo.client_order_id);
                }
            },
            OrphanPolicy::Flag => {
                log(
                    Level::Warn,
                    Domain::Reconcile,
                    "orphan_flagged",
                    obj(&[
                        ("client_order_id", v_str(&vo.client_order_id)),
                        ("venue_order_id", v_str(&vo.venue_order_id)),
                        ("symbol", v_str(&vo.symbol)),
                        ("qty", v_num(vo.qty)),
                    ]),
                );
                report.orphans_flagged.push(vo.client_order_id);
            }
        }
    }
}

/// Background loop; exits when `shutdown` is cancelled.
pub async fn run_periodic(machine: Arc<ExecutionStateMachine>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        reconcile_with(&machine, ReconcileMode::Periodic, &shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OperatorAuth;
    use crate::exec::machine::ExecConfig;
    use crate::exec::order_sm::{OrderSpec, Side};
    use crate::exec::retry::RetryConfig;
    use crate::exec::venue::{PaperVenue, Scripted, VenueAdapter};
    use crate::kill_switch::{KillSwitch, ACTION_ARM};
    use crate::risk::{GateStatus, RiskGateDecision};
    use serde_json::json;

    fn allow() -> RiskGateDecision {
        RiskGateDecision {
            gate_id: "gate-1".to_string(),
            status: GateStatus::Allow,
            reasons: vec![],
            as_of_utc: Utc::now(),
            inputs_snapshot_digest: "d1".to_string(),
        }
    }

    fn setup(dir: &tempfile::TempDir, venue: Arc<PaperVenue>, policy: OrphanPolicy) -> (ExecutionStateMachine, KillSwitch, OperatorAuth) {
        let auth = OperatorAuth::new("s");
        let ks = KillSwitch::new(auth.clone());
        let config = ExecConfig {
            retry: RetryConfig { max_retries: 0, base_delay_ms: 1, max_delay_ms: 1, jitter_factor: 0.0 },
            orphan_policy: policy,
            ..ExecConfig::default()
        };
        let m = ExecutionStateMachine::open(dir.path().join("orders.wal"), false, venue, ks.clone(), config).unwrap();
        (m, ks, auth)
    }

    async fn submitted_unknown(m: &ExecutionStateMachine, venue: &PaperVenue) -> String {
        let d = allow();
        let id = m
            .create_intent(&d, OrderSpec { symbol: "NQ".into(), side: Side::Buy, qty: 1.0, limit_price: None }, json!({}))
            .await
            .unwrap();
        m.validate(&id, &d, "d1", Utc::now()).await.unwrap();
        venue.script_submit(Scripted::AcceptThenTimeout);
        assert_eq!(m.submit(&id).await.unwrap(), OrderState::Unknown);
        id
    }

    #[tokio::test]
    async fn test_unknown_resolves_from_venue() {
        let dir = tempfile::tempdir().unwrap();
        let venue = Arc::new(PaperVenue::new());
        let (m, _, _) = setup(&dir, venue.clone(), OrphanPolicy::Cancel);
        let id = submitted_unknown(&m, &venue).await;
        venue.fill(&id, 1.0);
        let report = reconcile_once(&m, ReconcileMode::Periodic).await;
        assert_eq!(report.aligned, vec![id.clone()]);
        assert_eq!(m.get(&id).await.unwrap().state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_pass_retires_orders_closed_before_retention() {
        let dir = tempfile::tempdir().unwrap();
        let venue = Arc::new(PaperVenue::new());
        let config = ExecConfig {
            retry: RetryConfig { max_retries: 0, base_delay_ms: 1, max_delay_ms: 1, jitter_factor: 0.0 },
            closed_retention_secs: 0,
            ..ExecConfig::default()
        };
        let ks = KillSwitch::new(OperatorAuth::new("s"));
        let m = ExecutionStateMachine::open(dir.path().join("orders.wal"), false, venue.clone(), ks, config).unwrap();
        let id = submitted_unknown(&m, &venue).await;
        let open = submitted_unknown(&m, &venue).await;
        venue.fill(&id, 1.0);

        let first = reconcile_once(&m, ReconcileMode::Periodic).await;
        assert!(first.aligned.contains(&id));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = reconcile_once(&m, ReconcileMode::Periodic).await;
        assert!(first.retired.contains(&id) || second.retired.contains(&id));
        assert!(m.get(&id).await.is_none());
        assert_eq!(m.get(&open).await.unwrap().state, OrderState::Open);
        assert_eq!(m.submitted_on(Utc::now().date_naive()).await, 2);
    }

    #[tokio::test]
    async fn test_continued_ambiguity_cancels_then_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let venue = Arc::new(PaperVenue::new());
        let (m, ks, auth) = setup(&dir, venue.clone(), OrphanPolicy::Cancel);
        ks.arm(&auth.issue(ACTION_ARM, "a").unwrap()).unwrap();
        let id = submitted_unknown(&m, &venue).await;

        venue.script_query(VenueError::Timeout);
        venue.script_cancel(VenueError::Timeout);
        let report = reconcile_once(&m, ReconcileMode::Periodic).await;
        assert_eq!(report.escalated, vec![id.clone()]);
        assert!(m.get(&id).await.unwrap().escalated);
        assert!(ks.is_engaged());

        // escalated orders are not escalated again
        venue.script_query(VenueError::Timeout);
        let again = reconcile_once(&m, ReconcileMode::Periodic).await;
        assert!(again.escalated.is_empty());
        assert_eq!(again.unknown, vec![id]);
    }

    #[tokio::test]
    async fn test_continued_ambiguity_cancel_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let venue = Arc::new(PaperVenue::new());
        let (m, _, _) = setup(&dir, venue.clone(), OrphanPolicy::Cancel);
        let id = submitted_unknown(&m, &venue).await;
        venue.script_query(VenueError::Unavailable("503".into()));
        reconcile_once(&m, ReconcileMode::Periodic).await;
        assert_eq!(m.get(&id).await.unwrap().state, OrderState::Canceled);
    }

    #[tokio::test]
    async fn test_orphans_per_policy() {
        let dir = tempfile::tempdir().unwrap();
        let venue = Arc::new(PaperVenue::new());
        venue.inject_orphan("stray-1", "NQ", 2.0);
        let (m, _, _) = setup(&dir, venue.clone(), OrphanPolicy::Flag);
        let report = reconcile_once(&m, ReconcileMode::Periodic).await;
        assert_eq!(report.orphans_flagged, vec!["stray-1".to_string()]);
        assert_eq!(venue.list_open_orders().await.unwrap().len(), 1);

        let dir2 = tempfile::tempdir().unwrap();
        let (m2, _, _) = setup(&dir2, venue.clone(), OrphanPolicy::Cancel);
        let report = reconcile_once(&m2, ReconcileMode::Periodic).await;
        assert_eq!(report.orphans_canceled, vec!["stray-1".to_string()]);
        assert!(venue.list_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_pass_leaves_pending_intents_alone() {
        let dir = tempfile::tempdir().unwrap();
        let venue = Arc::new(PaperVenue::new());
        let (m, _, _) = setup(&dir, venue, OrphanPolicy::Cancel);
        let id = m
            .create_intent(&allow(), OrderSpec { symbol: "NQ".into(), side: Side::Sell, qty: 1.0, limit_price: None }, json!({}))
            .await
            .unwrap();
        reconcile_once(&m, ReconcileMode::Periodic).await;
        assert_eq!(m.get(&id).await.unwrap().state, OrderState::Intent);
        let report = reconcile_once(&m, ReconcileMode::Startup).await;
        assert_eq!(report.abandoned, vec![id.clone()]);
        assert_eq!(m.get(&id).await.unwrap().state, OrderState::Canceled);
    }

    #[test]
    fn test_orphan_policy_parse() {
        assert_eq!("CANCEL".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Cancel));
        assert_eq!("flag".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Flag));
        assert!("ignore".parse::<OrphanPolicy>().is_err());
    }
}
