//! Order lifecycle owner. Every transition goes through [`ExecutionStateMachine::commit`],
//! which journals the new revision before it becomes visible in memory.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::canonical::sha256_hex;
use crate::error::{ExecError, VenueError};
use crate::kill_switch::KillSwitch;
use crate::logging::{log, log_escalation, log_order_transition, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use crate::risk::RiskGateDecision;
use crate::wal::{OrderJournal, RecoveryState, WalEntry};

use super::order_sm::{apply_event, Event, Order, OrderSpec, OrderState, VenueStatus};
use super::reconcile::OrphanPolicy;
use super::retry::{retry_venue, RetryConfig};
use super::venue::{OrderRequest, VenueAdapter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Oldest ALLOW decision accepted for INTENT→VALIDATED.
    pub decision_max_age_secs: u64,
    pub retry: RetryConfig,
    pub orphan_policy: OrphanPolicy,
    /// How long a FILLED or CANCELED order stays in memory before
    /// reconciliation retires it. The journal keeps it regardless.
    pub closed_retention_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            decision_max_age_secs: 30,
            retry: RetryConfig::default(),
            orphan_policy: OrphanPolicy::Cancel,
            closed_retention_secs: 3_600,
        }
    }
}

pub struct ExecutionStateMachine {
    orders: StdMutex<HashMap<String, Arc<Mutex<Order>>>>,
    /// Orders that reached SUBMITTED, per UTC day. Survives retirement.
    submitted_by_day: StdMutex<BTreeMap<NaiveDate, u32>>,
    journal: StdMutex<OrderJournal>,
    venue: Arc<dyn VenueAdapter>,
    kill_switch: KillSwitch,
    config: ExecConfig,
}

impl ExecutionStateMachine {
    /// Opens the journal at `path` and rebuilds the book from it.
    pub fn open(
        path: impl AsRef<Path>,
        fsync: bool,
        venue: Arc<dyn VenueAdapter>,
        kill_switch: KillSwitch,
        config: ExecConfig,
    ) -> Result<Self> {
        let recovered = OrderJournal::recover(path.as_ref())?;
        let journal = OrderJournal::open(path.as_ref(), fsync)?;
        Ok(Self::from_recovery(journal, recovered, venue, kill_switch, config))
    }

    pub fn from_recovery(
        journal: OrderJournal,
        recovered: RecoveryState,
        venue: Arc<dyn VenueAdapter>,
        kill_switch: KillSwitch,
        config: ExecConfig,
    ) -> Self {
        let live = recovered.orders.values().filter(|o| !o.state.is_terminal()).count();
        log(
            Level::Info,
            Domain::Exec,
            "recovered",
            obj(&[
                ("orders", v_num(recovered.orders.len() as f64)),
                ("non_terminal", v_num(live as f64)),
                ("escalations", v_num(recovered.escalations.len() as f64)),
                ("skipped_lines", v_num(recovered.skipped_lines as f64)),
                ("journal", v_str(&journal.path().display().to_string())),
            ]),
        );
        let mut submitted_by_day = BTreeMap::new();
        for day in recovered.orders.values().filter_map(|o| o.submitted_at).map(|t| t.date_naive()) {
            *submitted_by_day.entry(day).or_insert(0) += 1;
        }
        let orders = recovered
            .orders
            .into_iter()
            .map(|(id, o)| (id, Arc::new(Mutex::new(o))))
            .collect();
        Self {
            orders: StdMutex::new(orders),
            submitted_by_day: StdMutex::new(submitted_by_day),
            journal: StdMutex::new(journal),
            venue,
            kill_switch,
            config,
        }
    }

    pub fn venue(&self) -> &Arc<dyn VenueAdapter> {
        &self.venue
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    fn book(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<Order>>>> {
        match self.orders.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn handle(&self, client_order_id: &str) -> Result<Arc<Mutex<Order>>, ExecError> {
        self.book()
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| ExecError::UnknownOrder(client_order_id.to_string()))
    }

    pub fn contains(&self, client_order_id: &str) -> bool {
        self.book().contains_key(client_order_id)
    }

    pub(crate) fn order_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.book().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn write(&self, entry: &WalEntry) -> Result<(), ExecError> {
        let mut journal = self.journal.lock().map_err(|_| ExecError::Journal("journal lock poisoned".to_string()))?;
        journal.append_entry(entry).map_err(|e| ExecError::Journal(e.to_string()))
    }

    /// Apply `event` under the caller's order lock. The new revision is
    /// journaled first; on a journal failure the in-memory order is untouched.
    pub(crate) fn commit(&self, order: &mut Order, event: Event, source: &str) -> Result<bool, ExecError> {
        let mut next = order.clone();
        let event_name = event.name();
        let changed = apply_event(&mut next, event).map_err(|e| ExecError::InvalidTransition {
            from: e.from.as_str().to_string(),
            to: e.event.to_string(),
        })?;
        if !changed {
            return Ok(false);
        }
        if next.state.is_terminal() && next.closed_at.is_none() {
            next.closed_at = Some(Utc::now());
        }
        next.revision = order.revision + 1;
        self.write(&WalEntry::Revision {
            ts: ts_epoch_ms(),
            client_order_id: next.client_order_id.clone(),
            revision: next.revision,
            event: event_name.to_string(),
            source: source.to_string(),
            order: next.clone(),
        })?;
        log_order_transition(&next.client_order_id, order.state.as_str(), next.state.as_str(), next.revision, source);
        if let (None, Some(at)) = (order.submitted_at, next.submitted_at) {
            let mut days = match self.submitted_by_day.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *days.entry(at.date_naive()).or_insert(0) += 1;
        }
        *order = next;
        Ok(true)
    }

    /// Hands an order that reconciliation cannot resolve to the operator.
    /// Trips the kill switch if armed. Happens at most once per order.
    pub(crate) fn escalate(&self, order: &mut Order, reason: &str) -> Result<(), ExecError> {
        if order.escalated {
            return Ok(());
        }
        let mut next = order.clone();
        next.escalated = true;
        next.revision = order.revision + 1;
        self.write(&WalEntry::Escalation {
            ts: ts_epoch_ms(),
            client_order_id: next.client_order_id.clone(),
            reason: reason.to_string(),
        })?;
        self.write(&WalEntry::Revision {
            ts: ts_epoch_ms(),
            client_order_id: next.client_order_id.clone(),
            revision: next.revision,
            event: "escalate".to_string(),
            source: "reconcile".to_string(),
            order: next.clone(),
        })?;
        *order = next;
        log_escalation(&order.client_order_id, reason);
        self.kill_switch.trip(&format!("order {} escalated: {}", order.client_order_id, reason));
        Ok(())
    }

    fn new_client_order_id(decision: &RiskGateDecision, spec: &OrderSpec) -> String {
        let material = format!(
            "{}|{}|{}|{}|{}",
            decision.gate_id,
            spec.symbol,
            spec.qty,
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            rand::random::<u64>()
        );
        format!("gfx-{}", &sha256_hex(material.as_bytes())[..24])
    }

    /// Records an intent against an ALLOW decision. The client order id is
    /// fixed here, before any venue call.
    pub async fn create_intent(
        &self,
        decision: &RiskGateDecision,
        spec: OrderSpec,
        limits_snapshot: Value,
    ) -> Result<String, ExecError> {
        if !decision.is_allow() {
            return Err(ExecError::GateBlocked(decision.reason_strings()));
        }
        let client_order_id = Self::new_client_order_id(decision, &spec);
        if self.contains(&client_order_id) {
            return Err(ExecError::DuplicateOrder(client_order_id));
        }
        let mut order = Order::new(
            &client_order_id,
            spec,
            &decision.gate_id,
            &decision.inputs_snapshot_digest,
            limits_snapshot,
            Utc::now(),
        );
        order.revision = 1;
        self.write(&WalEntry::Revision {
            ts: ts_epoch_ms(),
            client_order_id: client_order_id.clone(),
            revision: 1,
            event: "intent".to_string(),
            source: "pipeline".to_string(),
            order: order.clone(),
        })?;
        log_order_transition(&client_order_id, "NONE", OrderState::Intent.as_str(), 1, "pipeline");
        self.book().insert(client_order_id.clone(), Arc::new(Mutex::new(order)));
        Ok(client_order_id)
    }

    /// INTENT→VALIDATED. Refused while the kill switch is engaged, on a BLOCK,
    /// on a decision older than the configured age, or when the decision was
    /// made on inputs other than the current ones.
    pub async fn validate(
        &self,
        client_order_id: &str,
        decision: &RiskGateDecision,
        current_inputs_digest: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ExecError> {
        let handle = self.handle(client_order_id)?;
        let mut order = handle.lock().await;
        if self.kill_switch.is_engaged() {
            return Err(ExecError::KillSwitchEngaged);
        }
        if !decision.is_allow() {
            return Err(ExecError::GateBlocked(decision.reason_strings()));
        }
        let age = now.signed_duration_since(decision.as_of_utc).num_milliseconds();
        if age < 0 || age as u64 > self.config.decision_max_age_secs * 1000 {
            return Err(ExecError::StaleDecision);
        }
        if decision.inputs_snapshot_digest != current_inputs_digest {
            return Err(ExecError::DigestMismatch);
        }
        self.commit(&mut order, Event::Validate, "pipeline")?;
        Ok(())
    }

    /// VALIDATED→SUBMITTED and on to whatever the venue answers. Calling it
    /// again for an order already past VALIDATED returns the current state
    /// without touching the venue. An ambiguous outcome leaves the order
    /// UNKNOWN for reconciliation.
    pub async fn submit(&self, client_order_id: &str) -> Result<OrderState, ExecError> {
        let handle = self.handle(client_order_id)?;
        let mut order = handle.lock().await;
        match order.state {
            OrderState::Validated => {}
            OrderState::Intent => {
                return Err(ExecError::InvalidTransition {
                    from: OrderState::Intent.as_str().to_string(),
                    to: OrderState::Submitted.as_str().to_string(),
                })
            }
            other => return Ok(other),
        }
        if self.kill_switch.is_engaged() {
            return Err(ExecError::KillSwitchEngaged);
        }
        let cancel = self.kill_switch.cancel_token();
        self.commit(&mut order, Event::Submit { at: Utc::now() }, "pipeline")?;

        let req = OrderRequest {
            client_order_id: order.client_order_id.clone(),
            spec: order.spec.clone(),
        };
        let venue = self.venue.clone();
        let outcome = retry_venue(&self.config.retry, "submit", &cancel, || {
            let venue = venue.clone();
            let req = req.clone();
            async move { venue.submit(&req).await }
        })
        .await;

        match outcome {
            Ok(ack) => {
                self.commit(&mut order, Event::Ack { venue_order_id: ack.venue_order_id.clone() }, "venue")?;
                if ack.filled_qty > 0.0 {
                    let fill_id = format!("{}-ack", ack.venue_order_id);
                    self.commit(&mut order, Event::Fill { fill_id, qty: ack.filled_qty, price: 0.0 }, "venue")?;
                }
                if ack.status == VenueStatus::Canceled {
                    self.commit(&mut order, Event::Canceled { reason: "canceled at venue".to_string() }, "venue")?;
                }
            }
            Err(VenueError::Rejected(reason)) => {
                self.commit(&mut order, Event::Canceled { reason: format!("rejected: {}", reason) }, "venue")?;
            }
            Err(e) => {
                self.commit(&mut order, Event::Ambiguous { reason: e.to_string() }, "venue")?;
                log_escalation(&order.client_order_id, &format!("submit outcome unknown: {}", e));
            }
        }
        Ok(order.state)
    }

    /// Live venue events: acks, fills and cancels. UNKNOWN orders only move
    /// through reconciliation.
    pub async fn on_venue_event(&self, client_order_id: &str, event: Event) -> Result<OrderState, ExecError> {
        if !matches!(event, Event::Ack { .. } | Event::Fill { .. } | Event::Canceled { .. }) {
            return Err(ExecError::InvalidTransition {
                from: "VENUE".to_string(),
                to: event.name().to_string(),
            });
        }
        let handle = self.handle(client_order_id)?;
        let mut order = handle.lock().await;
        self.commit(&mut order, event, "venue")?;
        Ok(order.state)
    }

    /// Closes an order that never reached the venue.
    pub async fn abandon(&self, client_order_id: &str, reason: &str) -> Result<OrderState, ExecError> {
        let handle = self.handle(client_order_id)?;
        let mut order = handle.lock().await;
        self.commit(&mut order, Event::Abandon { reason: reason.to_string() }, "pipeline")?;
        Ok(order.state)
    }

    pub async fn get(&self, client_order_id: &str) -> Option<Order> {
        let handle = self.handle(client_order_id).ok()?;
        let order = handle.lock().await;
        Some(order.clone())
    }

    /// All orders, terminal ones included, oldest first.
    pub async fn orders(&self) -> Vec<Order> {
        let handles: Vec<_> = self.book().values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            out.push(h.lock().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.client_order_id.cmp(&b.client_order_id)));
        out
    }

    /// Orders that reached SUBMITTED on `day` (UTC), whatever happened after.
    pub async fn submitted_on(&self, day: NaiveDate) -> u32 {
        let days = match self.submitted_by_day.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        days.get(&day).copied().unwrap_or(0)
    }

    /// Drops FILLED and CANCELED orders closed at or before `cutoff` from
    /// the in-memory book. Escalated orders and orders whose lock is held
    /// stay.
    pub fn retire_closed(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut book = self.book();
        let retired: Vec<String> = book
            .iter()
            .filter_map(|(id, handle)| {
                let order = handle.try_lock().ok()?;
                let closed = order.closed_at.unwrap_or(order.created_at);
                (order.state.is_terminal() && !order.escalated && closed <= cutoff).then(|| id.clone())
            })
            .collect();
        for id in &retired {
            book.remove(id);
        }
        drop(book);
        if !retired.is_empty() {
            log(
                Level::Info,
                Domain::Exec,
                "orders_retired",
                obj(&[
                    ("count", v_num(retired.len() as f64)),
                    ("cutoff", v_str(&cutoff.to_rfc3339())),
                ]),
            );
        }
        retired
    }
}
