//! Operator-facing controls. Every call leaves an audit line.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::canonical::{digest_of, sha256_hex};
use crate::error::NotAuthorized;
use crate::exec::{reconcile_once, ExecutionStateMachine, ReconcileMode, ReconcileReport};
use crate::kill_switch::{KillSwitch, KillSwitchState};
use crate::logging::log_audit;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorStatus {
    pub kill_switch: KillSwitchState,
    pub orders_by_state: BTreeMap<String, usize>,
    /// Orders waiting on a human.
    pub escalated: Vec<String>,
    pub unknown: Vec<String>,
}

#[derive(Clone)]
pub struct Operator {
    kill_switch: KillSwitch,
    machine: Arc<ExecutionStateMachine>,
}

fn state_hash(state: &KillSwitchState) -> String {
    digest_of(state).unwrap_or_default()
}

impl Operator {
    pub fn new(machine: Arc<ExecutionStateMachine>) -> Self {
        Self { kill_switch: machine.kill_switch().clone(), machine }
    }

    pub fn engage_kill_switch(&self, reason: &str) -> KillSwitchState {
        self.kill_switch.engage(reason);
        let state = self.kill_switch.state();
        log_audit("kill_switch_engage", "operator", &sha256_hex(reason.as_bytes()), &state_hash(&state));
        state
    }

    pub fn arm_kill_switch(&self, operator_token: &str) -> Result<KillSwitchState, NotAuthorized> {
        let result = self.kill_switch.arm(operator_token);
        let state = self.kill_switch.state();
        let event = if result.is_ok() { "kill_switch_arm" } else { "kill_switch_arm_rejected" };
        log_audit(event, "operator", &sha256_hex(operator_token.as_bytes()), &state_hash(&state));
        result.map(|_| state)
    }

    /// Leaves the switch engaged on a bad token.
    pub fn reset_kill_switch(&self, operator_token: &str) -> Result<KillSwitchState, NotAuthorized> {
        let result = self.kill_switch.reset(operator_token);
        let state = self.kill_switch.state();
        let event = if result.is_ok() { "kill_switch_reset" } else { "kill_switch_reset_rejected" };
        log_audit(event, "operator", &sha256_hex(operator_token.as_bytes()), &state_hash(&state));
        result.map(|_| state)
    }

    /// On-demand reconciliation pass, same rules as the periodic one.
    pub async fn reconcile_now(&self) -> ReconcileReport {
        let report = reconcile_once(&self.machine, ReconcileMode::Periodic).await;
        log_audit(
            "reconcile_now",
            "operator",
            "",
            &digest_of(&report).unwrap_or_default(),
        );
        report
    }

    pub async fn status(&self) -> OperatorStatus {
        let mut orders_by_state = BTreeMap::new();
        let mut escalated = Vec::new();
        let mut unknown = Vec::new();
        for order in self.machine.orders().await {
            *orders_by_state.entry(order.state.as_str().to_string()).or_insert(0) += 1;
            if order.escalated {
                escalated.push(order.client_order_id.clone());
            }
            if order.state == crate::exec::OrderState::Unknown {
                unknown.push(order.client_order_id);
            }
        }
        OperatorStatus {
            kill_switch: self.kill_switch.state(),
            orders_by_state,
            escalated,
            unknown,
        }
    }
}
