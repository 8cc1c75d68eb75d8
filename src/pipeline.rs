//! One governed cycle: decision layers, hard gate, approval, execution.
//!
//! The layers run through the orchestrator and produce evidence. The gate
//! decision is taken by [`RiskGate`] itself and recorded as the `risk_gate`
//! layer's pack. Only an ALLOW with an approved execution pack reaches the
//! state machine. Everything the cycle produced is written to the store,
//! whatever the outcome.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::ExecError;
use crate::evidence::{EvidencePack, InputSnapshot, LayerInputs};
use crate::exec::{ExecutionStateMachine, OrderSpec, OrderState};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::orchestrator::{Orchestrator, RunSession, WorkerPool};
use crate::risk::{RiskGate, RiskGateDecision, RiskInputs};
use crate::scope::ActionKind;
use crate::storage::EvidenceStore;

pub const DECISION_LAYERS: &[&str] = &["research", "outlook", "advisory", "critic"];
pub const GATE_LAYER: &str = "risk_gate";
pub const EXECUTION_LAYER: &str = "execution";

const RUN_REASON: &str = "cycle";

/// Wall clock read at gate evaluation and again at validation.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What a cycle consumes: the market snapshot fed to every layer and the
/// live risk inputs. `trades_today` is always recomputed from the order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInput {
    pub snapshot: InputSnapshot,
    pub risk: RiskInputs,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputFile {
    One(CycleInput),
    Many(Vec<CycleInput>),
}

pub fn load_cycle_inputs(path: impl AsRef<std::path::Path>) -> anyhow::Result<Vec<CycleInput>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading inputs {}", path.display()))?;
    let parsed: InputFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing inputs {}", path.display()))?;
    Ok(match parsed {
        InputFile::One(input) => vec![input],
        InputFile::Many(inputs) => inputs,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub run_id: String,
    pub packs: Vec<EvidencePack>,
    pub decision: Option<RiskGateDecision>,
    pub client_order_id: Option<String>,
    pub order_state: Option<OrderState>,
    /// Reason code of the step that stopped the cycle short of a submission.
    pub halted: Option<String>,
}

impl CycleReport {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            packs: Vec::new(),
            decision: None,
            client_order_id: None,
            order_state: None,
            halted: None,
        }
    }

    pub fn submitted(&self) -> bool {
        self.halted.is_none() && self.client_order_id.is_some()
    }
}

/// How a batch of runs ended.
#[derive(Debug)]
pub enum BatchOutcome {
    Completed(Vec<Option<CycleReport>>),
    /// Stop was requested mid-batch. `reports` is `None` when the runs did
    /// not unwind within the grace period.
    Stopped { reports: Option<Vec<Option<CycleReport>>> },
}

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub git_ref: String,
    pub symbol: String,
    /// Recorded approval handed to the execution layer.
    pub auto_approve: bool,
}

#[derive(Clone)]
pub struct Governor {
    orchestrator: Orchestrator,
    gate: Arc<RiskGate>,
    machine: Arc<ExecutionStateMachine>,
    store: Option<Arc<StdMutex<EvidenceStore>>>,
    settings: CycleSettings,
    clock: Clock,
    // held from gate evaluation through submission
    exec_lane: Arc<Mutex<()>>,
}

fn inputs_for(session: &RunSession, snapshot: InputSnapshot) -> LayerInputs {
    session
        .arena()
        .heads()
        .into_iter()
        .fold(LayerInputs::new(snapshot), |acc, p| acc.with_upstream(p.layer_id(), p.determinism_hash()))
}

fn proposal_of(packs: &[EvidencePack]) -> Option<serde_json::Value> {
    packs
        .iter()
        .rev()
        .find(|p| p.layer_id() == "advisory")?
        .outputs()
        .actions
        .iter()
        .find(|a| a.kind == ActionKind::ProposeOrder)
        .map(|a| a.detail.clone())
}

impl Governor {
    pub fn new(
        orchestrator: Orchestrator,
        gate: RiskGate,
        machine: Arc<ExecutionStateMachine>,
        store: Option<EvidenceStore>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            orchestrator,
            gate: Arc::new(gate),
            machine,
            store: store.map(|s| Arc::new(StdMutex::new(s))),
            settings,
            clock: Arc::new(Utc::now),
            exec_lane: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn machine(&self) -> &Arc<ExecutionStateMachine> {
        &self.machine
    }

    pub fn store(&self) -> Option<&Arc<StdMutex<EvidenceStore>>> {
        self.store.as_ref()
    }

    pub async fn run_cycle(&self, run_id: &str, input: &CycleInput) -> CycleReport {
        let mut session = RunSession::new(run_id, &self.settings.git_ref);
        let mut report = CycleReport::new(run_id);
        let mut exec_error: Option<(String, String)> = None;

        let outcome = self
            .orchestrator
            .run_pipeline(&mut session, DECISION_LAYERS, &input.snapshot, RUN_REASON)
            .await;
        if let Some(err) = outcome.error {
            report.halted = Some(err.reason_code().to_string());
            return self.finish(session, report, None);
        }

        let _lane = self.exec_lane.lock().await;
        let now = (self.clock)();
        let risk = RiskInputs {
            symbol: self.settings.symbol.clone(),
            trades_today: Some(self.machine.submitted_on(now.date_naive()).await),
            ..input.risk.clone()
        };
        let decision = self.gate.evaluate(&risk, &session.packs(), now);
        report.decision = Some(decision.clone());

        let gate_snapshot = InputSnapshot::new(
            GATE_LAYER,
            now,
            json!({ "decision": decision, "risk_inputs": risk }),
        );
        if let Err(err) = self.run_single(&mut session, GATE_LAYER, gate_snapshot).await {
            report.halted = Some(err);
            return self.finish(session, report, None);
        }
        if !decision.is_allow() {
            report.halted = Some("RISK_GATE_BLOCK".to_string());
            return self.finish(session, report, None);
        }

        let Some(proposal) = proposal_of(&session.packs()) else {
            report.halted = Some("NO_PROPOSAL".to_string());
            return self.finish(session, report, None);
        };
        let spec: OrderSpec = match serde_json::from_value::<OrderSpec>(proposal.clone()) {
            Ok(spec) if spec.symbol == self.settings.symbol => spec,
            Ok(spec) => {
                report.halted = Some("PROPOSAL_INVALID".to_string());
                let detail = format!("proposal for {} but gate evaluated {}", spec.symbol, self.settings.symbol);
                return self.finish(session, report, Some(("PROPOSAL_INVALID".to_string(), detail)));
            }
            Err(e) => {
                report.halted = Some("PROPOSAL_INVALID".to_string());
                let detail = e.to_string();
                return self.finish(session, report, Some(("PROPOSAL_INVALID".to_string(), detail)));
            }
        };

        let approval_snapshot = InputSnapshot::new(
            EXECUTION_LAYER,
            now,
            json!({
                "proposal": proposal,
                "gate_id": decision.gate_id,
                "approval": { "approved": self.settings.auto_approve },
            }),
        );
        match self.run_single(&mut session, EXECUTION_LAYER, approval_snapshot).await {
            Ok(pack) if pack.has_blocking_finding() => {
                report.halted = Some("NOT_APPROVED".to_string());
                return self.finish(session, report, None);
            }
            Ok(_) => {}
            Err(err) => {
                report.halted = Some(err);
                return self.finish(session, report, None);
            }
        }

        match self.execute(&decision, spec, &risk, &mut report).await {
            Ok(state) => report.order_state = Some(state),
            Err(e) => {
                report.halted = Some(e.reason_code().to_string());
                exec_error = Some((e.reason_code().to_string(), e.to_string()));
            }
        }
        self.finish(session, report, exec_error)
    }

    /// INTENT → VALIDATED → SUBMITTED for an approved proposal. Validation
    /// re-reads the clock and the trade count, so a slow cycle or a book that
    /// moved since the gate ran is refused. A refused intent is abandoned.
    async fn execute(
        &self,
        decision: &RiskGateDecision,
        spec: OrderSpec,
        gated: &RiskInputs,
        report: &mut CycleReport,
    ) -> Result<OrderState, ExecError> {
        let limits = serde_json::to_value(self.gate.limits()).unwrap_or_default();
        let coid = self.machine.create_intent(decision, spec, limits).await?;
        report.client_order_id = Some(coid.clone());

        let now = (self.clock)();
        let current = RiskInputs {
            trades_today: Some(self.machine.submitted_on(now.date_naive()).await),
            ..gated.clone()
        };
        if let Err(e) = self.machine.validate(&coid, decision, &current.digest(), now).await {
            report.order_state = self.machine.abandon(&coid, e.reason_code()).await.ok();
            return Err(e);
        }
        self.machine.submit(&coid).await
    }

    async fn run_single(
        &self,
        session: &mut RunSession,
        layer_id: &str,
        snapshot: InputSnapshot,
    ) -> Result<EvidencePack, String> {
        let inputs = inputs_for(session, snapshot);
        let selection = self
            .orchestrator
            .select_profile(layer_id, RUN_REASON)
            .map_err(|e| e.reason_code().to_string())?;
        self.orchestrator
            .run_layer(session, &selection, &inputs)
            .await
            .map_err(|e| e.reason_code().to_string())
    }

    fn finish(&self, session: RunSession, mut report: CycleReport, exec_error: Option<(String, String)>) -> CycleReport {
        report.packs = session.packs();
        if let Some(store) = &self.store {
            let persisted = match store.lock() {
                Ok(mut store) => persist(&mut store, &session, &report, exec_error.as_ref()),
                Err(_) => Err(anyhow::anyhow!("evidence store lock poisoned")),
            };
            if let Err(e) = persisted {
                log(
                    Level::Error,
                    Domain::System,
                    "persist_failed",
                    obj(&[("run_id", v_str(session.run_id())), ("error", v_str(&e.to_string()))]),
                );
            }
        }
        log(
            Level::Info,
            Domain::Orchestrator,
            "cycle_complete",
            obj(&[
                ("run_id", v_str(&report.run_id)),
                ("packs", json!(report.packs.len())),
                ("halted", report.halted.as_deref().map(v_str).unwrap_or(serde_json::Value::Null)),
                ("client_order_id", report.client_order_id.as_deref().map(v_str).unwrap_or(serde_json::Value::Null)),
            ]),
        );
        report
    }

    /// Independent runs on the pool. Layers overlap across runs; gate
    /// evaluation and submission still take turns.
    pub async fn run_many(
        &self,
        pool: &WorkerPool,
        runs: Vec<(String, CycleInput)>,
    ) -> Vec<Option<CycleReport>> {
        let jobs: Vec<_> = runs
            .into_iter()
            .map(|(run_id, input)| {
                let governor = self.clone();
                move || async move { governor.run_cycle(&run_id, &input).await }
            })
            .collect();
        pool.run_all(jobs).await
    }

    /// [`Governor::run_many`] raced against `stop`. On stop the kill switch
    /// is engaged, which cancels in-flight model and venue calls, and the
    /// runs get `grace` to record what they have.
    pub async fn run_many_until(
        &self,
        pool: &WorkerPool,
        runs: Vec<(String, CycleInput)>,
        stop: impl Future<Output = ()>,
        grace: Duration,
    ) -> BatchOutcome {
        let batch = self.run_many(pool, runs);
        tokio::pin!(batch);
        tokio::select! {
            reports = &mut batch => BatchOutcome::Completed(reports),
            _ = stop => {
                self.machine.kill_switch().engage("shutdown requested");
                let reports = tokio::time::timeout(grace, &mut batch).await.ok();
                if reports.is_none() {
                    log(
                        Level::Warn,
                        Domain::System,
                        "shutdown_grace_exceeded",
                        obj(&[("grace_ms", json!(grace.as_millis() as u64))]),
                    );
                }
                BatchOutcome::Stopped { reports }
            }
        }
    }
}

fn persist(
    store: &mut EvidenceStore,
    session: &RunSession,
    report: &CycleReport,
    exec_error: Option<&(String, String)>,
) -> anyhow::Result<()> {
    let packs: Vec<EvidencePack> = session.arena().iter().cloned().collect();
    store.append_packs(&packs)?;
    if let Some(decision) = &report.decision {
        store.append_decision(session.run_id(), decision)?;
    }
    for err in session.errors() {
        store.append_run_error(session.run_id(), &err.layer_id, err.reason_code(), &err.cause.to_string())?;
    }
    if let Some((code, detail)) = exec_error {
        store.append_run_error(session.run_id(), EXECUTION_LAYER, code, detail)?;
    }
    Ok(())
}
