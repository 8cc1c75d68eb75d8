use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::time::Duration;

use govfx::auth::OperatorAuth;
use govfx::cancel::CancellationToken;
use govfx::config::Config;
use govfx::exec::reconcile::run_periodic;
use govfx::exec::{reconcile_once, ExecutionStateMachine, PaperVenue, ReconcileMode, VenueAdapter};
use govfx::kill_switch::{watch_kill_file, KillSwitch};
use govfx::logging::{log, obj, ts_epoch_ms, v_num, v_str, Domain, Level};
use govfx::operator::Operator;
use govfx::orchestrator::{CapabilitySet, Orchestrator, WorkerPool};
use govfx::pipeline::{
    load_cycle_inputs, BatchOutcome, CycleSettings, Governor, DECISION_LAYERS, EXECUTION_LAYER, GATE_LAYER,
};
use govfx::risk::RiskGate;
use govfx::storage::EvidenceStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("symbol", v_str(&cfg.symbol)),
            ("git_ref", v_str(&cfg.git_ref)),
            ("wal", v_str(&cfg.wal_path)),
            ("sqlite", v_str(&cfg.sqlite_path)),
            ("risk_limits", serde_json::to_value(&cfg.risk)?),
        ]),
    );

    let scopes = Arc::new(cfg.load_scopes()?);
    let registry = cfg.load_registry()?;
    let mut layers: Vec<&str> = DECISION_LAYERS.to_vec();
    layers.extend([GATE_LAYER, EXECUTION_LAYER]);
    let capabilities = CapabilitySet::from_registry(&registry, &layers, cfg.llm_timeout())?;

    let kill_switch = KillSwitch::new(OperatorAuth::new(&cfg.operator_secret));
    let venue: Arc<dyn VenueAdapter> = Arc::new(PaperVenue::new());
    let machine = Arc::new(ExecutionStateMachine::open(
        &cfg.wal_path,
        cfg.wal_fsync,
        venue,
        kill_switch.clone(),
        cfg.exec.clone(),
    )?);
    let startup = reconcile_once(&machine, ReconcileMode::Startup).await;
    if !startup.escalated.is_empty() {
        log(
            Level::Warn,
            Domain::Reconcile,
            "startup_escalations",
            obj(&[("orders", json!(startup.escalated))]),
        );
    }

    let orchestrator = Orchestrator::new(scopes.clone(), Arc::new(registry), Arc::new(capabilities), cfg.invoke_timeout())
        .with_kill_switch(kill_switch.clone());
    let gate = RiskGate::new(cfg.risk.clone(), scopes).with_kill_switch(kill_switch.clone());
    let governor = Governor::new(
        orchestrator,
        gate,
        machine.clone(),
        Some(EvidenceStore::new(&cfg.sqlite_path)?),
        CycleSettings {
            git_ref: cfg.git_ref.clone(),
            symbol: cfg.symbol.clone(),
            auto_approve: cfg.auto_approve,
        },
    );
    let operator = Operator::new(machine.clone());
    let pool = WorkerPool::new(cfg.worker_threads);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_kill_file(
        kill_switch.clone(),
        PathBuf::from(&cfg.kill_file),
        Duration::from_millis(cfg.kill_poll_ms),
        shutdown.clone(),
    ));
    tokio::spawn(run_periodic(
        machine.clone(),
        Duration::from_secs(cfg.reconcile_secs.max(1)),
        shutdown.clone(),
    ));

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.cycle_secs.max(1)));
    let mut cycle: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        if kill_switch.is_engaged() {
            let status = operator.status().await;
            log(
                Level::Warn,
                Domain::KillSwitch,
                "cycle_skipped",
                obj(&[("reason", status.kill_switch.reason.as_deref().map(v_str).unwrap_or_default())]),
            );
            continue;
        }

        let inputs = match load_cycle_inputs(&cfg.inputs_path) {
            Ok(inputs) => inputs,
            Err(e) => {
                log(
                    Level::Warn,
                    Domain::System,
                    "inputs_unavailable",
                    obj(&[("path", v_str(&cfg.inputs_path)), ("error", v_str(&e.to_string()))]),
                );
                continue;
            }
        };

        cycle += 1;
        let runs: Vec<_> = inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| (format!("run-{}-{}-{}", ts_epoch_ms(), cycle, i), input))
            .collect();
        let stop = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let reports = match governor
            .run_many_until(&pool, runs, stop, Duration::from_millis(cfg.shutdown_grace_ms))
            .await
        {
            BatchOutcome::Completed(reports) => reports,
            BatchOutcome::Stopped { reports } => {
                let finished = reports.iter().flatten().flatten().count();
                log(
                    Level::Warn,
                    Domain::System,
                    "cycle_interrupted",
                    obj(&[("cycle", v_num(cycle as f64)), ("finished_runs", v_num(finished as f64))]),
                );
                break;
            }
        };
        let submitted = reports.iter().flatten().filter(|r| r.submitted()).count();

        let status = operator.status().await;
        log(
            Level::Info,
            Domain::System,
            "cycle_summary",
            obj(&[
                ("cycle", v_num(cycle as f64)),
                ("runs", v_num(reports.len() as f64)),
                ("submitted", v_num(submitted as f64)),
                ("orders_by_state", json!(status.orders_by_state)),
                ("escalated", json!(status.escalated)),
            ]),
        );
    }

    shutdown.cancel();
    log(Level::Info, Domain::System, "shutdown", obj(&[("cycles", v_num(cycle as f64))]));
    Ok(())
}
