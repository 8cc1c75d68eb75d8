use std::env;

use govfx::config::Config;
use govfx::storage::EvidenceStore;
use govfx::wal::OrderJournal;
use serde_json::json;

fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    let store = EvidenceStore::new(&cfg.sqlite_path)?;
    let runs = match env::args().nth(1) {
        Some(run_id) => vec![run_id],
        None => store.recent_runs(5)?,
    };

    let mut out = Vec::new();
    for run_id in runs {
        let packs = store.packs_for_run(&run_id)?;
        let packs: Vec<_> = packs
            .iter()
            .map(|p| {
                json!({
                    "pack_id": p.pack_id(),
                    "layer_id": p.layer_id(),
                    "model_id": p.model_id(),
                    "created_at": p.created_at(),
                    "determinism_hash": p.determinism_hash(),
                    "hash_ok": p.recompute_hash().map(|h| h == p.determinism_hash()).unwrap_or(false),
                    "findings": p.findings(),
                    "supersedes": p.supersedes(),
                })
            })
            .collect();
        out.push(json!({
            "run_id": run_id,
            "packs": packs,
            "decisions": store.decisions_for_run(&run_id)?,
            "errors": store.errors_for_run(&run_id)?,
        }));
    }

    let recovered = OrderJournal::recover(&cfg.wal_path)?;
    let orders: Vec<_> = recovered
        .orders
        .values()
        .map(|o| {
            json!({
                "client_order_id": o.client_order_id,
                "state": o.state,
                "revision": o.revision,
                "filled_qty": o.filled_qty,
                "escalated": o.escalated,
                "gate_id": o.gate_id,
            })
        })
        .collect();

    let payload = json!({
        "runs": out,
        "orders": orders,
        "escalations": recovered.escalations,
        "wal_skipped_lines": recovered.skipped_lines,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
