//! Append-only sqlite store for evidence packs, gate decisions and run errors.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::evidence::{schema, EvidencePack};
use crate::logging::ts_now;
use crate::risk::RiskGateDecision;

pub struct EvidenceStore {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunErrorRow {
    pub run_id: String,
    pub layer_id: String,
    pub reason_code: String,
    pub detail: String,
    pub ts: String,
}

impl EvidenceStore {
    pub fn new(path: &str) -> Result<Self> {
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS evidence_packs (
                pack_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                layer_id TEXT NOT NULL,
                schema_version TEXT NOT NULL,
                created_at TEXT NOT NULL,
                determinism_hash TEXT NOT NULL,
                supersedes TEXT,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS evidence_packs_run ON evidence_packs (run_id, layer_id);
            CREATE TABLE IF NOT EXISTS risk_decisions (
                gate_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                status TEXT NOT NULL,
                reasons TEXT NOT NULL,
                as_of_utc TEXT NOT NULL,
                inputs_snapshot_digest TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_errors (
                run_id TEXT NOT NULL,
                layer_id TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                detail TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE TRIGGER IF NOT EXISTS evidence_packs_no_update BEFORE UPDATE ON evidence_packs
                BEGIN SELECT RAISE(ABORT, 'evidence_packs is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS evidence_packs_no_delete BEFORE DELETE ON evidence_packs
                BEGIN SELECT RAISE(ABORT, 'evidence_packs is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS risk_decisions_no_update BEFORE UPDATE ON risk_decisions
                BEGIN SELECT RAISE(ABORT, 'risk_decisions is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS risk_decisions_no_delete BEFORE DELETE ON risk_decisions
                BEGIN SELECT RAISE(ABORT, 'risk_decisions is append-only'); END;
            COMMIT;",
        )?;
        Ok(())
    }

    /// Validates before writing; an invalid pack is never stored.
    pub fn append_packs(&mut self, packs: &[EvidencePack]) -> Result<()> {
        for pack in packs {
            schema::validate(pack).map_err(|e| anyhow!("pack {}: {}", pack.pack_id(), e))?;
        }
        let tx = self.conn.transaction()?;
        for pack in packs {
            tx.execute(
                "INSERT INTO evidence_packs (pack_id, run_id, layer_id, schema_version, created_at, determinism_hash, supersedes, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    pack.pack_id(),
                    pack.run_id(),
                    pack.layer_id(),
                    pack.schema_version(),
                    pack.created_at().to_rfc3339(),
                    pack.determinism_hash(),
                    pack.supersedes(),
                    pack.to_json()?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_decision(&mut self, run_id: &str, decision: &RiskGateDecision) -> Result<()> {
        self.conn.execute(
            "INSERT INTO risk_decisions (gate_id, run_id, status, reasons, as_of_utc, inputs_snapshot_digest, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                decision.gate_id,
                run_id,
                decision.status.as_str(),
                serde_json::to_string(&decision.reason_strings())?,
                decision.as_of_utc.to_rfc3339(),
                decision.inputs_snapshot_digest,
                serde_json::to_string(decision)?,
            ],
        )?;
        Ok(())
    }

    pub fn append_run_error(&mut self, run_id: &str, layer_id: &str, reason_code: &str, detail: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO run_errors (run_id, layer_id, reason_code, detail, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, layer_id, reason_code, detail, ts_now()],
        )?;
        Ok(())
    }

    /// Packs of a run in insertion order, re-validated on the way out.
    pub fn packs_for_run(&self, run_id: &str) -> Result<Vec<EvidencePack>> {
        let mut stmt = self.conn.prepare("SELECT body FROM evidence_packs WHERE run_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            let value: serde_json::Value = serde_json::from_str(&body?)?;
            out.push(schema::parse(value)?);
        }
        Ok(out)
    }

    pub fn pack(&self, pack_id: &str) -> Result<Option<EvidencePack>> {
        let mut stmt = self.conn.prepare("SELECT body FROM evidence_packs WHERE pack_id = ?1")?;
        let mut rows = stmt.query(params![pack_id])?;
        match rows.next()? {
            Some(row) => {
                let body: String = row.get(0)?;
                Ok(Some(schema::parse(serde_json::from_str(&body)?)?))
            }
            None => Ok(None),
        }
    }

    pub fn decisions_for_run(&self, run_id: &str) -> Result<Vec<RiskGateDecision>> {
        let mut stmt = self.conn.prepare("SELECT body FROM risk_decisions WHERE run_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    pub fn errors_for_run(&self, run_id: &str) -> Result<Vec<RunErrorRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_id, layer_id, reason_code, detail, ts FROM run_errors WHERE run_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(RunErrorRow {
                run_id: row.get(0)?,
                layer_id: row.get(1)?,
                reason_code: row.get(2)?,
                detail: row.get(3)?,
                ts: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent run ids across packs and errors, newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id FROM (
                SELECT run_id, MAX(rowid) AS r FROM evidence_packs GROUP BY run_id
             ) ORDER BY r DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::pack::sample_draft;
    use crate::risk::{GateStatus, ReasonCode};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn pack(run: &str, seq: u64) -> EvidencePack {
        let mut draft = sample_draft("research", json!({"seq": seq}));
        draft.run_id = run.to_string();
        draft.finalize(Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap(), seq).unwrap()
    }

    #[test]
    fn test_packs_roundtrip_in_order() {
        let mut store = EvidenceStore::in_memory().unwrap();
        let packs = vec![pack("run-1", 0), pack("run-1", 1), pack("run-2", 0)];
        store.append_packs(&packs).unwrap();
        let back = store.packs_for_run("run-1").unwrap();
        assert_eq!(back, packs[..2].to_vec());
        assert_eq!(store.pack(packs[2].pack_id()).unwrap().as_ref(), Some(&packs[2]));
        assert_eq!(store.recent_runs(5).unwrap(), vec!["run-2".to_string(), "run-1".to_string()]);
    }

    #[test]
    fn test_store_is_append_only() {
        let mut store = EvidenceStore::in_memory().unwrap();
        let p = pack("run-1", 0);
        store.append_packs(&[p.clone()]).unwrap();
        assert!(store.append_packs(&[p]).is_err());
        assert!(store.conn.execute("DELETE FROM evidence_packs", []).is_err());
        assert!(store.conn.execute("UPDATE evidence_packs SET layer_id = 'x'", []).is_err());
    }

    #[test]
    fn test_decisions_and_errors() {
        let mut store = EvidenceStore::in_memory().unwrap();
        let d = RiskGateDecision {
            gate_id: "gate-1".into(),
            status: GateStatus::Block,
            reasons: vec![ReasonCode::MaxTradesPerDay],
            as_of_utc: Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap(),
            inputs_snapshot_digest: "abc".into(),
        };
        store.append_decision("run-1", &d).unwrap();
        store.append_run_error("run-1", "research", "MODEL_TIMEOUT", "30000 ms").unwrap();
        assert_eq!(store.decisions_for_run("run-1").unwrap(), vec![d]);
        let errs = store.errors_for_run("run-1").unwrap();
        assert_eq!(errs[0].reason_code, "MODEL_TIMEOUT");
    }
}
