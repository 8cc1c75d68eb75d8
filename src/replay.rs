//! Replay determinism validation: two independent evaluations of the same
//! inputs must produce byte-identical canonical output.

use serde::{Deserialize, Serialize};

use crate::canonical::digest_of;
use crate::evidence::{schema, EvidencePack};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::risk::RiskGateDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayResult {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCause {
    HashMismatch,
    UnsupportedSchema,
    SchemaVersionMismatch,
    StoredHashMismatch,
    Unhashable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub subject: String,
    pub result: ReplayResult,
    pub baseline_hash: String,
    pub candidate_hash: String,
    pub causes: Vec<FailureCause>,
    /// Digest of every field above.
    pub report_hash: String,
}

impl ReplayReport {
    fn build(subject: &str, baseline_hash: String, candidate_hash: String, causes: Vec<FailureCause>) -> Self {
        let result = if causes.is_empty() { ReplayResult::Pass } else { ReplayResult::Fail };
        let report_hash = digest_of(&(subject, result, &baseline_hash, &candidate_hash, &causes)).unwrap_or_default();
        let report = Self {
            subject: subject.to_string(),
            result,
            baseline_hash,
            candidate_hash,
            causes,
            report_hash,
        };
        log(
            if report.passed() { Level::Info } else { Level::Warn },
            Domain::Replay,
            "compare",
            obj(&[
                ("subject", v_str(&report.subject)),
                ("result", v_str(if report.passed() { "PASS" } else { "FAIL" })),
                ("baseline_hash", v_str(&report.baseline_hash)),
                ("candidate_hash", v_str(&report.candidate_hash)),
                ("report_hash", v_str(&report.report_hash)),
            ]),
        );
        report
    }

    pub fn passed(&self) -> bool {
        self.result == ReplayResult::Pass
    }
}

/// Side-effect free. Inputs are borrowed and never modified.
pub fn compare(baseline: &EvidencePack, candidate: &EvidencePack) -> ReplayReport {
    let mut causes = Vec::new();

    let baseline_hash = baseline.recompute_hash();
    let candidate_hash = candidate.recompute_hash();
    let (baseline_hash, candidate_hash) = match (baseline_hash, candidate_hash) {
        (Ok(b), Ok(c)) => (b, c),
        (b, c) => {
            causes.push(FailureCause::Unhashable);
            (b.unwrap_or_default(), c.unwrap_or_default())
        }
    };

    if !schema::is_supported(baseline.schema_version()) || !schema::is_supported(candidate.schema_version()) {
        causes.push(FailureCause::UnsupportedSchema);
    } else if baseline.schema_version() != candidate.schema_version() {
        causes.push(FailureCause::SchemaVersionMismatch);
    }
    if baseline_hash != baseline.determinism_hash() || candidate_hash != candidate.determinism_hash() {
        causes.push(FailureCause::StoredHashMismatch);
    }
    if baseline_hash != candidate_hash {
        causes.push(FailureCause::HashMismatch);
    }

    ReplayReport::build(baseline.layer_id(), baseline_hash, candidate_hash, causes)
}

/// Two gate decisions for the same inputs must agree on status, reasons and
/// the inputs digest. `as_of_utc` and `gate_id` legitimately differ between
/// evaluations and are excluded.
pub fn compare_decisions(baseline: &RiskGateDecision, candidate: &RiskGateDecision) -> ReplayReport {
    let material = |d: &RiskGateDecision| digest_of(&(d.status, &d.reasons, &d.inputs_snapshot_digest));
    let mut causes = Vec::new();
    let (b, c) = match (material(baseline), material(candidate)) {
        (Ok(b), Ok(c)) => (b, c),
        (b, c) => {
            causes.push(FailureCause::Unhashable);
            (b.unwrap_or_default(), c.unwrap_or_default())
        }
    };
    if b != c {
        causes.push(FailureCause::HashMismatch);
    }
    ReplayReport::build("risk_gate", b, c, causes)
}
