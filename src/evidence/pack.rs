//! Evidence packs: the canonical, hash-stable record of one layer run.
//!
//! A pack is built from a [`PackDraft`] and is immutable afterwards; fields are
//! only reachable through accessors. Corrections are new packs that carry a
//! `supersedes` reference to the pack they replace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{digest_of, sha256_hex};
use crate::error::SchemaMismatch;
use crate::scope::ActionKind;

pub const SCHEMA_VERSION: &str = "evidence_pack.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Blocking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    pub fn new(code: &str, severity: Severity, message: &str) -> Self {
        Self { code: code.to_string(), severity, message: message.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    pub kind: ActionKind,
    #[serde(default)]
    pub detail: Value,
}

impl RecordedAction {
    pub fn new(kind: ActionKind, detail: Value) -> Self {
        Self { kind, detail }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOutputs {
    pub actions: Vec<RecordedAction>,
    pub payload: Value,
}

impl LayerOutputs {
    pub fn action_kinds(&self) -> impl Iterator<Item = &ActionKind> {
        self.actions.iter().map(|a| &a.kind)
    }
}

/// SHA-256 over the canonical form of `{inputs_digest, outputs}`.
pub fn compute_determinism_hash(inputs_digest: &str, outputs: &LayerOutputs) -> Result<String, serde_json::Error> {
    digest_of(&json!({
        "inputs_digest": inputs_digest,
        "outputs": outputs,
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePack {
    pack_id: String,
    schema_version: String,
    layer_id: String,
    run_id: String,
    git_ref: String,
    model_id: String,
    created_at: DateTime<Utc>,
    inputs_digest: String,
    outputs: LayerOutputs,
    determinism_hash: String,
    capability_scope_ref: String,
    findings: Vec<Finding>,
    #[serde(default)]
    supersedes: Option<String>,
}

impl EvidencePack {
    pub fn pack_id(&self) -> &str {
        &self.pack_id
    }
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }
    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn inputs_digest(&self) -> &str {
        &self.inputs_digest
    }
    pub fn outputs(&self) -> &LayerOutputs {
        &self.outputs
    }
    pub fn determinism_hash(&self) -> &str {
        &self.determinism_hash
    }
    pub fn capability_scope_ref(&self) -> &str {
        &self.capability_scope_ref
    }
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }
    pub fn supersedes(&self) -> Option<&str> {
        self.supersedes.as_deref()
    }

    pub fn has_blocking_finding(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Blocking)
    }

    /// Recompute from canonical bytes; never trusts the stored value.
    pub fn recompute_hash(&self) -> Result<String, serde_json::Error> {
        compute_determinism_hash(&self.inputs_digest, &self.outputs)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Draft for a corrected pack. The original stays untouched.
    pub fn correction(&self, outputs: LayerOutputs, findings: Vec<Finding>) -> PackDraft {
        PackDraft {
            layer_id: self.layer_id.clone(),
            run_id: self.run_id.clone(),
            git_ref: self.git_ref.clone(),
            model_id: self.model_id.clone(),
            inputs_digest: self.inputs_digest.clone(),
            outputs,
            capability_scope_ref: self.capability_scope_ref.clone(),
            findings,
            supersedes: Some(self.pack_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackDraft {
    pub layer_id: String,
    pub run_id: String,
    pub git_ref: String,
    pub model_id: String,
    pub inputs_digest: String,
    pub outputs: LayerOutputs,
    pub capability_scope_ref: String,
    pub findings: Vec<Finding>,
    pub supersedes: Option<String>,
}

impl PackDraft {
    /// Hash and freeze. `seq` is the position of this pack within its run.
    pub fn finalize(self, created_at: DateTime<Utc>, seq: u64) -> Result<EvidencePack, SchemaMismatch> {
        let determinism_hash = compute_determinism_hash(&self.inputs_digest, &self.outputs)
            .map_err(|e| SchemaMismatch::new("outputs", e.to_string()))?;
        let id_material = format!("{}|{}|{}|{}", self.run_id, self.layer_id, determinism_hash, seq);
        let pack_id = sha256_hex(id_material.as_bytes())[..32].to_string();
        Ok(EvidencePack {
            pack_id,
            schema_version: SCHEMA_VERSION.to_string(),
            layer_id: self.layer_id,
            run_id: self.run_id,
            git_ref: self.git_ref,
            model_id: self.model_id,
            created_at,
            inputs_digest: self.inputs_digest,
            outputs: self.outputs,
            determinism_hash,
            capability_scope_ref: self.capability_scope_ref,
            findings: self.findings,
            supersedes: self.supersedes,
        })
    }
}

#[cfg(test)]
pub(crate) fn sample_draft(layer_id: &str, payload: Value) -> PackDraft {
    PackDraft {
        layer_id: layer_id.to_string(),
        run_id: "run-1".to_string(),
        git_ref: "deadbeef".to_string(),
        model_id: "digest-summarizer@1".to_string(),
        inputs_digest: sha256_hex(b"inputs"),
        outputs: LayerOutputs {
            actions: vec![RecordedAction::new(ActionKind::ReadMarketData, Value::Null)],
            payload,
        },
        capability_scope_ref: format!("{}@0000", layer_id),
        findings: vec![Finding::new("NOTE", Severity::Info, "ok")],
        supersedes: None,
    }
}
