//! Acceptance checks run on every pack before it is stored or consumed.

use serde_json::Value;

use crate::error::{SchemaMismatch, ScopeViolation};
use crate::scope::ScopeTable;

use super::pack::{EvidencePack, SCHEMA_VERSION};

pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &[SCHEMA_VERSION];

pub fn is_supported(version: &str) -> bool {
    SUPPORTED_SCHEMA_VERSIONS.contains(&version)
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Structural validation. Does not consult scopes.
pub fn validate(pack: &EvidencePack) -> Result<(), SchemaMismatch> {
    if !is_supported(pack.schema_version()) {
        return Err(SchemaMismatch::new(
            "schema_version",
            format!("unsupported version {}", pack.schema_version()),
        ));
    }
    if !is_hex(pack.pack_id(), 32) {
        return Err(SchemaMismatch::new("pack_id", "expected 32 lowercase hex chars"));
    }
    for (field, value) in [
        ("layer_id", pack.layer_id()),
        ("run_id", pack.run_id()),
        ("model_id", pack.model_id()),
        ("capability_scope_ref", pack.capability_scope_ref()),
    ] {
        if value.trim().is_empty() {
            return Err(SchemaMismatch::new(field, "must not be empty"));
        }
    }
    if !is_hex(pack.inputs_digest(), 64) {
        return Err(SchemaMismatch::new("inputs_digest", "expected sha256 hex"));
    }
    if !is_hex(pack.determinism_hash(), 64) {
        return Err(SchemaMismatch::new("determinism_hash", "expected sha256 hex"));
    }
    let recomputed = pack
        .recompute_hash()
        .map_err(|e| SchemaMismatch::new("outputs", e.to_string()))?;
    if recomputed != pack.determinism_hash() {
        return Err(SchemaMismatch::new("determinism_hash", "stored hash does not match canonical outputs"));
    }
    if let Some(prev) = pack.supersedes() {
        if prev == pack.pack_id() {
            return Err(SchemaMismatch::new("supersedes", "pack cannot supersede itself"));
        }
    }
    Ok(())
}

/// Every recorded action must be inside the originating layer's scope, and
/// the pack must reference the scope that is loaded now.
pub fn check_scope(pack: &EvidencePack, scopes: &ScopeTable) -> Result<(), ScopeViolation> {
    scopes.authorize_all(pack.layer_id(), pack.outputs().action_kinds())?;
    let loaded = scopes.get(pack.layer_id()).map(|s| s.scope_ref()).unwrap_or_default();
    if loaded != pack.capability_scope_ref() {
        return Err(ScopeViolation::StaleScopeRef {
            layer_id: pack.layer_id().to_string(),
            recorded: pack.capability_scope_ref().to_string(),
            loaded,
        });
    }
    Ok(())
}

/// Parse and validate a pack read from disk or the wire.
pub fn parse(value: Value) -> Result<EvidencePack, SchemaMismatch> {
    let version = value
        .get("schema_version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SchemaMismatch::new("schema_version", "missing"))?;
    if !is_supported(version) {
        return Err(SchemaMismatch::new("schema_version", format!("unsupported version {}", version)));
    }
    let pack: EvidencePack =
        serde_json::from_value(value).map_err(|e| SchemaMismatch::new("pack", e.to_string()))?;
    validate(&pack)?;
    Ok(pack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::pack::sample_draft;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_fresh_pack_validates() {
        let pack = sample_draft("research", json!({"a": 1})).finalize(Utc::now(), 0).unwrap();
        assert!(validate(&pack).is_ok());
    }

    #[test]
    fn test_tampered_outputs_rejected() {
        let pack = sample_draft("research", json!({"a": 1})).finalize(Utc::now(), 0).unwrap();
        let mut v = serde_json::to_value(&pack).unwrap();
        v["outputs"]["payload"]["a"] = json!(2);
        let err = parse(v).unwrap_err();
        assert_eq!(err.field, "determinism_hash");
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let pack = sample_draft("research", json!({})).finalize(Utc::now(), 0).unwrap();
        let mut v = serde_json::to_value(&pack).unwrap();
        v["schema_version"] = json!("evidence_pack.v0");
        assert_eq!(parse(v).unwrap_err().field, "schema_version");
    }

    #[test]
    fn test_scope_check_flags_out_of_scope_action() {
        let scopes = ScopeTable::default_pipeline();
        let mut draft = sample_draft("research", json!({}));
        draft.outputs.actions.push(crate::evidence::pack::RecordedAction::new(
            crate::scope::ActionKind::SubmitOrder,
            json!(null),
        ));
        let pack = draft.finalize(Utc::now(), 0).unwrap();
        assert!(check_scope(&pack, &scopes).is_err());
    }

    #[test]
    fn test_scope_check_flags_pack_from_other_scope_version() {
        let scopes = ScopeTable::default_pipeline();
        let stale = sample_draft("research", json!({})).finalize(Utc::now(), 0).unwrap();
        let err = check_scope(&stale, &scopes).unwrap_err();
        assert_eq!(err.reason_code(), "STALE_SCOPE_REF");

        let mut draft = sample_draft("research", json!({}));
        draft.capability_scope_ref = scopes.get("research").unwrap().scope_ref();
        let current = draft.finalize(Utc::now(), 0).unwrap();
        assert!(check_scope(&current, &scopes).is_ok());
    }
}
