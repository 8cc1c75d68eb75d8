use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::digest_of;

/// Read-only snapshot of an upstream data source. The core never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub source: String,
    pub as_of: DateTime<Utc>,
    pub data: Value,
}

impl InputSnapshot {
    pub fn new(source: &str, as_of: DateTime<Utc>, data: Value) -> Self {
        Self { source: source.to_string(), as_of, data }
    }

    pub fn digest(&self) -> String {
        digest_of(self).unwrap_or_default()
    }
}

/// Reference to an upstream pack by content, not by identity, so replays
/// under a different run id digest identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRef {
    pub layer_id: String,
    pub determinism_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInputs {
    pub snapshot: InputSnapshot,
    #[serde(default)]
    pub upstream: Vec<UpstreamRef>,
}

impl LayerInputs {
    pub fn new(snapshot: InputSnapshot) -> Self {
        Self { snapshot, upstream: Vec::new() }
    }

    pub fn with_upstream(mut self, layer_id: &str, determinism_hash: &str) -> Self {
        self.upstream.push(UpstreamRef {
            layer_id: layer_id.to_string(),
            determinism_hash: determinism_hash.to_string(),
        });
        self
    }

    pub fn digest(&self) -> String {
        digest_of(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_upstream_changes_digest() {
        let as_of = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
        let base = LayerInputs::new(InputSnapshot::new("md", as_of, json!({"symbol": "NQ"})));
        let chained = base.clone().with_upstream("research", "ab");
        assert_ne!(base.digest(), chained.digest());
        assert_eq!(base.digest(), base.clone().digest());
    }
}
