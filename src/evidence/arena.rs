//! Append-only arena of immutable packs. Supersession is tracked by index,
//! never by rewriting the superseded pack.

use std::collections::HashMap;

use thiserror::Error;

use super::pack::EvidencePack;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("pack {0} already recorded")]
    DuplicatePack(String),
    #[error("superseded pack {0} not found")]
    MissingSuperseded(String),
    #[error("pack {pack_id} already superseded by {by}")]
    AlreadySuperseded { pack_id: String, by: String },
    #[error("correction for {pack_id} targets another layer")]
    LayerMismatch { pack_id: String },
}

#[derive(Debug, Default)]
pub struct EvidenceArena {
    packs: Vec<EvidencePack>,
    index: HashMap<String, usize>,
    superseded_by: HashMap<usize, usize>,
}

impl EvidenceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, pack: EvidencePack) -> Result<usize, ArenaError> {
        if self.index.contains_key(pack.pack_id()) {
            return Err(ArenaError::DuplicatePack(pack.pack_id().to_string()));
        }
        let slot = self.packs.len();
        if let Some(prev_id) = pack.supersedes() {
            let prev = *self
                .index
                .get(prev_id)
                .ok_or_else(|| ArenaError::MissingSuperseded(prev_id.to_string()))?;
            if let Some(by) = self.superseded_by.get(&prev) {
                return Err(ArenaError::AlreadySuperseded {
                    pack_id: prev_id.to_string(),
                    by: self.packs[*by].pack_id().to_string(),
                });
            }
            if self.packs[prev].layer_id() != pack.layer_id() {
                return Err(ArenaError::LayerMismatch { pack_id: prev_id.to_string() });
            }
            self.superseded_by.insert(prev, slot);
        }
        self.index.insert(pack.pack_id().to_string(), slot);
        self.packs.push(pack);
        Ok(slot)
    }

    pub fn get(&self, pack_id: &str) -> Option<&EvidencePack> {
        self.index.get(pack_id).map(|i| &self.packs[*i])
    }

    pub fn is_superseded(&self, pack_id: &str) -> bool {
        self.index
            .get(pack_id)
            .map(|i| self.superseded_by.contains_key(i))
            .unwrap_or(false)
    }

    /// Follow the supersession chain to the newest pack.
    pub fn latest(&self, pack_id: &str) -> Option<&EvidencePack> {
        let mut slot = *self.index.get(pack_id)?;
        while let Some(next) = self.superseded_by.get(&slot) {
            slot = *next;
        }
        Some(&self.packs[slot])
    }

    /// Newest non-superseded pack for a layer.
    pub fn head_for_layer(&self, layer_id: &str) -> Option<&EvidencePack> {
        self.packs
            .iter()
            .enumerate()
            .rev()
            .find(|(i, p)| p.layer_id() == layer_id && !self.superseded_by.contains_key(i))
            .map(|(_, p)| p)
    }

    pub fn heads(&self) -> Vec<&EvidencePack> {
        self.packs
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.superseded_by.contains_key(i))
            .map(|(_, p)| p)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvidencePack> {
        self.packs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::pack::{sample_draft, Finding, Severity};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_supersession_chain() {
        let mut arena = EvidenceArena::new();
        let first = sample_draft("research", json!({"v": 1})).finalize(Utc::now(), 0).unwrap();
        let first_id = first.pack_id().to_string();
        arena.append(first.clone()).unwrap();

        let second = first
            .correction(first.outputs().clone(), vec![Finding::new("FIX", Severity::Warn, "restated")])
            .finalize(Utc::now(), 1)
            .unwrap();
        let second_id = second.pack_id().to_string();
        arena.append(second).unwrap();

        assert!(arena.is_superseded(&first_id));
        assert_eq!(arena.latest(&first_id).unwrap().pack_id(), second_id);
        assert_eq!(arena.head_for_layer("research").unwrap().pack_id(), second_id);
        // original is still readable and unchanged
        assert_eq!(arena.get(&first_id).unwrap(), &first);
        assert_eq!(arena.heads().len(), 1);
    }

    #[test]
    fn test_double_supersession_rejected() {
        let mut arena = EvidenceArena::new();
        let first = sample_draft("research", json!({"v": 1})).finalize(Utc::now(), 0).unwrap();
        arena.append(first.clone()).unwrap();
        let a = first.correction(first.outputs().clone(), vec![]).finalize(Utc::now(), 1).unwrap();
        let b = first.correction(first.outputs().clone(), vec![]).finalize(Utc::now(), 2).unwrap();
        arena.append(a).unwrap();
        let err = arena.append(b).unwrap_err();
        assert!(matches!(err, ArenaError::AlreadySuperseded { .. }));
        assert!(err.to_string().starts_with(&format!("pack {} already superseded by ", first.pack_id())));
        let _: anyhow::Error = err.into();
    }

    #[test]
    fn test_duplicate_and_missing_rejected() {
        let mut arena = EvidenceArena::new();
        let p = sample_draft("research", json!({})).finalize(Utc::now(), 0).unwrap();
        arena.append(p.clone()).unwrap();
        assert!(matches!(arena.append(p), Err(ArenaError::DuplicatePack(_))));

        let mut orphan = sample_draft("research", json!({"o": 1}));
        orphan.supersedes = Some("f".repeat(32));
        let orphan = orphan.finalize(Utc::now(), 5).unwrap();
        assert!(matches!(arena.append(orphan), Err(ArenaError::MissingSuperseded(_))));
    }
}
