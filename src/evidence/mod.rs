pub mod arena;
pub mod inputs;
pub mod pack;
pub mod schema;

pub use arena::{ArenaError, EvidenceArena};
pub use inputs::{InputSnapshot, LayerInputs, UpstreamRef};
pub use pack::{EvidencePack, Finding, LayerOutputs, PackDraft, RecordedAction, Severity, SCHEMA_VERSION};
