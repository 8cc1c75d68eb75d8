//! Append-only JSONL journal of order revisions.
//!
//! Every state transition writes the full order at its new revision, so
//! recovery is "last revision per client_order_id wins". Lines that fail to
//! parse or carry a stale revision are skipped and counted.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::exec::order_sm::Order;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug)]
pub struct OrderJournal {
    file: File,
    path: PathBuf,
    fsync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum WalEntry {
    #[serde(rename = "revision")]
    Revision {
        ts: u64,
        client_order_id: String,
        revision: u64,
        event: String,
        source: String,
        order: Order,
    },
    #[serde(rename = "escalation")]
    Escalation {
        ts: u64,
        client_order_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryState {
    pub orders: BTreeMap<String, Order>,
    pub escalations: Vec<(String, String)>,
    pub skipped_lines: usize,
}

impl OrderJournal {
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        repair_torn_tail(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path, fsync })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_entry(&mut self, entry: &WalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Read all lines from the journal
    pub fn replay(path: impl AsRef<Path>) -> std::io::Result<Vec<String>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        reader.lines().collect()
    }

    pub fn recover(path: impl AsRef<Path>) -> std::io::Result<RecoveryState> {
        let mut state = RecoveryState::default();
        for line in Self::replay(path)? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(&line) {
                Ok(WalEntry::Revision { client_order_id, revision, order, .. }) => {
                    let newer = state
                        .orders
                        .get(&client_order_id)
                        .map(|prev| revision > prev.revision)
                        .unwrap_or(true);
                    if newer && order.revision == revision && order.client_order_id == client_order_id {
                        state.orders.insert(client_order_id, order);
                    } else {
                        state.skipped_lines += 1;
                    }
                }
                Ok(WalEntry::Escalation { client_order_id, reason, .. }) => {
                    state.escalations.push((client_order_id, reason));
                }
                // a torn final line after a crash lands here
                Err(_) => state.skipped_lines += 1,
            }
        }
        Ok(state)
    }
}

/// Cut a partial final line left by a crash so the next append starts on
/// its own line.
fn repair_torn_tail(path: &Path) -> std::io::Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
    file.set_len(keep as u64)?;
    file.sync_data()?;
    log(
        Level::Warn,
        Domain::System,
        "wal_tail_repaired",
        obj(&[
            ("path", v_str(&path.to_string_lossy())),
            ("dropped_bytes", v_num((bytes.len() - keep) as f64)),
        ]),
    );
    Ok(())
}
