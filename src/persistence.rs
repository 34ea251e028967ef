use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::session::{ConversationRecord, DEFAULT_INSTRUCTION};

/// Everything written to the state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    #[serde(rename = "files_data")]
    pub files: BTreeMap<String, ConversationRecord>,
    #[serde(rename = "user_general_instruction")]
    pub instruction: String,
    #[serde(rename = "api_key")]
    pub credential: String,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            files: BTreeMap::new(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            credential: String::new(),
        }
    }
}

/// Write the snapshot as indented JSON, replacing whatever was there
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    // Ensure directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize session state")?;

    // Whole-file overwrite, no temp file
    fs::write(path, json)
        .with_context(|| format!("Failed to write state file: {}", path.display()))?;

    Ok(())
}

/// Read a snapshot. A missing file is `Ok(None)`.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    // Cold start
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;

    let snapshot: Snapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

    Ok(Some(snapshot))
}

/// Best-effort save. Returns false (after logging) when the write failed.
pub fn flush(path: &Path, snapshot: &Snapshot) -> bool {
    match save_snapshot(path, snapshot) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to save session state: {:#}", e);
            false
        }
    }
}

/// Best-effort load. `None` means there was nothing to load; an unreadable
/// file yields the default snapshot.
pub fn restore(path: &Path) -> Option<Snapshot> {
    match load_snapshot(path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Failed to load session state: {:#}. Starting with defaults.", e);
            Some(Snapshot::default())
        }
    }
}
