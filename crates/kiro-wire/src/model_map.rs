//! Model-name normalisation.
//!
//! A hot-reloadable alias table maps vendor-supplied model names to the
//! canonical internal identifier; a whitelist rejects everything else.
//! Admin updates carry the current content hash for optimistic concurrency.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use kiro_core::{store as disk, GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelTable {
    #[serde(default)]
    aliases: HashMap<String, String>,
    #[serde(default)]
    models: Vec<String>,
}

impl Default for ModelTable {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert("claude-sonnet-4".to_string(), "claude-sonnet-4.5".to_string());
        aliases.insert("claude-3-7-sonnet".to_string(), "claude-sonnet-4.5".to_string());
        aliases.insert("gpt-4o".to_string(), "claude-sonnet-4.5".to_string());
        aliases.insert("gpt-4o-mini".to_string(), "claude-haiku-4.5".to_string());
        Self {
            aliases,
            models: vec![
                "claude-sonnet-4.5".to_string(),
                "claude-haiku-4.5".to_string(),
                "claude-opus-4.1".to_string(),
                "auto".to_string(),
            ],
        }
    }
}

struct Snapshot {
    table: ModelTable,
    whitelist: HashSet<String>,
    hash: String,
}

impl Snapshot {
    fn build(table: ModelTable, hash: String) -> Self {
        let whitelist = table.models.iter().cloned().collect();
        Self {
            table,
            whitelist,
            hash,
        }
    }
}

pub struct ModelMap {
    inner: RwLock<Snapshot>,
    path: PathBuf,
}

impl ModelMap {
    /// Load `model-mapping.json`, falling back to the built-in table when
    /// the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (table, hash) = if path.exists() {
            let bytes = std::fs::read(&path)?;
            let table: ModelTable = serde_json::from_slice(&bytes)?;
            let hash = disk::content_hash(&bytes);
            (table, hash)
        } else {
            let table = ModelTable::default();
            let hash = disk::content_hash(&serde_json::to_vec_pretty(&table)?);
            (table, hash)
        };

        Ok(Self {
            inner: RwLock::new(Snapshot::build(table, hash)),
            path,
        })
    }

    /// Resolve a client model name: alias first, then whitelist check.
    /// Unmapped names pass through when whitelisted.
    pub fn resolve(&self, requested: &str) -> Result<String> {
        let snapshot = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let canonical = snapshot
            .table
            .aliases
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested);

        if snapshot.whitelist.contains(canonical) {
            Ok(canonical.to_string())
        } else {
            Err(GatewayError::InvalidModel(requested.to_string()))
        }
    }

    /// Content hash of the current table, for optimistic-concurrency
    /// clients.
    pub fn hash(&self) -> String {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .hash
            .clone()
    }

    /// Replace the table. `supplied_hash` must match the current hash or
    /// the write is rejected with a conflict and nothing changes.
    pub fn apply_update(&self, raw_json: &str, supplied_hash: &str) -> Result<()> {
        let table: ModelTable = serde_json::from_str(raw_json)
            .map_err(|e| GatewayError::InvalidRequest(format!("model mapping JSON: {e}")))?;

        let mut snapshot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if snapshot.hash != supplied_hash {
            return Err(GatewayError::Conflict(format!(
                "model mapping hash mismatch: current {}",
                snapshot.hash
            )));
        }

        disk::write_json_atomic(&self.path, &table)?;
        let bytes = std::fs::read(&self.path)?;
        *snapshot = Snapshot::build(table, disk::content_hash(&bytes));
        info!(hash = %snapshot.hash, "model mapping updated");
        Ok(())
    }

    /// Pick up an on-disk edit if the content hash changed.
    pub fn reload_if_changed(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(&self.path)?;
        let hash = disk::content_hash(&bytes);
        {
            let snapshot = self
                .inner
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if snapshot.hash == hash {
                return Ok(false);
            }
        }
        let table: ModelTable = serde_json::from_slice(&bytes)?;
        let mut snapshot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *snapshot = Snapshot::build(table, hash);
        info!(hash = %snapshot.hash, "model mapping reloaded from disk");
        Ok(true)
    }
}
