//! Durable, per-location cache of node outputs.
//!
//! Each persistence location is a single pretty-printed JSON document whose
//! top-level mapping is `node_id -> {name, fingerprint, value, meta}`. The
//! document is readable by plain inspection tools; values are stored in the
//! encoding chosen by the producing kind's `encode` hook.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flow_core::{Fingerprint, NodeId, StoreError};

type Document = BTreeMap<NodeId, StoredEntry>;

/// One persisted node output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Kind name at the time of writing. Only used for sanity warnings when
    /// a graph definition drifts under an existing document.
    pub name: String,
    pub fingerprint: Fingerprint,
    pub value: serde_json::Value,
    pub meta: EntryMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub written_at: DateTime<Utc>,
    /// Wall-clock duration of the `process` call that produced the value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// Content-keyed store mapping node id to its last successful output at the
/// bound location.
///
/// Every `store` rewrites the whole document atomically
/// (write-to-temp-then-rename), so entries are durable the moment the call
/// returns and switching locations never needs a flush.
///
/// With no location bound the store is a purely in-memory cache: lookups
/// and stores work, nothing touches disk, and the entries are dropped on
/// the next `bind`. Batch execution always requires a binding.
#[derive(Default)]
pub struct ValueStore {
    location: Option<PathBuf>,
    loaded: Option<Document>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Designate the active persistence location. O(1); the document is
    /// read lazily on first access.
    pub fn bind(&mut self, location: impl Into<PathBuf>) {
        let location = location.into();
        if self.location.as_deref() != Some(location.as_path()) {
            self.loaded = None;
        }
        self.location = Some(location);
    }

    /// Drop the binding. Subsequent lookups and stores error until `bind`
    /// is called again.
    pub fn unbind(&mut self) {
        self.location = None;
        self.loaded = None;
    }

    pub fn is_bound(&self) -> bool {
        self.location.is_some()
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Return the stored value for `node_id` only if the stored fingerprint
    /// equals `fingerprint` exactly.
    pub fn lookup(
        &mut self,
        node_id: NodeId,
        name: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let entries = self.entries()?;
        match entries.get(&node_id) {
            Some(entry) => {
                if entry.name != name {
                    tracing::warn!(
                        node_id,
                        stored = %entry.name,
                        current = %name,
                        "stored entry was produced by a differently named node"
                    );
                }
                if &entry.fingerprint == fingerprint {
                    Ok(Some(entry.value.clone()))
                } else {
                    tracing::info!(node_id, name, "cache miss: fingerprint changed");
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Persist an output, overwriting any previous entry for this node id
    /// at the current location. Durable before returning.
    pub fn store(
        &mut self,
        node_id: NodeId,
        name: &str,
        fingerprint: Fingerprint,
        value: serde_json::Value,
        elapsed_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let entry = StoredEntry {
            name: name.to_string(),
            fingerprint,
            value,
            meta: EntryMeta {
                written_at: Utc::now(),
                elapsed_ms,
            },
        };
        self.entries()?.insert(node_id, entry);
        self.write()
    }

    /// Remove the entry for this node id at the current location.
    pub fn forget(&mut self, node_id: NodeId) -> Result<(), StoreError> {
        if self.entries()?.remove(&node_id).is_some() {
            self.write()?;
        }
        Ok(())
    }

    fn entries(&mut self) -> Result<&mut Document, StoreError> {
        if self.loaded.is_none() {
            let document = match &self.location {
                Some(location) => {
                    let document = match fs::read(location) {
                        Ok(bytes) => serde_json::from_slice(&bytes)?,
                        Err(err) if err.kind() == io::ErrorKind::NotFound => Document::new(),
                        Err(err) => return Err(err.into()),
                    };
                    tracing::info!(
                        location = %location.display(),
                        entries = document.len(),
                        "loaded persisted outputs"
                    );
                    document
                }
                None => Document::new(),
            };
            self.loaded = Some(document);
        }
        Ok(self.loaded.as_mut().unwrap())
    }

    fn write(&mut self) -> Result<(), StoreError> {
        let Some(location) = self.location.as_ref() else {
            return Ok(());
        };
        let document = self.loaded.as_ref().expect("entries loaded before write");

        let parent = match location.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, document)?;
        tmp.as_file().sync_all()?;
        tmp.persist(location).map_err(|err| err.error)?;
        Ok(())
    }
}
