//! State types for tracking applied resources.
//!
//! These types represent the last-applied state of each resource, used by the
//! diff engine and persisted by the apply executor after every successful
//! per-resource operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::ConfigHasher;
use crate::model::{Address, AttrMap, ID_OUTPUT};

/// Current version of the state record format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of run history entries kept.
pub const MAX_HISTORY: usize = 100;

/// Every recorded resource, keyed by address.
pub type StateSnapshot = BTreeMap<Address, StateRecord>;

/// Last-applied state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    /// Record format version.
    pub version: String,
    /// Resource address.
    pub address: Address,
    /// Provider that manages the object.
    pub provider: String,
    /// Provider-assigned identifier.
    pub id: String,
    /// Resolved attributes as last applied (or refreshed).
    pub attributes: AttrMap,
    /// Outputs exported by the provider.
    #[serde(default)]
    pub outputs: AttrMap,
    /// Addresses this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<Address>,
    /// Old objects awaiting destruction after a create-before-destroy.
    #[serde(default)]
    pub deposed: Vec<DeposedObject>,
    /// Hash of `attributes`.
    pub attributes_hash: String,
    /// When the object was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// An object replaced by create-before-destroy whose destroy is pending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeposedObject {
    /// Provider-assigned identifier of the old object.
    pub id: String,
    /// Attributes the old object was created with.
    pub attributes: AttrMap,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// Unique run identifier.
    pub run_id: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Declaration hash at time of the run.
    pub config_hash: String,
    /// Resources changed successfully.
    pub applied: Vec<String>,
    /// Resources whose operation failed.
    #[serde(default)]
    pub failed: Vec<String>,
    /// Resources skipped or cancelled.
    #[serde(default)]
    pub skipped: Vec<String>,
    /// Whether every step succeeded.
    pub success: bool,
    /// First failure message, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Reconcile towards the declaration.
    Apply,
    /// Tear down recorded resources.
    Destroy,
}

impl StateRecord {
    /// Creates a record for a freshly created object.
    #[must_use]
    pub fn new(
        address: Address,
        provider: &str,
        id: &str,
        attributes: AttrMap,
        outputs: AttrMap,
        dependencies: Vec<Address>,
    ) -> Self {
        let now = Utc::now();
        let attributes_hash = ConfigHasher::new().hash_attributes(&attributes);
        Self {
            version: STATE_VERSION.to_string(),
            address,
            provider: provider.to_string(),
            id: id.to_string(),
            attributes,
            outputs,
            dependencies,
            deposed: Vec::new(),
            attributes_hash,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the recorded attributes and refreshes the hash.
    pub fn set_attributes(&mut self, attributes: AttrMap) {
        self.attributes_hash = ConfigHasher::new().hash_attributes(&attributes);
        self.attributes = attributes;
        self.updated_at = Utc::now();
    }

    /// Returns an exported output. `id` always resolves to the object id.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<serde_json::Value> {
        if name == ID_OUTPUT {
            return Some(serde_json::Value::String(self.id.clone()));
        }
        self.outputs.get(name).cloned()
    }

    /// Returns true if the recorded attributes still match their hash.
    #[must_use]
    pub fn hash_matches(&self) -> bool {
        ConfigHasher::hashes_match(
            &ConfigHasher::new().hash_attributes(&self.attributes),
            &self.attributes_hash,
        )
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, config_hash: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            applied: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            success: true,
            error: None,
        }
    }
}

/// Appends an entry, dropping the oldest beyond [`MAX_HISTORY`].
pub fn push_bounded(history: &mut Vec<RunHistoryEntry>, entry: RunHistoryEntry) {
    history.push(entry);
    if history.len() > MAX_HISTORY {
        let excess = history.len() - MAX_HISTORY;
        history.drain(..excess);
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> StateRecord {
        StateRecord::new(
            Address::new("queue", "hashes"),
            "memory",
            "q-1",
            AttrMap::from([(String::from("name"), json!("hashes"))]),
            AttrMap::from([(String::from("arn"), json!("arn:q-1"))]),
            vec![],
        )
    }

    #[test]
    fn test_output_lookup() {
        let r = record();
        assert_eq!(r.output("id"), Some(json!("q-1")));
        assert_eq!(r.output("arn"), Some(json!("arn:q-1")));
        assert_eq!(r.output("url"), None);
    }

    #[test]
    fn test_set_attributes_updates_hash() {
        let mut r = record();
        let before = r.attributes_hash.clone();
        r.set_attributes(AttrMap::from([(String::from("name"), json!("other"))]));
        assert_ne!(before, r.attributes_hash);
        assert!(r.hash_matches());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = Vec::new();
        for _ in 0..(MAX_HISTORY + 5) {
            push_bounded(&mut history, RunHistoryEntry::new(RunOperation::Apply, "h"));
        }
        assert_eq!(history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_record_json_roundtrip() {
        let r = record();
        let json = serde_json::to_string(&r).expect("serialize");
        let back: StateRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, r);
    }
}
