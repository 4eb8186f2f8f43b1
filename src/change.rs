//! Change record model and persistence wrappers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{ActorId, Fields, Revision, RowKey, Table};

/// Version number for serialized [`ChangeEnvelope`] payloads.
pub const CHANGE_FORMAT_VERSION: u16 = 1;

/// Kind of row mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Row was created; payload is the full snapshot.
    Insert,
    /// Row was modified; payload holds only the changed fields.
    Update,
    /// Row was removed; no payload.
    Delete,
}

impl ChangeKind {
    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable changelog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Globally unique record id.
    pub id: Uuid,
    /// Position in the global log.
    pub revision: Revision,
    /// Who caused the change.
    pub actor: ActorId,
    /// Affected table.
    pub table: Table,
    /// Affected row.
    pub key: RowKey,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Full snapshot for inserts, changed fields for updates, `None` for deletes.
    pub payload: Option<Fields>,
    /// Wall-clock append time in milliseconds. Informational only.
    pub ts_ms: u64,
}

impl ChangeRecord {
    /// The record itself as a row of [`Table::Changelog`].
    pub fn as_fields(&self) -> Fields {
        let mut f = Fields::new();
        f.insert("id".to_string(), Value::from(self.id.to_string()));
        f.insert("revision".to_string(), Value::from(self.revision));
        f.insert("actor".to_string(), Value::from(self.actor.as_str()));
        f.insert("table".to_string(), Value::from(self.table.as_str()));
        f.insert("key".to_string(), Value::from(self.key.clone()));
        f.insert("kind".to_string(), Value::from(self.kind.as_str()));
        f.insert(
            "payload".to_string(),
            self.payload.clone().map(Value::Object).unwrap_or(Value::Null),
        );
        f.insert("ts_ms".to_string(), Value::from(self.ts_ms));
        f
    }

    /// Wraps this record as a literal insert into [`Table::Changelog`].
    pub fn as_changelog_insert(&self) -> ChangeRecord {
        ChangeRecord {
            id: self.id,
            revision: self.revision,
            actor: self.actor.clone(),
            table: Table::Changelog,
            key: self.id.to_string(),
            kind: ChangeKind::Insert,
            payload: Some(self.as_fields()),
            ts_ms: self.ts_ms,
        }
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped record.
    pub record: ChangeRecord,
}

impl ChangeEnvelope {
    /// Constructs an envelope using [`CHANGE_FORMAT_VERSION`].
    pub fn new(record: ChangeRecord) -> Self {
        Self {
            format_version: CHANGE_FORMAT_VERSION,
            record,
        }
    }
}

/// Fields present on either side whose values differ, carrying the new value.
///
/// A field missing from `new` is reported as `null`.
pub fn diff_fields(old: &Fields, new: &Fields) -> Fields {
    let mut out = Fields::new();
    for (name, value) in new {
        if old.get(name) != Some(value) {
            out.insert(name.clone(), value.clone());
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            out.insert(name.clone(), Value::Null);
        }
    }
    out
}

/// Overwrites the keys of `base` with every key present in `patch`.
pub fn overlay_fields(base: &mut Fields, patch: &Fields) {
    for (name, value) in patch {
        base.insert(name.clone(), value.clone());
    }
}
