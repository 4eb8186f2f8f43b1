use hashbrown::{HashMap, HashSet};

use crate::{
    change::{ChangeKind, ChangeRecord, overlay_fields},
    core::indices::RowRef,
    types::{Fields, Revision, RowKey, Table},
};

/// A replica that disagrees with the server. Never repaired incrementally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    /// An insert targets a row the replica already holds.
    #[error("insert of {table} row {key}, which already exists locally")]
    RowAlreadyExists {
        /// Table of the row.
        table: Table,
        /// Key of the row.
        key: RowKey,
    },
    /// An update or delete targets a row the replica does not hold.
    #[error("{kind} of {table} row {key}, which does not exist locally")]
    MissingRow {
        /// Table of the row.
        table: Table,
        /// Key of the row.
        key: RowKey,
        /// Kind of the rejected change.
        kind: ChangeKind,
    },
    /// An insert or update arrived without a payload.
    #[error("{kind} of {table} row {key} carries no payload")]
    MissingPayload {
        /// Table of the row.
        table: Table,
        /// Key of the row.
        key: RowKey,
        /// Kind of the rejected change.
        kind: ChangeKind,
    },
    /// The server reports a watermark below the one already applied.
    #[error("server watermark {server} is behind local watermark {local}")]
    WatermarkAhead {
        /// Watermark of the replica.
        local: Revision,
        /// Watermark reported by the server.
        server: Revision,
    },
    /// The replica holds edits the server never saw.
    #[error("replica holds {0} local-only changes")]
    LocalChanges(usize),
}

/// Final state of a row touched by an applied batch; `None` means removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRow {
    /// Table of the row.
    pub table: Table,
    /// Key of the row.
    pub key: RowKey,
    /// Row contents after the batch.
    pub fields: Option<Fields>,
}

/// Outcome of [`Replica::apply_batch`]; hand it back to [`Replica::rollback`]
/// to undo the batch.
#[derive(Debug)]
pub struct AppliedBatch {
    /// Every touched row once, in first-touch order.
    pub rows: Vec<AppliedRow>,
    undo: Vec<(RowRef, Option<Fields>)>,
    prev_watermark: Option<Revision>,
}

/// Local mirror of the server tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    rows: HashMap<RowRef, Fields>,
    watermark: Option<Revision>,
    local_changes: usize,
}

impl Replica {
    /// Empty replica that has never synced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a replica from persisted rows and watermark.
    pub fn from_parts(rows: impl IntoIterator<Item = (RowRef, Fields)>, watermark: Option<Revision>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
            watermark,
            local_changes: 0,
        }
    }

    /// Highest revision fully applied; `None` if never synced.
    pub fn watermark(&self) -> Option<Revision> {
        self.watermark
    }

    /// Fields of one row, if present.
    pub fn get(&self, table: Table, key: &str) -> Option<&Fields> {
        self.rows.get(&(table, key.to_string()))
    }

    /// Rows of `table`, sorted by key.
    pub fn rows(&self, table: Table) -> Vec<(&RowKey, &Fields)> {
        let mut out: Vec<(&RowKey, &Fields)> = self
            .rows
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|((_, k), f)| (k, f))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }

    /// Number of rows across all tables.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when no row is held.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes a row locally without going through the server.
    ///
    /// The replica becomes dirty and refuses to connect until reset.
    pub fn put_local(&mut self, table: Table, key: impl Into<RowKey>, fields: Fields) {
        self.rows.insert((table, key.into()), fields);
        self.local_changes += 1;
    }

    /// Removes a row locally without going through the server.
    pub fn remove_local(&mut self, table: Table, key: &str) {
        if self.rows.remove(&(table, key.to_string())).is_some() {
            self.local_changes += 1;
        }
    }

    /// Returns true after any `put_local` or `remove_local`.
    pub fn has_local_changes(&self) -> bool {
        self.local_changes > 0
    }

    /// Number of local-only edits since the last clear.
    pub fn local_change_count(&self) -> usize {
        self.local_changes
    }

    /// Drops every row and the watermark.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.watermark = None;
        self.local_changes = 0;
    }

    /// Applies a pulled change set and adopts `new_watermark`, all or nothing.
    pub fn apply_batch(
        &mut self,
        changes: &[ChangeRecord],
        new_watermark: Revision,
    ) -> Result<AppliedBatch, ReplicaError> {
        if let Some(local) = self.watermark {
            if new_watermark < local {
                return Err(ReplicaError::WatermarkAhead {
                    local,
                    server: new_watermark,
                });
            }
        }

        let mut batch = AppliedBatch {
            rows: Vec::new(),
            undo: Vec::with_capacity(changes.len()),
            prev_watermark: self.watermark,
        };
        for change in changes {
            if let Err(err) = self.apply_one(change, &mut batch.undo) {
                self.rollback(batch);
                return Err(err);
            }
        }

        let mut seen = HashSet::new();
        for (row, _) in &batch.undo {
            if seen.insert(row.clone()) {
                batch.rows.push(AppliedRow {
                    table: row.0,
                    key: row.1.clone(),
                    fields: self.rows.get(row).cloned(),
                });
            }
        }
        self.watermark = Some(new_watermark);
        Ok(batch)
    }

    /// Restores the state from before `batch` was applied.
    pub fn rollback(&mut self, batch: AppliedBatch) {
        for (row, prior) in batch.undo.into_iter().rev() {
            match prior {
                Some(fields) => {
                    self.rows.insert(row, fields);
                }
                None => {
                    self.rows.remove(&row);
                }
            }
        }
        self.watermark = batch.prev_watermark;
    }

    fn apply_one(
        &mut self,
        change: &ChangeRecord,
        undo: &mut Vec<(RowRef, Option<Fields>)>,
    ) -> Result<(), ReplicaError> {
        let row: RowRef = (change.table, change.key.clone());
        let missing = || ReplicaError::MissingRow {
            table: change.table,
            key: change.key.clone(),
            kind: change.kind,
        };
        let no_payload = || ReplicaError::MissingPayload {
            table: change.table,
            key: change.key.clone(),
            kind: change.kind,
        };

        match change.kind {
            ChangeKind::Insert => {
                if self.rows.contains_key(&row) {
                    return Err(ReplicaError::RowAlreadyExists {
                        table: change.table,
                        key: change.key.clone(),
                    });
                }
                let fields = change.payload.clone().ok_or_else(no_payload)?;
                undo.push((row.clone(), None));
                self.rows.insert(row, fields);
            }
            ChangeKind::Update => {
                let patch = change.payload.as_ref().ok_or_else(no_payload)?;
                let current = self.rows.get_mut(&row).ok_or_else(missing)?;
                undo.push((row, Some(current.clone())));
                overlay_fields(current, patch);
            }
            ChangeKind::Delete => {
                let prior = self.rows.remove(&row).ok_or_else(missing)?;
                undo.push((row, Some(prior)));
            }
        }
        Ok(())
    }
}
