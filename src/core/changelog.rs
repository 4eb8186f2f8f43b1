use crate::{
    change::ChangeRecord,
    types::{Revision, Table},
};

use super::{
    indices::{RowRef, VecIndex},
    store::StoreError,
};

/// Append-only, revision-ordered log of row mutations.
#[derive(Debug, Clone, Default)]
pub struct Changelog {
    records: Vec<ChangeRecord>,
    by_row: VecIndex<RowRef>,
}

impl Changelog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when nothing was ever appended.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest revision in the log, `0` when empty.
    pub fn latest_revision(&self) -> Revision {
        self.records.last().map(|r| r.revision).unwrap_or(0)
    }

    /// Appends `record`, which must carry a revision above every existing one.
    pub fn append(&mut self, record: ChangeRecord) -> Result<Revision, StoreError> {
        let latest = self.latest_revision();
        if record.revision <= latest {
            return Err(StoreError::RevisionOutOfOrder {
                latest,
                got: record.revision,
            });
        }

        let revision = record.revision;
        self.by_row
            .entry((record.table, record.key.clone()))
            .or_default()
            .push(self.records.len());
        self.records.push(record);
        Ok(revision)
    }

    /// Every record in revision order.
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Records with `from <= revision <= to`, in revision order.
    ///
    /// An inverted range is empty rather than an error.
    pub fn range(&self, from: Revision, to: Revision) -> &[ChangeRecord] {
        if from > to {
            return &[];
        }
        let start = self.records.partition_point(|r| r.revision < from);
        let end = self.records.partition_point(|r| r.revision <= to);
        &self.records[start..end.max(start)]
    }

    /// History of one row within `from..=to`, in revision order.
    pub fn row_history(&self, table: Table, key: &str, from: Revision, to: Revision) -> Vec<&ChangeRecord> {
        let Some(positions) = self.by_row.get(&(table, key.to_string())) else {
            return Vec::new();
        };
        positions
            .iter()
            .map(|&pos| &self.records[pos])
            .filter(|r| r.revision >= from && r.revision <= to)
            .collect()
    }
}
