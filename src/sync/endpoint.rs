use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    change::ChangeRecord,
    core::{changelog::Changelog, indices::RowRef},
    types::Revision,
};

use super::compactor::compact_records;

/// Compacted change set shipped to a client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullResponse {
    /// One net record per changed row, followed by the raw changelog rows of the window.
    pub changes: Vec<ChangeRecord>,
    /// Highest revision covered by `changes`.
    pub new_watermark: Revision,
}

impl PullResponse {
    /// Returns true when there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// First revision a client at `watermark` has not applied yet.
pub fn from_revision(watermark: Option<Revision>) -> Revision {
    watermark.map(|w| w.saturating_add(1)).unwrap_or(0)
}

/// Answers a pull against the current contents of `log`.
pub fn pull(log: &Changelog, watermark: Option<Revision>) -> PullResponse {
    let new_watermark = log.latest_revision();
    let from = from_revision(watermark);
    build_response(log.range(from, new_watermark), from, new_watermark)
}

/// Builds the response for the already selected `window` of raw records.
///
/// Records outside `from..=new_watermark` are ignored, so callers may pass a
/// wider slice.
pub fn build_response(window: &[ChangeRecord], from: Revision, new_watermark: Revision) -> PullResponse {
    let in_range: Vec<&ChangeRecord> = window
        .iter()
        .filter(|r| r.revision >= from && r.revision <= new_watermark)
        .collect();

    let mut order: Vec<RowRef> = Vec::new();
    let mut groups: HashMap<RowRef, Vec<&ChangeRecord>> = HashMap::new();
    for record in &in_range {
        let row = (record.table, record.key.clone());
        let group = groups.entry(row.clone()).or_insert_with(|| {
            order.push(row);
            Vec::new()
        });
        group.push(record);
    }

    let mut changes: Vec<ChangeRecord> = order
        .iter()
        .filter_map(|row| groups.remove(row))
        .filter_map(|group| compact_records(group))
        .collect();
    let compacted = changes.len();
    changes.extend(in_range.iter().map(|r| r.as_changelog_insert()));

    debug!(
        from,
        new_watermark,
        raw = in_range.len(),
        compacted,
        "pull window built"
    );

    PullResponse {
        changes,
        new_watermark,
    }
}
