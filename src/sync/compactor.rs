use crate::{
    change::{ChangeKind, ChangeRecord, overlay_fields},
    core::changelog::Changelog,
    types::{Fields, Revision, Table},
};

/// Net effect of `(table, key)` over `from..=to`, or `None` if an observer
/// would see nothing (no history, an inverted range, or a row that was both
/// created and deleted inside the window).
pub fn compact(log: &Changelog, table: Table, key: &str, from: Revision, to: Revision) -> Option<ChangeRecord> {
    compact_records(log.row_history(table, key, from, to))
}

/// Folds one row's records into a single equivalent record.
///
/// The result carries the id, revision, actor and timestamp of the newest
/// input record. Inputs are ordered by revision before folding.
pub fn compact_records<'a>(history: impl IntoIterator<Item = &'a ChangeRecord>) -> Option<ChangeRecord> {
    let mut history: Vec<&ChangeRecord> = history.into_iter().collect();
    history.sort_by_key(|r| r.revision);
    let last = *history.last()?;

    let insert = history.iter().find(|r| r.kind == ChangeKind::Insert);
    let has_delete = history.iter().any(|r| r.kind == ChangeKind::Delete);

    let (kind, payload) = match (insert, has_delete) {
        (Some(_), true) => return None,
        (Some(insert), false) => {
            let mut merged = insert.payload.clone().unwrap_or_default();
            merge_updates(&mut merged, &history);
            (ChangeKind::Insert, Some(merged))
        }
        (None, true) => (ChangeKind::Delete, None),
        (None, false) => {
            let mut merged = Fields::new();
            merge_updates(&mut merged, &history);
            (ChangeKind::Update, Some(merged))
        }
    };

    Some(ChangeRecord {
        kind,
        payload,
        ..last.clone()
    })
}

// Later revisions win field by field.
fn merge_updates(base: &mut Fields, history: &[&ChangeRecord]) {
    for record in history.iter().filter(|r| r.kind == ChangeKind::Update) {
        if let Some(patch) = &record.payload {
            overlay_fields(base, patch);
        }
    }
}
