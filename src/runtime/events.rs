//! Runtime event stream payloads.

use crate::{
    change::ChangeKind,
    types::{Revision, RowKey, Table},
};

/// Events emitted from the single-writer server loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A change record became visible to pulls.
    Committed {
        /// Revision of the record.
        revision: Revision,
        /// Affected table.
        table: Table,
        /// Affected row.
        key: RowKey,
        /// Mutation kind.
        kind: ChangeKind,
    },
}
