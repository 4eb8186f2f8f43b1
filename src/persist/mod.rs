/// SQLite-backed sinks.
pub mod sqlite;

use crate::{
    change::ChangeRecord,
    client::replica::AppliedRow,
    core::store::StoreError,
    types::Revision,
};

/// Persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// SQLite error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload encoding or decoding failed.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// A journaled record could not be replayed.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Any other failure.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Durable home of the server changelog.
pub trait ChangeSink: Send {
    /// Appends one committed transaction's records; all or nothing.
    fn append_changes(&mut self, changes: &[ChangeRecord]) -> PersistResult<Revision>;
    /// Forces buffered writes to disk.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}

/// Durable home of a client replica.
pub trait ReplicaSink: Send {
    /// Stores the final state of every touched row together with the new watermark.
    fn commit_batch(&mut self, rows: &[AppliedRow], watermark: Revision) -> PersistResult<()>;
    /// Drops every stored row and the watermark.
    fn clear(&mut self) -> PersistResult<()>;
}
