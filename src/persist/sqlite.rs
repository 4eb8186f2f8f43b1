//! SQLite-backed changelog journal and client replica storage.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::{
    change::{CHANGE_FORMAT_VERSION, ChangeEnvelope, ChangeRecord},
    client::replica::{AppliedRow, Replica},
    core::store::EntityStore,
    types::{Fields, Revision, Table},
};

use super::{ChangeSink, PersistError, PersistResult, ReplicaSink};

/// SQLite implementation of [`crate::persist::ChangeSink`].
///
/// `table`, `key` and `kind` live in their own columns so rows can be grouped
/// without decoding the payload.
pub struct SqliteChangeSink {
    conn: Connection,
}

impl SqliteChangeSink {
    /// Opens or creates a SQLite-backed changelog at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite changelog.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Rebuilds the entity store by replaying the whole changelog.
    pub fn load_store(&self) -> PersistResult<EntityStore> {
        let mut store = EntityStore::new();
        for record in self.load_changes_after(0)? {
            store.apply_replayed_change(record)?;
        }
        debug!(revision = store.latest_revision(), "store replayed from sqlite");
        Ok(store)
    }

    /// Loads records strictly after `revision`.
    pub fn load_changes_after(&self, revision: Revision) -> PersistResult<Vec<ChangeRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT revision, payload FROM changelog WHERE revision > ?1 ORDER BY revision ASC")?;

        let rows = stmt.query_map(params![revision as i64], |row| {
            let revision: i64 = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            let mut record = decode_change_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            record.revision = revision as Revision;
            Ok(record)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Returns the latest revision persisted in the changelog table.
    pub fn latest_revision(&self) -> PersistResult<Revision> {
        let revision: Option<i64> = self
            .conn
            .query_row("SELECT MAX(revision) FROM changelog", [], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten();
        Ok(revision.unwrap_or(0) as Revision)
    }
}

impl ChangeSink for SqliteChangeSink {
    fn append_changes(&mut self, changes: &[ChangeRecord]) -> PersistResult<Revision> {
        if changes.is_empty() {
            return self.latest_revision();
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO changelog(revision, id, actor, tbl, row_key, kind, ts_ms, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for record in changes {
                let payload = serde_json::to_vec(&ChangeEnvelope::new(record.clone()))?;
                stmt.execute(params![
                    record.revision as i64,
                    record.id.to_string(),
                    record.actor.as_str(),
                    record.table.as_str(),
                    record.key,
                    record.kind.as_str(),
                    record.ts_ms as i64,
                    payload,
                ])?;
            }
        }
        tx.commit()?;

        Ok(changes.last().map(|r| r.revision).unwrap_or(0))
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

/// SQLite implementation of [`crate::persist::ReplicaSink`].
pub struct SqliteReplicaSink {
    conn: Connection,
}

impl SqliteReplicaSink {
    /// Opens or creates replica storage at `path`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens in-memory replica storage.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("replica_schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Loads the persisted replica rows and watermark.
    pub fn load_replica(&self) -> PersistResult<Replica> {
        let watermark: Option<i64> = self
            .conn
            .query_row("SELECT watermark FROM replica_meta WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        let mut stmt = self.conn.prepare("SELECT tbl, row_key, fields FROM replica_rows")?;
        let rows = stmt.query_map([], |row| {
            let tbl: String = row.get(0)?;
            let key: String = row.get(1)?;
            let fields: String = row.get(2)?;
            Ok((tbl, key, fields))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (tbl, key, fields) = row?;
            let table = Table::parse(&tbl)
                .ok_or_else(|| PersistError::Message(format!("unknown replica table: {tbl}")))?;
            let fields: Fields = serde_json::from_str(&fields)?;
            out.push(((table, key), fields));
        }

        Ok(Replica::from_parts(out, watermark.map(|w| w as Revision)))
    }
}

impl ReplicaSink for SqliteReplicaSink {
    fn commit_batch(&mut self, rows: &[AppliedRow], watermark: Revision) -> PersistResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO replica_rows(tbl, row_key, fields) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(tbl, row_key) DO UPDATE SET fields = excluded.fields",
            )?;
            let mut delete = tx.prepare("DELETE FROM replica_rows WHERE tbl = ?1 AND row_key = ?2")?;
            for row in rows {
                match &row.fields {
                    Some(fields) => {
                        let json = serde_json::to_string(fields)?;
                        upsert.execute(params![row.table.as_str(), row.key, json])?;
                    }
                    None => {
                        delete.execute(params![row.table.as_str(), row.key])?;
                    }
                }
            }
            tx.execute(
                "INSERT INTO replica_meta(id, watermark) VALUES (1, ?1) \
                 ON CONFLICT(id) DO UPDATE SET watermark = excluded.watermark",
                params![watermark as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&mut self) -> PersistResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM replica_rows", [])?;
        tx.execute("DELETE FROM replica_meta", [])?;
        tx.commit()?;
        Ok(())
    }
}

fn decode_change_payload(payload: &[u8]) -> Result<ChangeRecord, String> {
    let envelope = serde_json::from_slice::<ChangeEnvelope>(payload)
        .map_err(|e| format!("change payload decode failed: {e}"))?;
    if envelope.format_version != CHANGE_FORMAT_VERSION {
        return Err(format!(
            "unsupported change format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.record)
}
