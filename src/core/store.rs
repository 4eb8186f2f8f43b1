use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::{
    change::{ChangeKind, ChangeRecord, diff_fields, overlay_fields},
    entity::{Permission, Product, ProductGroup, Row, StockEntry, Storage},
    types::{ActorId, Revision, RowKey, Table},
};

use super::{changelog::Changelog, mutation::Mutation};

/// Rejection of a mutation. Nothing is staged or logged when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A referenced row does not exist.
    #[error("{table} row {key} does not exist")]
    MissingRow {
        /// Table of the missing row.
        table: Table,
        /// Key of the missing row.
        key: RowKey,
    },
    /// The row is still referenced and cannot be deleted.
    #[error("{table} row {key} is still referenced from {by}")]
    InUse {
        /// Table of the referenced row.
        table: Table,
        /// Key of the referenced row.
        key: RowKey,
        /// Table holding the reference.
        by: Table,
    },
    /// A replayed insert targets a row that already exists.
    #[error("{table} row {key} already exists")]
    Duplicate {
        /// Table of the row.
        table: Table,
        /// Key of the row.
        key: RowKey,
    },
    /// The log advanced between `stage` and `commit`.
    #[error("transaction staged at revision {staged_at} but the log is at {latest}")]
    Stale {
        /// Latest revision when the transaction was staged.
        staged_at: Revision,
        /// Latest revision at commit time.
        latest: Revision,
    },
    /// A record was appended with a revision that does not follow the log.
    #[error("revision {got} does not follow {latest}")]
    RevisionOutOfOrder {
        /// Latest revision in the log.
        latest: Revision,
        /// Revision of the rejected record.
        got: Revision,
    },
    /// The stock quantity would leave the `i64` range.
    #[error("stock of product {product_id} in storage {storage_id} would overflow")]
    StockOverflow {
        /// Product key.
        product_id: RowKey,
        /// Storage key.
        storage_id: RowKey,
    },
    /// A journaled record cannot be replayed onto the store.
    #[error("replayed change cannot be applied: {0}")]
    Replay(String),
}

#[derive(Debug, Clone)]
enum RowWrite {
    Put(Row),
    Remove { table: Table, key: RowKey },
}

/// Row writes plus the change records they produce, not yet visible to anyone.
///
/// Dropping a `Staged` discards the transaction.
#[derive(Debug, Clone)]
pub struct Staged {
    base: Revision,
    key: RowKey,
    writes: Vec<RowWrite>,
    records: Vec<ChangeRecord>,
}

impl Staged {
    /// Key of the row the mutation targeted (or created).
    pub fn key(&self) -> &RowKey {
        &self.key
    }

    /// Change records this transaction appends on commit.
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Returns true when committing would change nothing.
    pub fn is_noop(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Key of the row the mutation targeted (or created).
    pub key: RowKey,
    /// Records appended, empty for a no-op.
    pub changes: Vec<ChangeRecord>,
}

/// Authoritative entity tables together with their changelog.
///
/// Every committed row write appends a record in the same step, so the
/// tables always equal a replay of the log.
#[derive(Debug, Default)]
pub struct EntityStore {
    rows: HashMap<Table, HashMap<RowKey, Row>>,
    stock_by_pair: HashMap<(RowKey, RowKey), RowKey>,
    log: Changelog,
}

impl EntityStore {
    /// Empty store at revision 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The change log backing this store.
    pub fn changelog(&self) -> &Changelog {
        &self.log
    }

    /// Highest committed revision.
    pub fn latest_revision(&self) -> Revision {
        self.log.latest_revision()
    }

    /// Any row by table and key.
    pub fn get(&self, table: Table, key: &str) -> Option<&Row> {
        self.rows.get(&table).and_then(|t| t.get(key))
    }

    /// All live rows of `table`, sorted by key.
    pub fn rows(&self, table: Table) -> Vec<&Row> {
        let mut out: Vec<&Row> = self
            .rows
            .get(&table)
            .into_iter()
            .flat_map(|t| t.values())
            .collect();
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }

    /// Number of live rows in `table`.
    pub fn row_count(&self, table: Table) -> usize {
        self.rows.get(&table).map(|t| t.len()).unwrap_or(0)
    }

    /// Storage by key.
    pub fn storage(&self, id: &str) -> Option<&Storage> {
        match self.get(Table::Storages, id) {
            Some(Row::Storage(r)) => Some(r),
            _ => None,
        }
    }

    /// Product group by key.
    pub fn product_group(&self, id: &str) -> Option<&ProductGroup> {
        match self.get(Table::ProductGroups, id) {
            Some(Row::ProductGroup(r)) => Some(r),
            _ => None,
        }
    }

    /// Product by key.
    pub fn product(&self, id: &str) -> Option<&Product> {
        match self.get(Table::Products, id) {
            Some(Row::Product(r)) => Some(r),
            _ => None,
        }
    }

    /// Permission by key.
    pub fn permission(&self, id: &str) -> Option<&Permission> {
        match self.get(Table::Permissions, id) {
            Some(Row::Permission(r)) => Some(r),
            _ => None,
        }
    }

    /// Stock row of a `(product, storage)` pair.
    pub fn stock(&self, product_id: &str, storage_id: &str) -> Option<&StockEntry> {
        let id = self
            .stock_by_pair
            .get(&(product_id.to_string(), storage_id.to_string()))?;
        match self.get(Table::Stock, id) {
            Some(Row::Stock(r)) => Some(r),
            _ => None,
        }
    }

    /// Stages and commits `mutation` in one step.
    pub fn apply(&mut self, actor: &ActorId, mutation: &Mutation) -> Result<MutationOutcome, StoreError> {
        let staged = self.stage(actor, mutation)?;
        self.commit(staged)
    }

    /// Validates `mutation` and computes its writes and change records without
    /// touching any state.
    pub fn stage(&self, actor: &ActorId, mutation: &Mutation) -> Result<Staged, StoreError> {
        let mut tx = TxBuilder::new(self, actor);
        let key = match mutation {
            Mutation::CreateStorage(draft) => {
                let id = new_key();
                tx.put(Row::Storage(Storage {
                    id: id.clone(),
                    name: draft.name.clone(),
                    description: draft.description.clone(),
                }))?;
                id
            }
            Mutation::UpdateStorage { id, patch } => {
                let mut row = self.require_storage(id)?.clone();
                patch.apply_to(&mut row);
                tx.put(Row::Storage(row))?;
                id.clone()
            }
            Mutation::DeleteStorage { id } => {
                self.require_storage(id)?;
                for key in self.keys_where(Table::Stock, |r| {
                    matches!(r, Row::Stock(s) if s.storage_id == *id)
                }) {
                    tx.remove(Table::Stock, &key)?;
                }
                for key in self.keys_where(Table::Permissions, |r| {
                    matches!(r, Row::Permission(p) if p.storage_id.as_deref() == Some(id.as_str()))
                }) {
                    tx.remove(Table::Permissions, &key)?;
                }
                tx.remove(Table::Storages, id)?;
                id.clone()
            }
            Mutation::CreateProductGroup(draft) => {
                if let Some(parent) = &draft.parent_id {
                    self.require_group(parent)?;
                }
                let id = new_key();
                tx.put(Row::ProductGroup(ProductGroup {
                    id: id.clone(),
                    name: draft.name.clone(),
                    description: draft.description.clone(),
                    parent_id: draft.parent_id.clone(),
                }))?;
                id
            }
            Mutation::UpdateProductGroup { id, patch } => {
                let mut row = self.require_group(id)?.clone();
                patch.apply_to(&mut row);
                tx.put(Row::ProductGroup(row))?;
                id.clone()
            }
            Mutation::DeleteProductGroup { id } => {
                self.require_group(id)?;
                let products = self.keys_where(Table::Products, |r| {
                    matches!(r, Row::Product(p) if p.group_id.as_deref() == Some(id.as_str()))
                });
                if !products.is_empty() {
                    return Err(StoreError::InUse {
                        table: Table::ProductGroups,
                        key: id.clone(),
                        by: Table::Products,
                    });
                }
                let children = self.keys_where(Table::ProductGroups, |r| {
                    matches!(r, Row::ProductGroup(g) if g.parent_id.as_deref() == Some(id.as_str()))
                });
                if !children.is_empty() {
                    return Err(StoreError::InUse {
                        table: Table::ProductGroups,
                        key: id.clone(),
                        by: Table::ProductGroups,
                    });
                }
                tx.remove(Table::ProductGroups, id)?;
                id.clone()
            }
            Mutation::CreateProduct(draft) => {
                if let Some(group) = &draft.group_id {
                    self.require_group(group)?;
                }
                let id = new_key();
                tx.put(Row::Product(Product {
                    id: id.clone(),
                    name: draft.name.clone(),
                    item_number: draft.item_number.clone(),
                    price: draft.price,
                    group_id: draft.group_id.clone(),
                    stock_value: draft.stock_value,
                }))?;
                id
            }
            Mutation::UpdateProduct { id, patch } => {
                if let Some(Some(group)) = &patch.group_id {
                    self.require_group(group)?;
                }
                let mut row = self.require_product(id)?.clone();
                patch.apply_to(&mut row);
                tx.put(Row::Product(row))?;
                id.clone()
            }
            Mutation::DeleteProduct { id } => {
                self.require_product(id)?;
                for key in self.keys_where(Table::Stock, |r| {
                    matches!(r, Row::Stock(s) if s.product_id == *id)
                }) {
                    tx.remove(Table::Stock, &key)?;
                }
                tx.remove(Table::Products, id)?;
                id.clone()
            }
            Mutation::PostStockDelta {
                product_id,
                storage_id,
                delta,
            } => self.stage_stock(&mut tx, product_id, storage_id, |current| {
                current.unwrap_or(0).checked_add(*delta)
            })?,
            Mutation::SetStock {
                product_id,
                storage_id,
                value,
            } => self.stage_stock(&mut tx, product_id, storage_id, |_| Some(*value))?,
            Mutation::GrantPermission(draft) => {
                if let Some(storage) = &draft.storage_id {
                    self.require_storage(storage)?;
                }
                let id = new_key();
                tx.put(Row::Permission(Permission {
                    id: id.clone(),
                    user_id: draft.user_id.clone(),
                    storage_id: draft.storage_id.clone(),
                    readable: draft.readable.clone(),
                    writable: draft.writable.clone(),
                }))?;
                id
            }
            Mutation::UpdatePermission { id, patch } => {
                let mut row = self
                    .permission(id)
                    .ok_or_else(|| missing(Table::Permissions, id))?
                    .clone();
                patch.apply_to(&mut row);
                tx.put(Row::Permission(row))?;
                id.clone()
            }
            Mutation::RevokePermission { id } => {
                tx.remove(Table::Permissions, id)?;
                id.clone()
            }
        };
        Ok(tx.finish(key))
    }

    /// Applies a staged transaction: row writes and log appends become visible together.
    pub fn commit(&mut self, staged: Staged) -> Result<MutationOutcome, StoreError> {
        let latest = self.log.latest_revision();
        if staged.base != latest {
            return Err(StoreError::Stale {
                staged_at: staged.base,
                latest,
            });
        }

        for write in staged.writes {
            match write {
                RowWrite::Put(row) => self.put_row(row),
                RowWrite::Remove { table, key } => self.remove_row(table, &key),
            }
        }
        for record in &staged.records {
            self.log.append(record.clone())?;
            debug!(
                revision = record.revision,
                table = %record.table,
                key = %record.key,
                kind = record.kind.as_str(),
                actor = %record.actor,
                "change committed"
            );
        }

        Ok(MutationOutcome {
            key: staged.key,
            changes: staged.records,
        })
    }

    /// Re-applies a journaled record while rebuilding the store from disk.
    pub fn apply_replayed_change(&mut self, record: ChangeRecord) -> Result<(), StoreError> {
        let table = record.table;
        match record.kind {
            ChangeKind::Insert => {
                if self.get(table, &record.key).is_some() {
                    return Err(StoreError::Duplicate {
                        table,
                        key: record.key.clone(),
                    });
                }
                let fields = record
                    .payload
                    .clone()
                    .ok_or_else(|| StoreError::Replay(format!("insert {} has no payload", record.revision)))?;
                let row = Row::from_fields(table, fields).map_err(|e| StoreError::Replay(e.to_string()))?;
                self.put_row(row);
            }
            ChangeKind::Update => {
                let mut fields = self
                    .get(table, &record.key)
                    .ok_or_else(|| missing(table, &record.key))?
                    .fields();
                if let Some(patch) = &record.payload {
                    overlay_fields(&mut fields, patch);
                }
                let row = Row::from_fields(table, fields).map_err(|e| StoreError::Replay(e.to_string()))?;
                self.put_row(row);
            }
            ChangeKind::Delete => {
                if self.get(table, &record.key).is_none() {
                    return Err(missing(table, &record.key));
                }
                self.remove_row(table, &record.key);
            }
        }
        self.log.append(record)?;
        Ok(())
    }

    fn stage_stock(
        &self,
        tx: &mut TxBuilder<'_>,
        product_id: &RowKey,
        storage_id: &RowKey,
        next_value: impl FnOnce(Option<i64>) -> Option<i64>,
    ) -> Result<RowKey, StoreError> {
        self.require_product(product_id)?;
        self.require_storage(storage_id)?;

        let existing = self.stock(product_id, storage_id);
        let value = next_value(existing.map(|s| s.value)).ok_or_else(|| StoreError::StockOverflow {
            product_id: product_id.clone(),
            storage_id: storage_id.clone(),
        })?;
        let row = match existing {
            Some(existing) => StockEntry {
                value,
                ..existing.clone()
            },
            None => StockEntry {
                id: new_key(),
                product_id: product_id.clone(),
                storage_id: storage_id.clone(),
                value,
            },
        };
        let id = row.id.clone();
        tx.put(Row::Stock(row))?;
        Ok(id)
    }

    fn require_storage(&self, id: &str) -> Result<&Storage, StoreError> {
        self.storage(id).ok_or_else(|| missing(Table::Storages, id))
    }

    fn require_group(&self, id: &str) -> Result<&ProductGroup, StoreError> {
        self.product_group(id)
            .ok_or_else(|| missing(Table::ProductGroups, id))
    }

    fn require_product(&self, id: &str) -> Result<&Product, StoreError> {
        self.product(id).ok_or_else(|| missing(Table::Products, id))
    }

    fn keys_where(&self, table: Table, pred: impl Fn(&Row) -> bool) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self
            .rows
            .get(&table)
            .into_iter()
            .flat_map(|t| t.values())
            .filter(|r| pred(r))
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn put_row(&mut self, row: Row) {
        if let Row::Stock(s) = &row {
            self.stock_by_pair
                .insert((s.product_id.clone(), s.storage_id.clone()), s.id.clone());
        }
        self.rows
            .entry(row.table())
            .or_default()
            .insert(row.key().clone(), row);
    }

    fn remove_row(&mut self, table: Table, key: &str) {
        let removed = self.rows.get_mut(&table).and_then(|t| t.remove(key));
        if let Some(Row::Stock(s)) = removed {
            self.stock_by_pair.remove(&(s.product_id, s.storage_id));
        }
    }
}

/// Accumulates the writes of one transaction against a read-only store view.
struct TxBuilder<'a> {
    store: &'a EntityStore,
    actor: &'a ActorId,
    base: Revision,
    ts_ms: u64,
    writes: Vec<RowWrite>,
    records: Vec<ChangeRecord>,
}

impl<'a> TxBuilder<'a> {
    fn new(store: &'a EntityStore, actor: &'a ActorId) -> Self {
        Self {
            store,
            actor,
            base: store.latest_revision(),
            ts_ms: now_ms(),
            writes: Vec::new(),
            records: Vec::new(),
        }
    }

    /// Inserts or updates `row`. An update that changes no field is dropped.
    fn put(&mut self, row: Row) -> Result<(), StoreError> {
        let table = row.table();
        let key = row.key().clone();
        let (kind, payload) = match self.store.get(table, &key) {
            None => (ChangeKind::Insert, row.fields()),
            Some(old) => {
                let changed = diff_fields(&old.fields(), &row.fields());
                if changed.is_empty() {
                    return Ok(());
                }
                (ChangeKind::Update, changed)
            }
        };
        self.push(table, key, kind, Some(payload));
        self.writes.push(RowWrite::Put(row));
        Ok(())
    }

    fn remove(&mut self, table: Table, key: &str) -> Result<(), StoreError> {
        if self.store.get(table, key).is_none() {
            return Err(missing(table, key));
        }
        self.push(table, key.to_string(), ChangeKind::Delete, None);
        self.writes.push(RowWrite::Remove {
            table,
            key: key.to_string(),
        });
        Ok(())
    }

    fn push(&mut self, table: Table, key: RowKey, kind: ChangeKind, payload: Option<crate::types::Fields>) {
        let revision = self.base + self.records.len() as Revision + 1;
        self.records.push(ChangeRecord {
            id: Uuid::new_v4(),
            revision,
            actor: self.actor.clone(),
            table,
            key,
            kind,
            payload,
            ts_ms: self.ts_ms,
        });
    }

    fn finish(self, key: RowKey) -> Staged {
        Staged {
            base: self.base,
            key,
            writes: self.writes,
            records: self.records,
        }
    }
}

fn missing(table: Table, key: &str) -> StoreError {
    StoreError::MissingRow {
        table,
        key: key.to_string(),
    }
}

fn new_key() -> RowKey {
    Uuid::new_v4().to_string()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
