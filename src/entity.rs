//! Entity rows, drafts, and sparse patches for the authoritative tables.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::{Fields, ProductProperty, RowKey, Table};

/// Storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    /// Stable storage key.
    pub id: RowKey,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
}

/// Insert payload for a new [`Storage`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageDraft {
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
}

/// Sparse storage patch where each `Some` field overwrites the row value.
///
/// Nullable columns take `Some(None)` to clear the value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoragePatch {
    /// Optional replacement name.
    pub name: Option<String>,
    /// Optional replacement description; `Some(None)` clears it.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
}

impl StoragePatch {
    /// Applies this patch in place to `row`.
    pub fn apply_to(&self, row: &mut Storage) {
        if let Some(v) = &self.name {
            row.name = v.clone();
        }
        if let Some(v) = &self.description {
            row.description = v.clone();
        }
    }
}

/// Catalog product group, optionally nested under a parent group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductGroup {
    /// Stable group key.
    pub id: RowKey,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Parent group key.
    pub parent_id: Option<RowKey>,
}

/// Insert payload for a new [`ProductGroup`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProductGroupDraft {
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Parent group key, which must exist.
    pub parent_id: Option<RowKey>,
}

/// Sparse product group patch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductGroupPatch {
    /// Optional replacement name.
    pub name: Option<String>,
    /// Optional replacement description; `Some(None)` clears it.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
}

impl ProductGroupPatch {
    /// Applies this patch in place to `row`.
    pub fn apply_to(&self, row: &mut ProductGroup) {
        if let Some(v) = &self.name {
            row.name = v.clone();
        }
        if let Some(v) = &self.description {
            row.description = v.clone();
        }
    }
}

/// Catalog product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Stable product key.
    pub id: RowKey,
    /// Display name.
    pub name: String,
    /// Article number.
    pub item_number: Option<String>,
    /// Price in minor currency units.
    pub price: i64,
    /// Owning product group.
    pub group_id: Option<RowKey>,
    /// Aggregate stock value as reported by the catalog.
    pub stock_value: i64,
}

/// Insert payload for a new [`Product`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProductDraft {
    /// Display name.
    pub name: String,
    /// Article number.
    pub item_number: Option<String>,
    /// Price in minor currency units.
    pub price: i64,
    /// Owning product group, which must exist.
    pub group_id: Option<RowKey>,
    /// Aggregate stock value as reported by the catalog.
    pub stock_value: i64,
}

/// Sparse product patch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductPatch {
    /// Optional replacement name.
    pub name: Option<String>,
    /// Optional replacement article number; `Some(None)` clears it.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub item_number: Option<Option<String>>,
    /// Optional replacement price.
    pub price: Option<i64>,
    /// Optional replacement group, which must exist; `Some(None)` ungroups the product.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<RowKey>>,
    /// Optional replacement aggregate stock value.
    pub stock_value: Option<i64>,
}

impl ProductPatch {
    /// Applies this patch in place to `row`.
    pub fn apply_to(&self, row: &mut Product) {
        if let Some(v) = &self.name {
            row.name = v.clone();
        }
        if let Some(v) = &self.item_number {
            row.item_number = v.clone();
        }
        if let Some(v) = self.price {
            row.price = v;
        }
        if let Some(v) = &self.group_id {
            row.group_id = v.clone();
        }
        if let Some(v) = self.stock_value {
            row.stock_value = v;
        }
    }
}

/// Stock quantity of one product in one storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEntry {
    /// Stable stock row key.
    pub id: RowKey,
    /// Product key.
    pub product_id: RowKey,
    /// Storage key.
    pub storage_id: RowKey,
    /// Current quantity.
    pub value: i64,
}

/// Grants a user access to a set of product properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Stable permission key.
    pub id: RowKey,
    /// User the permission applies to.
    pub user_id: String,
    /// Restricts the grant to one storage; `None` applies everywhere.
    pub storage_id: Option<RowKey>,
    /// Properties the user may read.
    pub readable: BTreeSet<ProductProperty>,
    /// Properties the user may write.
    pub writable: BTreeSet<ProductProperty>,
}

/// Insert payload for a new [`Permission`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PermissionDraft {
    /// User the permission applies to.
    pub user_id: String,
    /// Optional storage scope, which must exist.
    pub storage_id: Option<RowKey>,
    /// Properties the user may read.
    pub readable: BTreeSet<ProductProperty>,
    /// Properties the user may write.
    pub writable: BTreeSet<ProductProperty>,
}

/// Sparse permission patch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionPatch {
    /// Optional replacement readable set.
    pub readable: Option<BTreeSet<ProductProperty>>,
    /// Optional replacement writable set.
    pub writable: Option<BTreeSet<ProductProperty>>,
}

impl PermissionPatch {
    /// Applies this patch in place to `row`.
    pub fn apply_to(&self, row: &mut Permission) {
        if let Some(v) = &self.readable {
            row.readable = v.clone();
        }
        if let Some(v) = &self.writable {
            row.writable = v.clone();
        }
    }
}

/// Any live row of an entity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    /// Row of [`Table::Storages`].
    Storage(Storage),
    /// Row of [`Table::ProductGroups`].
    ProductGroup(ProductGroup),
    /// Row of [`Table::Products`].
    Product(Product),
    /// Row of [`Table::Stock`].
    Stock(StockEntry),
    /// Row of [`Table::Permissions`].
    Permission(Permission),
}

impl Row {
    /// Table this row lives in.
    pub fn table(&self) -> Table {
        match self {
            Row::Storage(_) => Table::Storages,
            Row::ProductGroup(_) => Table::ProductGroups,
            Row::Product(_) => Table::Products,
            Row::Stock(_) => Table::Stock,
            Row::Permission(_) => Table::Permissions,
        }
    }

    /// Row key within its table.
    pub fn key(&self) -> &RowKey {
        match self {
            Row::Storage(r) => &r.id,
            Row::ProductGroup(r) => &r.id,
            Row::Product(r) => &r.id,
            Row::Stock(r) => &r.id,
            Row::Permission(r) => &r.id,
        }
    }

    /// Full field snapshot of the row.
    pub fn fields(&self) -> Fields {
        let mut f = Fields::new();
        match self {
            Row::Storage(r) => {
                put(&mut f, "id", r.id.clone());
                put(&mut f, "name", r.name.clone());
                put(&mut f, "description", r.description.clone());
            }
            Row::ProductGroup(r) => {
                put(&mut f, "id", r.id.clone());
                put(&mut f, "name", r.name.clone());
                put(&mut f, "description", r.description.clone());
                put(&mut f, "parent_id", r.parent_id.clone());
            }
            Row::Product(r) => {
                put(&mut f, "id", r.id.clone());
                put(&mut f, "name", r.name.clone());
                put(&mut f, "item_number", r.item_number.clone());
                put(&mut f, "price", r.price);
                put(&mut f, "group_id", r.group_id.clone());
                put(&mut f, "stock_value", r.stock_value);
            }
            Row::Stock(r) => {
                put(&mut f, "id", r.id.clone());
                put(&mut f, "product_id", r.product_id.clone());
                put(&mut f, "storage_id", r.storage_id.clone());
                put(&mut f, "value", r.value);
            }
            Row::Permission(r) => {
                put(&mut f, "id", r.id.clone());
                put(&mut f, "user_id", r.user_id.clone());
                put(&mut f, "storage_id", r.storage_id.clone());
                put(&mut f, "readable", property_list(&r.readable));
                put(&mut f, "writable", property_list(&r.writable));
            }
        }
        f
    }

    /// Rebuilds a typed row from a full snapshot, e.g. while replaying a journal.
    pub fn from_fields(table: Table, fields: Fields) -> Result<Self, serde_json::Error> {
        let value = Value::Object(fields);
        let row = match table {
            Table::Storages => Row::Storage(serde_json::from_value(value)?),
            Table::ProductGroups => Row::ProductGroup(serde_json::from_value(value)?),
            Table::Products => Row::Product(serde_json::from_value(value)?),
            Table::Stock => Row::Stock(serde_json::from_value(value)?),
            Table::Permissions => Row::Permission(serde_json::from_value(value)?),
            Table::Changelog => {
                return Err(serde::de::Error::custom("changelog rows are not entities"));
            }
        };
        Ok(row)
    }
}

// A present key, `null` included, means "set"; an absent key keeps the outer `None`.
fn present<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

fn put(fields: &mut Fields, name: &str, value: impl Into<Value>) {
    fields.insert(name.to_string(), value.into());
}

fn property_list(props: &BTreeSet<ProductProperty>) -> Value {
    Value::Array(props.iter().map(|p| Value::from(p.as_str())).collect())
}
