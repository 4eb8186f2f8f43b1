//! Shared primitive IDs, table names, and field maps.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Global changelog revision. `0` means "nothing applied yet".
pub type Revision = u64;
/// Server-assigned row identifier, unique within its table and never reused.
pub type RowKey = String;
/// Field name to value mapping used for snapshots and update payloads.
///
/// Backed by a sorted map so two equal payloads always serialize identically.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Identity of whoever caused a mutation, supplied by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Name used for changes made by the system itself (catalog import, cascades).
    pub const SYSTEM: &'static str = "system";

    /// Wraps an already validated actor identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The distinguished system actor.
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    /// Returns true for [`ActorId::system`].
    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }

    /// Borrows the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical entity collections tracked by the changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Physical or logical storage locations.
    Storages,
    /// Catalog product groups.
    ProductGroups,
    /// Catalog products.
    Products,
    /// Stock quantity per product and storage.
    Stock,
    /// Per-user property permissions.
    Permissions,
    /// The changelog itself, shipped verbatim to clients.
    Changelog,
}

impl Table {
    /// Every table, in a stable order.
    pub const ALL: [Table; 6] = [
        Table::Storages,
        Table::ProductGroups,
        Table::Products,
        Table::Stock,
        Table::Permissions,
        Table::Changelog,
    ];

    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Storages => "storages",
            Table::ProductGroups => "product_groups",
            Table::Products => "products",
            Table::Stock => "stock",
            Table::Permissions => "permissions",
            Table::Changelog => "changelog",
        }
    }

    /// Inverse of [`Table::as_str`].
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product fields a permission can expose or allow editing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductProperty {
    /// Display name.
    Name,
    /// Article / item number.
    ItemNumber,
    /// Sale price.
    Price,
    /// Owning product group.
    Group,
    /// Aggregate stock value reported by the catalog.
    StockValue,
    /// Per-storage stock rows.
    Stock,
}

impl ProductProperty {
    /// Serialized name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ProductProperty::Name => "name",
            ProductProperty::ItemNumber => "item_number",
            ProductProperty::Price => "price",
            ProductProperty::Group => "group",
            ProductProperty::StockValue => "stock_value",
            ProductProperty::Stock => "stock",
        }
    }
}
