use hashbrown::HashMap;

use crate::types::{RowKey, Table};

/// Identity of one row across all tables.
pub type RowRef = (Table, RowKey);

/// Positions into an append-only vector, grouped by key.
pub type VecIndex<K> = HashMap<K, Vec<usize>>;
