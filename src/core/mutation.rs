use crate::{
    entity::{
        PermissionDraft, PermissionPatch, ProductDraft, ProductGroupDraft, ProductGroupPatch,
        ProductPatch, StorageDraft, StoragePatch,
    },
    types::RowKey,
};

/// Administrative write against the entity store.
///
/// Each mutation commits atomically together with the change records it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Create a storage.
    CreateStorage(StorageDraft),
    /// Patch a storage.
    UpdateStorage {
        /// Storage key.
        id: RowKey,
        /// Fields to overwrite.
        patch: StoragePatch,
    },
    /// Delete a storage together with its stock rows and scoped permissions.
    DeleteStorage {
        /// Storage key.
        id: RowKey,
    },
    /// Create a product group.
    CreateProductGroup(ProductGroupDraft),
    /// Patch a product group.
    UpdateProductGroup {
        /// Group key.
        id: RowKey,
        /// Fields to overwrite.
        patch: ProductGroupPatch,
    },
    /// Delete an unreferenced product group.
    DeleteProductGroup {
        /// Group key.
        id: RowKey,
    },
    /// Create a product.
    CreateProduct(ProductDraft),
    /// Patch a product.
    UpdateProduct {
        /// Product key.
        id: RowKey,
        /// Fields to overwrite.
        patch: ProductPatch,
    },
    /// Delete a product together with its stock rows.
    DeleteProduct {
        /// Product key.
        id: RowKey,
    },
    /// Add `delta` to the stock of a product in a storage, creating the row on first post.
    PostStockDelta {
        /// Product key.
        product_id: RowKey,
        /// Storage key.
        storage_id: RowKey,
        /// Signed quantity change.
        delta: i64,
    },
    /// Overwrite the stock of a product in a storage.
    SetStock {
        /// Product key.
        product_id: RowKey,
        /// Storage key.
        storage_id: RowKey,
        /// New absolute quantity.
        value: i64,
    },
    /// Grant a permission.
    GrantPermission(PermissionDraft),
    /// Patch a permission.
    UpdatePermission {
        /// Permission key.
        id: RowKey,
        /// Fields to overwrite.
        patch: PermissionPatch,
    },
    /// Revoke a permission.
    RevokePermission {
        /// Permission key.
        id: RowKey,
    },
}
