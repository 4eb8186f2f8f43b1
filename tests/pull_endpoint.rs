use serde_json::json;

use stocksync::{
    change::ChangeKind,
    client::replica::{Replica, ReplicaError},
    core::{mutation::Mutation, store::EntityStore},
    entity::{ProductDraft, ProductGroupDraft, ProductPatch, StorageDraft},
    sync::endpoint::{PullResponse, build_response, from_revision, pull},
    types::{ActorId, Table},
};

fn actor() -> ActorId {
    ActorId::new("admin")
}

fn create_storage(store: &mut EntityStore, name: &str) -> String {
    store
        .apply(
            &actor(),
            &Mutation::CreateStorage(StorageDraft {
                name: name.to_string(),
                description: None,
            }),
        )
        .expect("storage")
        .key
}

fn entity_changes(resp: &PullResponse) -> Vec<(Table, ChangeKind)> {
    resp.changes
        .iter()
        .filter(|c| c.table != Table::Changelog)
        .map(|c| (c.table, c.kind))
        .collect()
}

fn assert_replica_matches(replica: &Replica, store: &EntityStore) {
    for table in [
        Table::Storages,
        Table::ProductGroups,
        Table::Products,
        Table::Stock,
        Table::Permissions,
    ] {
        let expected: Vec<_> = store.rows(table).into_iter().map(|r| (r.key().clone(), r.fields())).collect();
        let actual: Vec<_> = replica
            .rows(table)
            .into_iter()
            .map(|(k, f)| (k.clone(), f.clone()))
            .collect();
        assert_eq!(actual, expected, "table {table}");
    }
}

#[test]
fn first_pull_of_stock_scenario_compacts_to_one_row_per_entity() {
    let mut store = EntityStore::new();
    let s1 = create_storage(&mut store, "S1");
    let g1 = store
        .apply(
            &actor(),
            &Mutation::CreateProductGroup(ProductGroupDraft {
                name: "G1".to_string(),
                ..ProductGroupDraft::default()
            }),
        )
        .expect("group")
        .key;
    let p1 = store
        .apply(
            &actor(),
            &Mutation::CreateProduct(ProductDraft {
                name: "P1".to_string(),
                group_id: Some(g1.clone()),
                stock_value: 0,
                ..ProductDraft::default()
            }),
        )
        .expect("product")
        .key;
    for delta in [10, -3] {
        store
            .apply(
                &actor(),
                &Mutation::PostStockDelta {
                    product_id: p1.clone(),
                    storage_id: s1.clone(),
                    delta,
                },
            )
            .expect("delta");
    }

    let resp = pull(store.changelog(), None);
    assert_eq!(resp.new_watermark, 5);
    assert_eq!(
        entity_changes(&resp),
        vec![
            (Table::Storages, ChangeKind::Insert),
            (Table::ProductGroups, ChangeKind::Insert),
            (Table::Products, ChangeKind::Insert),
            (Table::Stock, ChangeKind::Insert),
        ]
    );

    let stock = resp
        .changes
        .iter()
        .find(|c| c.table == Table::Stock)
        .expect("stock row");
    let payload = stock.payload.as_ref().expect("payload");
    assert_eq!(payload.get("value"), Some(&json!(7)));
    assert_eq!(payload.get("product_id"), Some(&json!(p1)));
    assert_eq!(stock.revision, 5);

    let changelog_rows = resp.changes.iter().filter(|c| c.table == Table::Changelog).count();
    assert_eq!(changelog_rows, 5);

    let mut replica = Replica::new();
    replica
        .apply_batch(&resp.changes, resp.new_watermark)
        .expect("apply");
    assert_eq!(replica.watermark(), Some(5));
    assert_replica_matches(&replica, &store);
    assert_eq!(replica.rows(Table::Changelog).len(), 5);
}

#[test]
fn pull_at_latest_watermark_is_empty() {
    let mut store = EntityStore::new();
    create_storage(&mut store, "S1");

    let first = pull(store.changelog(), None);
    let again = pull(store.changelog(), Some(first.new_watermark));
    assert!(again.is_empty());
    assert_eq!(again.new_watermark, first.new_watermark);

    let empty = pull(EntityStore::new().changelog(), None);
    assert!(empty.is_empty());
    assert_eq!(empty.new_watermark, 0);
}

#[test]
fn incremental_pull_ships_updates_and_deletes_for_known_rows() {
    let mut store = EntityStore::new();
    let keep = store
        .apply(
            &actor(),
            &Mutation::CreateProduct(ProductDraft {
                name: "Keep".to_string(),
                price: 5,
                ..ProductDraft::default()
            }),
        )
        .expect("keep")
        .key;
    let gone = create_storage(&mut store, "Gone");

    let mut replica = Replica::new();
    let first = pull(store.changelog(), None);
    replica.apply_batch(&first.changes, first.new_watermark).expect("first");

    store
        .apply(
            &actor(),
            &Mutation::UpdateProduct {
                id: keep.clone(),
                patch: ProductPatch {
                    price: Some(6),
                    ..ProductPatch::default()
                },
            },
        )
        .expect("price");
    store
        .apply(
            &actor(),
            &Mutation::UpdateProduct {
                id: keep.clone(),
                patch: ProductPatch {
                    name: Some("Kept".to_string()),
                    ..ProductPatch::default()
                },
            },
        )
        .expect("name");
    store
        .apply(&actor(), &Mutation::DeleteStorage { id: gone.clone() })
        .expect("delete");
    let transient = create_storage(&mut store, "Transient");
    store
        .apply(&actor(), &Mutation::DeleteStorage { id: transient })
        .expect("delete transient");

    let second = pull(store.changelog(), replica.watermark());
    assert_eq!(
        entity_changes(&second),
        vec![
            (Table::Products, ChangeKind::Update),
            (Table::Storages, ChangeKind::Delete),
        ]
    );
    let update = &second.changes[0];
    assert_eq!(
        update.payload.as_ref().expect("payload"),
        &serde_json::from_value::<stocksync::types::Fields>(json!({"price": 6, "name": "Kept"}))
            .expect("fields")
    );

    replica.apply_batch(&second.changes, second.new_watermark).expect("second");
    assert_replica_matches(&replica, &store);
}

#[test]
fn window_is_bounded_by_new_watermark() {
    let mut store = EntityStore::new();
    create_storage(&mut store, "A");
    create_storage(&mut store, "B");
    create_storage(&mut store, "C");

    let window = store.changelog().records().to_vec();
    let resp = build_response(&window, from_revision(Some(1)), 2);
    assert_eq!(resp.new_watermark, 2);
    assert_eq!(entity_changes(&resp), vec![(Table::Storages, ChangeKind::Insert)]);
    assert_eq!(resp.changes[0].revision, 2);
    assert_eq!(from_revision(None), 0);
}

#[test]
fn stale_replica_rejects_server_behind_it() {
    let mut store = EntityStore::new();
    create_storage(&mut store, "S1");

    let mut replica = Replica::new();
    let resp = pull(store.changelog(), None);
    replica.apply_batch(&resp.changes, resp.new_watermark).expect("apply");

    let err = replica
        .apply_batch(&[], 0)
        .expect_err("server behind replica");
    assert_eq!(err, ReplicaError::WatermarkAhead { local: 1, server: 0 });
    assert_eq!(replica.watermark(), Some(1));
}

#[test]
fn reapplying_an_insert_is_a_consistency_error_and_rolls_back() {
    let mut store = EntityStore::new();
    create_storage(&mut store, "S1");
    let resp = pull(store.changelog(), None);

    let mut replica = Replica::new();
    replica.apply_batch(&resp.changes, resp.new_watermark).expect("apply");
    let before = replica.clone();

    let err = replica
        .apply_batch(&resp.changes, resp.new_watermark)
        .expect_err("duplicate insert");
    assert!(matches!(err, ReplicaError::RowAlreadyExists { table: Table::Storages, .. }));
    assert_eq!(replica, before);
}
