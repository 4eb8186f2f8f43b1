use serde_json::json;
use uuid::Uuid;

use stocksync::{
    change::{ChangeKind, ChangeRecord},
    core::changelog::Changelog,
    sync::compactor::{compact, compact_records},
    types::{ActorId, Fields, Revision, Table},
};

fn fields(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn rec(revision: Revision, key: &str, kind: ChangeKind, payload: Option<serde_json::Value>) -> ChangeRecord {
    ChangeRecord {
        id: Uuid::new_v4(),
        revision,
        actor: ActorId::new("tester"),
        table: Table::Products,
        key: key.to_string(),
        kind,
        payload: payload.map(fields),
        ts_ms: revision * 10,
    }
}

fn log_of(records: Vec<ChangeRecord>) -> Changelog {
    let mut log = Changelog::new();
    for r in records {
        log.append(r).expect("append");
    }
    log
}

#[test]
fn insert_update_delete_annihilates() {
    let log = log_of(vec![
        rec(5, "k", ChangeKind::Insert, Some(json!({"name": "A", "price": 10}))),
        rec(7, "k", ChangeKind::Update, Some(json!({"price": 12}))),
        rec(9, "k", ChangeKind::Delete, None),
    ]);

    assert_eq!(compact(&log, Table::Products, "k", 1, 10), None);
}

#[test]
fn insert_then_updates_merge_into_one_insert() {
    let log = log_of(vec![
        rec(5, "k", ChangeKind::Insert, Some(json!({"name": "A", "price": 10}))),
        rec(7, "k", ChangeKind::Update, Some(json!({"price": 12}))),
        rec(9, "k", ChangeKind::Update, Some(json!({"name": "B"}))),
    ]);

    let out = compact(&log, Table::Products, "k", 1, 10).expect("record");
    assert_eq!(out.kind, ChangeKind::Insert);
    assert_eq!(out.payload, Some(fields(json!({"name": "B", "price": 12}))));
    assert_eq!(out.revision, 9);
    assert_eq!(out.table, Table::Products);
    assert_eq!(out.key, "k");
}

#[test]
fn updates_then_delete_without_insert_yield_bare_delete() {
    let log = log_of(vec![
        rec(2, "k", ChangeKind::Insert, Some(json!({"name": "A", "price": 1}))),
        rec(6, "k", ChangeKind::Update, Some(json!({"price": 5}))),
        rec(8, "k", ChangeKind::Delete, None),
    ]);

    let out = compact(&log, Table::Products, "k", 3, 10).expect("record");
    assert_eq!(out.kind, ChangeKind::Delete);
    assert_eq!(out.payload, None);
    assert_eq!(out.revision, 8);
}

#[test]
fn updates_only_fold_later_values_over_earlier_ones() {
    let log = log_of(vec![
        rec(1, "k", ChangeKind::Insert, Some(json!({"name": "A", "price": 1, "stock_value": 0}))),
        rec(2, "k", ChangeKind::Update, Some(json!({"price": 5, "name": "X"}))),
        rec(3, "other", ChangeKind::Insert, Some(json!({"name": "O"}))),
        rec(4, "k", ChangeKind::Update, Some(json!({"price": 7}))),
    ]);

    let out = compact(&log, Table::Products, "k", 2, 4).expect("record");
    assert_eq!(out.kind, ChangeKind::Update);
    assert_eq!(out.payload, Some(fields(json!({"name": "X", "price": 7}))));
}

#[test]
fn window_bounds_are_inclusive_and_inverted_ranges_are_empty() {
    let log = log_of(vec![
        rec(1, "k", ChangeKind::Insert, Some(json!({"name": "A"}))),
        rec(2, "k", ChangeKind::Update, Some(json!({"name": "B"}))),
    ]);

    let only_insert = compact(&log, Table::Products, "k", 1, 1).expect("record");
    assert_eq!(only_insert.kind, ChangeKind::Insert);
    assert_eq!(only_insert.payload, Some(fields(json!({"name": "A"}))));

    assert_eq!(compact(&log, Table::Products, "k", 3, 2), None);
    assert_eq!(compact(&log, Table::Products, "k", 3, 10), None);
    assert_eq!(compact(&log, Table::Products, "missing", 0, 10), None);
    assert_eq!(compact(&log, Table::Storages, "k", 0, 10), None);
}

#[test]
fn compaction_is_idempotent() {
    let log = log_of(vec![
        rec(1, "k", ChangeKind::Insert, Some(json!({"name": "A", "price": 1}))),
        rec(2, "k", ChangeKind::Update, Some(json!({"price": 2}))),
        rec(3, "k", ChangeKind::Update, Some(json!({"price": 3, "name": "C"}))),
    ]);

    for (from, to) in [(0, 3), (1, 2), (2, 3), (3, 3)] {
        let a = compact(&log, Table::Products, "k", from, to);
        let b = compact(&log, Table::Products, "k", from, to);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).expect("encode"),
            serde_json::to_vec(&b).expect("encode")
        );
    }
}

#[test]
fn compact_records_ignores_input_order() {
    let records = vec![
        rec(9, "k", ChangeKind::Update, Some(json!({"name": "B"}))),
        rec(5, "k", ChangeKind::Insert, Some(json!({"name": "A", "price": 10}))),
        rec(7, "k", ChangeKind::Update, Some(json!({"price": 12}))),
    ];

    let out = compact_records(&records).expect("record");
    assert_eq!(out.kind, ChangeKind::Insert);
    assert_eq!(out.payload, Some(fields(json!({"name": "B", "price": 12}))));
    assert_eq!(compact_records(&Vec::<ChangeRecord>::new()), None);
}
