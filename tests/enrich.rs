use std::collections::BTreeSet;

use commerce_medallion::{
    data::Value,
    dataset::Dataset,
    enrich::{JoinKey, Relation, enrich},
    error::PipelineError,
    schema::{ColumnMeta, ColumnType},
};
use proptest::prelude::*;

fn text(value: &str) -> Option<Value> {
    Some(Value::String(value.to_string()))
}

fn orders(customers: &[Option<&str>]) -> Dataset {
    Dataset::from_rows(
        "orders",
        vec![
            ColumnMeta::required("order_id", ColumnType::Integer),
            ColumnMeta::new("customer_id", ColumnType::String),
            ColumnMeta::new("status", ColumnType::String),
        ],
        customers
            .iter()
            .enumerate()
            .map(|(idx, customer)| {
                vec![
                    Some(Value::Integer(idx as i64 + 1)),
                    customer.and_then(text),
                    text("delivered"),
                ]
            })
            .collect(),
    )
}

fn customers(ids: &[&str]) -> Dataset {
    Dataset::from_rows(
        "customers",
        vec![
            ColumnMeta::required("customer_id", ColumnType::String),
            ColumnMeta::new("state", ColumnType::String),
            ColumnMeta::new("status", ColumnType::String),
        ],
        ids.iter()
            .map(|id| vec![text(id), text("SP"), text("active")])
            .collect(),
    )
}

#[test]
fn unmatched_orders_are_retained_with_missing_flag() {
    let primary = orders(&[Some("C1"), Some("C9")]);
    let relation = Relation::new("customers", customers(&["C1", "C2"]), JoinKey::same("customer_id"));
    let enriched = enrich(primary, &[relation]).expect("enrich");

    assert_eq!(enriched.len(), 2);
    assert_eq!(
        enriched.column_names(),
        vec![
            "order_id",
            "customer_id",
            "status",
            "state",
            "customers_status",
            "customers_missing"
        ]
    );
    assert_eq!(enriched.value(0, "state"), text("SP").as_ref());
    assert_eq!(enriched.value(0, "customers_missing"), Some(&Value::Boolean(false)));

    assert_eq!(enriched.value(1, "customer_id"), text("C9").as_ref());
    assert_eq!(enriched.value(1, "state"), None);
    assert_eq!(enriched.value(1, "customers_status"), None);
    assert_eq!(enriched.value(1, "customers_missing"), Some(&Value::Boolean(true)));

    let missing = &enriched.columns[enriched.column_index("customers_missing").unwrap()];
    assert!(!missing.nullable);
    assert!(enriched.columns[3].nullable);
}

#[test]
fn null_primary_keys_never_match() {
    let primary = orders(&[None]);
    let relation = Relation::new("customers", customers(&["C1"]), JoinKey::same("customer_id"));
    let enriched = enrich(primary, &[relation]).expect("enrich");
    assert_eq!(enriched.value(0, "customers_missing"), Some(&Value::Boolean(true)));
}

#[test]
fn duplicate_relation_keys_fail_before_joining() {
    let primary = orders(&[Some("C1")]);
    let relation = Relation::new(
        "customers",
        customers(&["C2", "C1", "C2", "C1", "C1"]),
        JoinKey::same("customer_id"),
    );
    let err = enrich(primary, &[relation]).expect_err("ambiguous");
    match err {
        PipelineError::AmbiguousJoinKey {
            relation,
            column,
            value,
            occurrences,
        } => {
            assert_eq!(relation, "customers");
            assert_eq!(column, "customer_id");
            assert_eq!(value, "C1");
            assert_eq!(occurrences, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn keys_compare_by_canonical_text_across_types() {
    let primary = Dataset::from_rows(
        "items",
        vec![ColumnMeta::new("product_id", ColumnType::Integer)],
        vec![vec![Some(Value::Integer(7))]],
    );
    let products = Dataset::from_rows(
        "products",
        vec![
            ColumnMeta::new("id", ColumnType::String),
            ColumnMeta::new("category", ColumnType::String),
        ],
        vec![vec![text("7"), text("toys")]],
    );
    let relation = Relation::new("products", products, JoinKey::new("product_id", "id"));
    let enriched = enrich(primary, &[relation]).expect("enrich");
    assert_eq!(enriched.value(0, "category"), text("toys").as_ref());
    assert_eq!(enriched.value(0, "products_missing"), Some(&Value::Boolean(false)));
}

#[test]
fn unknown_key_columns_are_rejected() {
    let relation = Relation::new("customers", customers(&["C1"]), JoinKey::same("client"));
    let err = enrich(orders(&[Some("C1")]), &[relation]).expect_err("unknown column");
    assert!(matches!(err, PipelineError::UnknownColumn { .. }));
}

fn key_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        1 => Just(None),
        6 => (0u8..12).prop_map(|k| Some(format!("C{k}"))),
    ]
}

proptest! {
    #[test]
    fn enriched_count_always_equals_primary_count(
        primary_keys in proptest::collection::vec(key_strategy(), 0..40),
        relation_keys in proptest::collection::btree_set(0u8..12, 0..12),
    ) {
        let refs: Vec<Option<&str>> = primary_keys.iter().map(|k| k.as_deref()).collect();
        let ids: Vec<String> = relation_keys.iter().map(|k| format!("C{k}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let relation = Relation::new("customers", customers(&id_refs), JoinKey::same("customer_id"));
        let enriched = enrich(orders(&refs), &[relation]).expect("unique keys");
        prop_assert_eq!(enriched.len(), primary_keys.len());

        for (row, key) in primary_keys.iter().enumerate() {
            let expected_missing = key.as_ref().is_none_or(|k| !ids.contains(k));
            prop_assert_eq!(
                enriched.value(row, "customers_missing"),
                Some(&Value::Boolean(expected_missing))
            );
        }
    }

    #[test]
    fn ambiguous_join_key_raised_iff_relation_has_duplicates(
        relation_keys in proptest::collection::vec(0u8..8, 0..16),
    ) {
        let ids: Vec<String> = relation_keys.iter().map(|k| format!("C{k}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let distinct: BTreeSet<&str> = id_refs.iter().copied().collect();
        let has_duplicates = distinct.len() != id_refs.len();

        let relation = Relation::new("customers", customers(&id_refs), JoinKey::same("customer_id"));
        let result = enrich(orders(&[Some("C1"), Some("C2")]), &[relation]);
        match result {
            Ok(enriched) => {
                prop_assert!(!has_duplicates);
                prop_assert_eq!(enriched.len(), 2);
            }
            Err(PipelineError::AmbiguousJoinKey { .. }) => prop_assert!(has_duplicates),
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }
}
