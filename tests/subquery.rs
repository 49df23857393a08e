mod common;

use std::sync::Arc;

use common::*;
use marlinsql::{PlanOptions, QueryValue};
use uuid::Uuid;

fn linked_dataset() -> Arc<MockRemote> {
    let remote = Arc::new(MockRemote::new());
    let parent_a = Uuid::new_v4();
    let parent_b = Uuid::new_v4();
    remote.insert_rows(
        "account",
        vec![
            account_row(parent_a, "Has contacts", 10, 0),
            account_row(parent_b, "Inactive contacts", 20, 0),
            account_row(Uuid::new_v4(), "No contacts", 30, 0),
        ],
    );
    remote.insert_rows(
        "contact",
        vec![
            marlinsql::Row::from_pairs([
                ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
                ("parentaccountid".to_string(), QueryValue::Uuid(parent_a)),
                ("statecode".to_string(), QueryValue::Int(0)),
                ("fullname".to_string(), QueryValue::Text("Active".into())),
            ]),
            marlinsql::Row::from_pairs([
                ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
                ("parentaccountid".to_string(), QueryValue::Uuid(parent_b)),
                ("statecode".to_string(), QueryValue::Int(1)),
                ("fullname".to_string(), QueryValue::Text("Dormant".into())),
            ]),
        ],
    );
    remote
}

#[tokio::test]
async fn in_subquery_becomes_semi_join() {
    let engine = engine(linked_dataset());
    let result = engine
        .execute(
            "SELECT name FROM account WHERE accountid IN \
             (SELECT parentaccountid FROM contact WHERE statecode = 0)",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.get(0, "name"),
        Some(&QueryValue::Text("Has contacts".into()))
    );
    // A semi join of two scans, not a correlated client filter.
    let plan = result.plan.unwrap();
    assert!(plan.contains("HashJoin(semi"));
    assert_eq!(plan.matches("FetchScan").count(), 2);
}

#[tokio::test]
async fn not_in_subquery_is_null_aware() {
    let remote = linked_dataset();
    let engine = engine(remote.clone());
    let result = engine
        .execute(
            "SELECT name FROM account WHERE accountid NOT IN \
             (SELECT parentaccountid FROM contact)",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.get(0, "name"),
        Some(&QueryValue::Text("No contacts".into()))
    );

    // A null in the subquery output makes NOT IN filter everything.
    remote.insert_rows(
        "contact",
        vec![marlinsql::Row::from_pairs([
            ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
            ("parentaccountid".to_string(), QueryValue::Null),
            ("statecode".to_string(), QueryValue::Int(0)),
        ])],
    );
    let result = engine
        .execute(
            "SELECT name FROM account WHERE accountid NOT IN \
             (SELECT parentaccountid FROM contact)",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 0);
}

#[tokio::test]
async fn correlated_exists_decorrelates_to_semi_join() {
    let engine = engine(linked_dataset());
    let result = engine
        .execute(
            "SELECT a.name FROM account a WHERE EXISTS \
             (SELECT contactid FROM contact WHERE parentaccountid = a.accountid \
              AND statecode = 0)",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.get(0, "name"),
        Some(&QueryValue::Text("Has contacts".into()))
    );
}

#[tokio::test]
async fn not_exists_is_anti_join() {
    let engine = engine(linked_dataset());
    let result = engine
        .execute(
            "SELECT a.name FROM account a WHERE NOT EXISTS \
             (SELECT contactid FROM contact WHERE parentaccountid = a.accountid)",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.get(0, "name"),
        Some(&QueryValue::Text("No contacts".into()))
    );
}

#[tokio::test]
async fn uncorrelated_scalar_subquery_binds_once() {
    let engine = engine(linked_dataset());
    let result = engine
        .execute(
            "SELECT name FROM account WHERE revenue > \
             (SELECT MIN(revenue) FROM account)",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 2);
    assert!(result.plan.unwrap().contains("SubqueryBind"));
}

#[tokio::test]
async fn correlated_scalar_subquery_in_projection() {
    let engine = engine(linked_dataset());
    let result = engine
        .execute(
            "SELECT a.name, \
                    (SELECT MIN(statecode) FROM contact \
                     WHERE parentaccountid = a.accountid) AS minstate \
             FROM account a ORDER BY a.name",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 3);
    assert_eq!(int_value(&result, 0, "minstate"), 0); // Has contacts
    assert_eq!(int_value(&result, 1, "minstate"), 1); // Inactive contacts
    assert!(result.get(2, "minstate").unwrap().is_null()); // No contacts
    assert!(result.plan.unwrap().contains("HashJoin(single-row left"));
}

#[tokio::test]
async fn correlated_scalar_subquery_in_where() {
    let engine = engine(linked_dataset());
    let result = engine
        .execute(
            "SELECT a.name FROM account a WHERE \
             (SELECT COUNT(*) FROM contact WHERE parentaccountid = a.accountid) > 0 \
             ORDER BY a.name",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 2);
    assert_eq!(
        result.get(0, "name"),
        Some(&QueryValue::Text("Has contacts".into()))
    );
    assert_eq!(
        result.get(1, "name"),
        Some(&QueryValue::Text("Inactive contacts".into()))
    );
}

#[tokio::test]
async fn correlated_scalar_subquery_asserts_single_row() {
    let remote = Arc::new(MockRemote::new());
    let parent = Uuid::new_v4();
    remote.insert_rows("account", vec![account_row(parent, "Crowded", 1, 0)]);
    remote.insert_rows(
        "contact",
        (0..2)
            .map(|i| {
                marlinsql::Row::from_pairs([
                    ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
                    ("parentaccountid".to_string(), QueryValue::Uuid(parent)),
                    ("statecode".to_string(), QueryValue::Int(i)),
                ])
            })
            .collect(),
    );
    let engine = engine(remote);
    let err = engine
        .execute(
            "SELECT a.name, \
                    (SELECT statecode FROM contact \
                     WHERE parentaccountid = a.accountid) AS state \
             FROM account a",
            PlanOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("more than one row"));
}

#[tokio::test]
async fn uncorrelated_exists_in_condition() {
    let engine = engine(linked_dataset());
    let result = engine
        .execute(
            "IF EXISTS (SELECT contactid FROM contact WHERE statecode = 0)\n\
                 SELECT 'yes' AS found\n\
             ELSE\n\
                 SELECT 'no' AS found",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        result.get(0, "found"),
        Some(&QueryValue::Text("yes".into()))
    );
}
