mod common;

use std::sync::Arc;

use common::*;
use marlinsql::{PlanOptions, QueryValue};
use uuid::Uuid;

fn seeded_remote() -> Arc<MockRemote> {
    let remote = Arc::new(MockRemote::new());
    remote.insert_rows(
        "account",
        vec![
            account_row(Uuid::new_v4(), "Contoso", 500, 0),
            account_row(Uuid::new_v4(), "Fabrikam", 300, 0),
            account_row(Uuid::new_v4(), "Northwind", 100, 1),
        ],
    );
    remote
}

#[tokio::test]
async fn select_with_pushed_filter() {
    let remote = seeded_remote();
    let engine = engine(remote.clone());
    let result = engine
        .execute(
            "SELECT name FROM account WHERE statecode = 0",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 2);
    // The filter traveled in the XML, not through a client filter.
    let xml = result.executed_xml.as_deref().unwrap();
    assert!(xml.contains("<condition attribute=\"statecode\" operator=\"eq\" value=\"0\"/>"));
    assert!(!result.plan.as_deref().unwrap().contains("Filter("));
}

#[tokio::test]
async fn select_residual_filter_stays_client_side() {
    let remote = seeded_remote();
    let engine = engine(remote.clone());
    let result = engine
        .execute(
            "SELECT name FROM account WHERE UPPER(name) = 'CONTOSO'",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert!(result.plan.as_deref().unwrap().contains("Filter("));
}

#[tokio::test]
async fn select_pushed_order_and_top() {
    let remote = seeded_remote();
    let engine = engine(remote.clone());
    let result = engine
        .execute(
            "SELECT TOP 2 name, revenue FROM account ORDER BY revenue DESC",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 2);
    assert_eq!(int_value(&result, 0, "revenue"), 500);
    assert_eq!(int_value(&result, 1, "revenue"), 300);
    let xml = result.executed_xml.as_deref().unwrap();
    assert!(xml.contains("top=\"2\""));
    assert!(xml.contains("<order attribute=\"revenue\" descending=\"true\"/>"));
}

#[tokio::test]
async fn select_computed_projection_and_alias() {
    let engine = engine(seeded_remote());
    let result = engine
        .execute(
            "SELECT UPPER(name) AS shout, revenue * 2 AS double_rev FROM account \
             WHERE name = 'Contoso'",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        result.get(0, "shout"),
        Some(&QueryValue::Text("CONTOSO".into()))
    );
    assert_eq!(int_value(&result, 0, "double_rev"), 1000);
}

#[tokio::test]
async fn select_without_from() {
    let engine = engine(Arc::new(MockRemote::new()));
    let result = engine
        .execute("SELECT 1 + 1 AS two, 'x' AS tag", PlanOptions::default())
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(int_value(&result, 0, "two"), 2);
}

#[tokio::test]
async fn union_all_concatenates_without_distinct() {
    let remote = Arc::new(MockRemote::new());
    remote.insert_rows(
        "account",
        vec![account_row(Uuid::new_v4(), "A", 1, 0)],
    );
    remote.insert_rows(
        "contact",
        vec![marlinsql::Row::from_pairs([
            ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
            ("fullname".to_string(), QueryValue::Text("A".into())),
        ])],
    );
    let engine = engine(remote);
    let result = engine
        .execute(
            "SELECT name FROM account UNION ALL SELECT fullname FROM contact",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    // Row count is the sum of branches, no dedup.
    assert_eq!(result.row_count(), 2);
    let plan = result.plan.unwrap();
    assert!(plan.contains("Concatenate(2 branches)"));
    assert!(!plan.contains("Distinct"));
}

#[tokio::test]
async fn union_distinct_dedups() {
    let remote = Arc::new(MockRemote::new());
    remote.insert_rows("account", vec![account_row(Uuid::new_v4(), "A", 1, 0)]);
    remote.insert_rows(
        "contact",
        vec![marlinsql::Row::from_pairs([
            ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
            ("fullname".to_string(), QueryValue::Text("A".into())),
        ])],
    );
    let engine = engine(remote);
    let result = engine
        .execute(
            "SELECT name FROM account UNION SELECT fullname FROM contact",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert!(result.plan.unwrap().contains("Distinct"));
}

#[tokio::test]
async fn intersect_and_except() {
    let remote = Arc::new(MockRemote::new());
    remote.insert_rows(
        "account",
        vec![
            account_row(Uuid::new_v4(), "A", 1, 0),
            account_row(Uuid::new_v4(), "B", 2, 0),
        ],
    );
    remote.insert_rows(
        "contact",
        vec![marlinsql::Row::from_pairs([
            ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
            ("fullname".to_string(), QueryValue::Text("B".into())),
        ])],
    );
    let engine = engine(remote);

    let result = engine
        .execute(
            "SELECT name FROM account INTERSECT SELECT fullname FROM contact",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);

    let result = engine
        .execute(
            "SELECT name FROM account EXCEPT SELECT fullname FROM contact",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.get(0, "name"), Some(&QueryValue::Text("A".into())));
}

#[tokio::test]
async fn offset_fetch_pagination() {
    let engine = engine(seeded_remote());
    let result = engine
        .execute(
            "SELECT name FROM account ORDER BY revenue DESC \
             OFFSET 1 ROWS FETCH NEXT 1 ROWS ONLY",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.get(0, "name"),
        Some(&QueryValue::Text("Fabrikam".into()))
    );
}

#[tokio::test]
async fn join_two_entities() {
    let remote = Arc::new(MockRemote::new());
    let account_id = Uuid::new_v4();
    remote.insert_rows("account", vec![account_row(account_id, "Contoso", 10, 0)]);
    remote.insert_rows(
        "contact",
        vec![
            marlinsql::Row::from_pairs([
                ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
                ("fullname".to_string(), QueryValue::Text("Jo".into())),
                ("parentaccountid".to_string(), QueryValue::Uuid(account_id)),
            ]),
            marlinsql::Row::from_pairs([
                ("contactid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
                ("fullname".to_string(), QueryValue::Text("Orphan".into())),
                ("parentaccountid".to_string(), QueryValue::Uuid(Uuid::new_v4())),
            ]),
        ],
    );
    let engine = engine(remote);
    let result = engine
        .execute(
            "SELECT a.name, c.fullname FROM account a \
             INNER JOIN contact c ON a.accountid = c.parentaccountid",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.get(0, "fullname"),
        Some(&QueryValue::Text("Jo".into()))
    );
    // Two plain remote scans sorted on the key merge.
    assert!(result.plan.unwrap().contains("MergeJoin"));
}

#[tokio::test]
async fn left_join_pads_nulls() {
    let remote = Arc::new(MockRemote::new());
    remote.insert_rows("account", vec![account_row(Uuid::new_v4(), "Lonely", 1, 0)]);
    remote.insert_rows("contact", vec![]);
    let engine = engine(remote);
    let result = engine
        .execute(
            "SELECT a.name, c.fullname FROM account a \
             LEFT JOIN contact c ON a.accountid = c.parentaccountid AND c.statecode = 0",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert!(result.get(0, "fullname").unwrap().is_null());
}

#[tokio::test]
async fn cte_is_inlined() {
    let engine = engine(seeded_remote());
    let result = engine
        .execute(
            "WITH active AS (SELECT name, revenue FROM account WHERE statecode = 0) \
             SELECT name FROM active WHERE revenue > 400",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.get(0, "name"),
        Some(&QueryValue::Text("Contoso".into()))
    );
}

#[tokio::test]
async fn derived_table() {
    let engine = engine(seeded_remote());
    let result = engine
        .execute(
            "SELECT t.name FROM (SELECT name FROM account WHERE statecode = 0) t",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 2);
}

#[tokio::test]
async fn tabular_endpoint_routing() {
    let engine = engine(seeded_remote());
    let options = PlanOptions {
        use_tabular_endpoint: true,
        ..PlanOptions::default()
    };
    let result = engine
        .execute("SELECT name FROM account", options)
        .await
        .unwrap();
    assert_eq!(
        result.get(0, "source"),
        Some(&QueryValue::Text("tabular".into()))
    );

    // Variables disqualify the pass-through.
    let options = PlanOptions {
        use_tabular_endpoint: true,
        ..PlanOptions::default()
    };
    let result = engine
        .execute(
            "DECLARE @s INT = 0; SELECT name FROM account WHERE statecode = @s",
            options,
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 2); // the two active accounts
    assert!(result.get(0, "source").is_none());
}

#[tokio::test]
async fn metadata_virtual_tables() {
    let engine = engine(Arc::new(MockRemote::new()));
    let result = engine
        .execute(
            "SELECT logicalname FROM metadata.entity",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 2);
    let result = engine
        .execute(
            "SELECT logicalname FROM metadata.attribute WHERE entitylogicalname = 'account'",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), account_metadata().attributes.len());
}

#[tokio::test]
async fn explain_has_no_side_effects() {
    let remote = seeded_remote();
    let engine = engine(remote.clone());
    let plans = engine
        .explain("SELECT name FROM account", PlanOptions::default())
        .await
        .unwrap();
    assert_eq!(plans.len(), 1);
    assert!(plans[0].description.contains("Project"));
    assert_eq!(remote.fetches(), 0);
}

#[tokio::test]
async fn transpile_returns_fetch_xml() {
    let engine = engine(seeded_remote());
    let xml = engine
        .transpile(
            "SELECT name FROM account WHERE statecode = 0",
            PlanOptions::default(),
        )
        .await
        .unwrap();
    assert!(xml.starts_with("<fetch"));
    assert!(xml.contains("<entity name=\"account\">"));
    assert!(xml.contains("operator=\"eq\""));
}

#[tokio::test]
async fn error_payload_is_stable() {
    let engine = engine(Arc::new(MockRemote::new()));
    let err = engine
        .execute("SELECT FROM WHERE", PlanOptions::default())
        .await
        .unwrap_err();
    let payload = err.payload();
    assert_eq!(payload.code, "Query.ParseError");
    let json = serde_json::to_value(&payload).unwrap();
    assert!(json.get("message").is_some());
}
