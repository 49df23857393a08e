mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use marlinsql::PlanOptions;

#[tokio::test]
async fn cancellation_mid_scan_stops_within_one_row() {
    // Each page takes 100ms; cancellation fires 50ms in, while the first
    // page is still in flight.
    let remote = Arc::new(MockRemote::new().with_fetch_delay_ms(100));
    remote.insert_rows(
        "account",
        (0..20_000)
            .map(|i| account_row(Uuid::new_v4(), &format!("r{}", i), i, 0))
            .collect(),
    );
    let engine = engine(remote);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let mut stream = engine.execute_streaming(
        "SELECT name FROM account",
        PlanOptions::default(),
        cancel,
    );
    let mut rows_after_cancel = 0usize;
    let error = loop {
        match stream.try_next().await {
            Ok(Some(marlinsql::RowBatch::Rows(chunk))) => rows_after_cancel += chunk.len(),
            Ok(Some(_)) => {}
            Ok(None) => panic!("stream ended without surfacing cancellation"),
            Err(e) => break e,
        }
    };
    assert_eq!(error.code(), "Query.Cancelled");
    // The prefetched page is dropped, never drained.
    assert_eq!(rows_after_cancel, 0);
}

#[tokio::test]
async fn cancellation_before_execution() {
    let remote = Arc::new(MockRemote::new());
    remote.insert_rows("account", vec![account_row(Uuid::new_v4(), "A", 1, 0)]);
    let engine = engine(remote);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine
        .execute_with_cancel("SELECT name FROM account", PlanOptions::default(), cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "Query.Cancelled");
}

#[tokio::test]
async fn cancellation_stops_parallel_partitions() {
    use chrono::TimeZone;

    let remote = Arc::new(
        MockRemote::new()
            .with_pool_capacity(2)
            .with_fetch_delay_ms(100),
    );
    let start = chrono::Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let end = chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    remote.insert_rows("account", uniform_accounts(200_000, start, end));
    let engine = engine(remote.clone());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        canceller.cancel();
    });

    let err = engine
        .execute_with_cancel(
            "SELECT COUNT(*) AS n FROM account",
            PlanOptions::default(),
            cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "Query.Cancelled");

    // In-flight partitions wind down; no further fetches are issued after a
    // settling delay.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = remote.fetches();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.fetches(), settled);
}
