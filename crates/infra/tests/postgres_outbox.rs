//! Postgres outbox tests.
//!
//! Need a database: `DATABASE_URL=postgres://... cargo test -p astra-infra -- --ignored`

use serde_json::json;
use sqlx::PgPool;

use astra_events::NativeEvent;
use astra_infra::{NewOutboxEvent, OutboxStatus, OutboxStore, PostgresOutbox};

fn trade(trade_id: &str) -> NewOutboxEvent {
    let native = NativeEvent::new("TradeExecuted", trade_id, json!({"qty": 1}));
    NewOutboxEvent::from_native("trading", &native).unwrap()
}

async fn create_trades_table(pool: &PgPool) {
    sqlx::query("CREATE TABLE trades (id TEXT PRIMARY KEY)")
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn committed_transaction_makes_row_visible(pool: PgPool) {
    create_trades_table(&pool).await;
    let outbox = PostgresOutbox::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    sqlx::query("INSERT INTO trades (id) VALUES ($1)")
        .bind("trade_1")
        .execute(&mut *tx)
        .await
        .unwrap();
    let id = PostgresOutbox::add_event(&mut tx, &trade("trade_1")).await.unwrap();
    tx.commit().await.unwrap();

    let row = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.aggregate_id, "trade_1");
    assert_eq!(row.domain, "trading");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn rolled_back_transaction_leaves_no_row(pool: PgPool) {
    create_trades_table(&pool).await;
    let outbox = PostgresOutbox::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    sqlx::query("INSERT INTO trades (id) VALUES ($1)")
        .bind("trade_2")
        .execute(&mut *tx)
        .await
        .unwrap();
    let id = PostgresOutbox::add_event(&mut tx, &trade("trade_2")).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(outbox.get(id).await.unwrap().is_none());
    assert_eq!(outbox.stats().await.unwrap().pending, 0);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn pending_respects_priority_and_negative_priorities_drain(pool: PgPool) {
    let outbox = PostgresOutbox::new(pool.clone());
    let mut tx = pool.begin().await.unwrap();
    let normal = PostgresOutbox::add_event(&mut tx, &trade("a")).await.unwrap();
    let held = PostgresOutbox::add_event(&mut tx, &trade("b").with_priority(-5)).await.unwrap();
    let urgent = PostgresOutbox::add_event(&mut tx, &trade("c").with_priority(9)).await.unwrap();
    tx.commit().await.unwrap();

    let order: Vec<i64> = outbox.pending(10).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(order, vec![urgent, normal, held]);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn failed_rows_redrive_to_pending(pool: PgPool) {
    let outbox = PostgresOutbox::new(pool.clone());
    let mut tx = pool.begin().await.unwrap();
    let a = PostgresOutbox::add_event(&mut tx, &trade("a")).await.unwrap();
    let b = PostgresOutbox::add_event(&mut tx, &trade("b")).await.unwrap();
    tx.commit().await.unwrap();

    assert!(outbox.mark_failed(a, "bad payload").await.unwrap());
    assert!(outbox.mark_published(b).await.unwrap());
    assert!(!outbox.mark_failed(b, "too late").await.unwrap());

    let failed = outbox.get(a).await.unwrap().unwrap();
    assert_eq!(failed.last_error.as_deref(), Some("bad payload"));

    assert_eq!(outbox.redrive(&[a, b]).await.unwrap(), 1);
    let row = outbox.get(a).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.last_error, None);

    let stats = outbox.stats().await.unwrap();
    assert_eq!((stats.pending, stats.published, stats.failed), (1, 1, 0));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn marking_unknown_row_is_not_found(pool: PgPool) {
    let outbox = PostgresOutbox::new(pool);
    assert!(matches!(
        outbox.mark_published(987_654).await,
        Err(astra_infra::OutboxError::NotFound(987_654))
    ));
}
