//! Round trips against a live Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p graphstore-infra -- --ignored`.
//! Each test writes to its own table and drops it afterwards.

use std::time::Duration;

use anyhow::Context;
use graphstore_core::{NodeMutation, NodeValue, TablePrefix};
use graphstore_infra::adapter::{AdapterError, GraphAdapter};
use graphstore_infra::config::StoreConfig;
use graphstore_infra::connector::{FromConfig, PgConnector};
use graphstore_infra::jobs::RetryPolicy;
use sqlx::postgres::PgPoolOptions;

/// Letters-only table prefix unique to one test run.
fn unique_prefix() -> TablePrefix {
    let suffix: String = uuid::Uuid::now_v7()
        .simple()
        .to_string()
        .chars()
        .map(|c| match c.to_digit(16) {
            Some(d) => char::from(b'a' + d as u8),
            None => c,
        })
        .collect();
    TablePrefix::parse(&format!("it_{suffix}")).expect("generated prefix is valid")
}

async fn setup() -> anyhow::Result<(GraphAdapter<PgConnector>, PgConnector, TablePrefix)> {
    graphstore_observability::init_for_tests();
    let config = StoreConfig::from_env()?;
    let connector = PgConnector::from_config(&config)?;
    let prefix = unique_prefix();

    let adapter = GraphAdapter::new();
    adapter
        .configure(connector.clone(), prefix.clone(), RetryPolicy::no_retry())
        .await?;
    Ok((adapter, connector, prefix))
}

async fn teardown(connector: &PgConnector, prefix: &TablePrefix) -> anyhow::Result<()> {
    sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", prefix.value_table()))
        .execute(connector.pool())
        .await?;
    connector.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn batch_round_trips_through_postgres() -> anyhow::Result<()> {
    let (adapter, connector, prefix) = setup().await?;

    let report = adapter
        .put(vec![
            NodeMutation::new("A", "x", 1, 1),
            NodeMutation::new("A", "y", "s", 1),
            NodeMutation::new("A", "z", NodeValue::Undefined, 1),
        ])
        .await?;
    assert_eq!(report.inserted, 3);

    let nodes = adapter.fetch("A", None).await?;
    let values: Vec<NodeValue> = nodes.into_iter().map(|n| n.value).collect();
    assert_eq!(
        values,
        vec![NodeValue::Number(1.0), NodeValue::Text("s".into()), NodeValue::Undefined]
    );

    let report = adapter.put(vec![NodeMutation::new("A", "x", 2, 2)]).await?;
    assert_eq!((report.updated, report.inserted), (1, 0));
    assert_eq!(adapter.fetch("A", Some("x")).await?[0].value, NodeValue::Number(2.0));

    teardown(&connector, &prefix).await
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn missing_key_is_lost() -> anyhow::Result<()> {
    let (adapter, connector, prefix) = setup().await?;
    assert_eq!(adapter.fetch("nobody", None).await, Err(AdapterError::Lost));
    teardown(&connector, &prefix).await
}

/// Connector whose sessions give up on a row lock after 100ms.
async fn impatient_connector() -> anyhow::Result<PgConnector> {
    let config = StoreConfig::from_env()?;
    let url = config.connection.url.context("DATABASE_URL is not set")?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::Executor::execute(conn, sqlx::raw_sql("SET lock_timeout = '100ms'")).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await?;
    Ok(PgConnector::new(pool))
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn update_is_retried_after_a_lock_timeout() -> anyhow::Result<()> {
    graphstore_observability::init_for_tests();
    let connector = impatient_connector().await?;
    let prefix = unique_prefix();
    let adapter = GraphAdapter::new();
    adapter
        .configure(
            connector.clone(),
            prefix.clone(),
            RetryPolicy::fixed(5, Duration::from_millis(200)),
        )
        .await?;

    adapter.put(vec![NodeMutation::new("A", "x", 1, 1)]).await?;

    // Another session holds the row for 300ms; the first update attempts time out.
    let mut locker = connector.pool().begin().await?;
    sqlx::query(&format!(
        "SELECT id FROM {} WHERE key = $1 AND field = $2 FOR UPDATE",
        prefix.value_table()
    ))
    .bind("A")
    .bind("x")
    .fetch_all(&mut *locker)
    .await?;
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        locker.rollback().await
    });

    let report = adapter.put(vec![NodeMutation::new("A", "x", 2, 2)]).await?;
    assert_eq!((report.updated, report.inserted), (1, 0));
    holder.await??;

    let nodes = adapter.fetch("A", Some("x")).await?;
    assert_eq!(nodes[0].value, NodeValue::Number(2.0));
    assert_eq!(nodes[0].state, 2);

    teardown(&connector, &prefix).await
}
