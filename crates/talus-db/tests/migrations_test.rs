//! Integration tests for database migrations and connection pooling.
//!
//! Each test creates a unique temporary database inside a shared
//! containerized PostgreSQL instance (via testcontainers), runs migrations,
//! and drops it on completion so tests are fully isolated and idempotent.

use talus_db::pool;
use talus_test_utils::{create_test_db, drop_test_db};

/// Expected tables created by the initial migration.
const EXPECTED_TABLES: &[&str] = &["job_dependencies", "jobs", "pipelines", "runs", "task_logs"];

#[tokio::test]
async fn migrations_create_all_tables() {
    let (temp_pool, db_name) = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(&temp_pool)
    .await
    .expect("should list tables");

    let user_tables: Vec<&str> = rows
        .iter()
        .map(|(name,)| name.as_str())
        .filter(|t| !t.starts_with("_sqlx"))
        .collect();

    assert_eq!(
        user_tables, EXPECTED_TABLES,
        "migration should create exactly the expected tables"
    );

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent_to_rerun() {
    let (temp_pool, db_name) = create_test_db().await;

    // Migrations already ran once inside create_test_db; running again
    // against the same database must be a no-op, not an error.
    pool::run_migrations(&temp_pool).await.expect("rerunning migrations should succeed");

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn table_counts_reports_zero_rows_on_a_fresh_database() {
    let (temp_pool, db_name) = create_test_db().await;

    let counts = pool::table_counts(&temp_pool).await.expect("should count tables");
    assert!(!counts.is_empty());
    for (table, count) in &counts {
        assert_eq!(*count, 0, "table {table} should start empty");
    }

    temp_pool.close().await;
    drop_test_db(&db_name).await;
}
