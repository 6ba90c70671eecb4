use discovery_service::db::MIGRATOR;
use discovery_service::test_support::TestDatabase;

#[tokio::test]
async fn migrations_apply_and_revert_cleanly() {
    let test_db = TestDatabase::new().await.expect("provision test database");
    let pool = test_db.pool_clone();

    // TestDatabase::new already ran the migrations; revert them fully.
    MIGRATOR.undo(&pool, 0).await.expect("migrations revert");

    let email_tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'emails'",
    )
    .fetch_one(&pool)
    .await
    .expect("lookup succeeded");
    assert_eq!(email_tables, 0, "emails should be dropped after revert");

    MIGRATOR.run(&pool).await.expect("migrations rerun");

    let email_tables_after: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'emails'",
    )
    .fetch_one(&pool)
    .await
    .expect("lookup succeeded");
    assert_eq!(email_tables_after, 1);

    test_db.close().await.expect("failed to drop test database");
}
