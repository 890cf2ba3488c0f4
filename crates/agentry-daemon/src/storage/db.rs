//! Database connection and initialization.

pub use agentry_core::db::DatabaseError;

agentry_core::define_database!(Database, "Database migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn open_file_runs_migrations() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open(&tmp.path().join("agentry.db")).await.unwrap();
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
