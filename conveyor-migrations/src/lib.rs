use sqlx::migrate::{MigrateError, Migrator};
use sqlx::SqlitePool;

pub static SQLITE_MIGRATOR: Migrator = sqlx::migrate!("src/migrations_sqlite");

pub fn sqlite_migrator() -> &'static Migrator {
    &SQLITE_MIGRATOR
}

/// Apply every pending migration to `pool`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), MigrateError> {
    SQLITE_MIGRATOR.run(pool).await
}
