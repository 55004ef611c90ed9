//! Metadata schema and migrations
//!
//! Migrations are numbered and recorded in the `migrations` table; each one
//! runs in its own transaction. After migrating, links that point at a
//! missing file row are counted and reported, since reads through them fail.

use crate::error::Result;
use sqlx::sqlite::SqlitePool;

const MIGRATIONS: &[(i32, &str)] = &[(1, include_str!("migrations/001_initial_schema.sql"))];

/// Bring the schema up to date
pub async fn initialize_database(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i32 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
        .fetch_one(pool)
        .await?;

    let pending: Vec<_> = MIGRATIONS
        .iter()
        .filter(|(version, _)| *version > current_version)
        .collect();
    if pending.is_empty() {
        tracing::debug!("Blob metadata schema is at version {}", current_version);
    }

    for (version, sql) in pending {
        apply_migration(pool, *version, sql).await?;
    }

    let dangling = count_dangling_links(pool).await?;
    if dangling > 0 {
        tracing::warn!("{} binary property link(s) point at a missing file row", dangling);
    }

    Ok(())
}

async fn apply_migration(pool: &SqlitePool, version: i32, sql: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    sqlx::query("INSERT INTO migrations (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!("Applied blob metadata migration {}", version);
    Ok(())
}

/// Links whose file row no longer exists
pub async fn count_dangling_links(pool: &SqlitePool) -> Result<i64> {
    let count = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM BinaryProperties B
        WHERE NOT EXISTS (SELECT 1 FROM Files F WHERE F.FileId = B.FileId)
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}
