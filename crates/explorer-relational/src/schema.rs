//! Schema bootstrap.
//!
//! Folders use `parent_id = 0` for children of the root; the root itself
//! has no row. AUTOINCREMENT ids start at 1 and are never reused, so a row
//! id is stable for the lifetime of the resource and doubles as its search
//! document id.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::RelationalError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ent_id TEXT NOT NULL UNIQUE,
        application TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        parent_id INTEGER NOT NULL DEFAULT 0,
        creator_id TEXT NOT NULL DEFAULT '',
        trashed INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id)",
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_unique_id TEXT NOT NULL UNIQUE,
        ent_id TEXT NOT NULL,
        application TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        creator_id TEXT NOT NULL DEFAULT '',
        rights TEXT NOT NULL DEFAULT '',
        version INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS folder_resources (
        resource_id INTEGER NOT NULL,
        folder_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        UNIQUE(resource_id, user_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_folder_resources_folder ON folder_resources(folder_id)",
    r#"
    CREATE TABLE IF NOT EXISTS explorer_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_id TEXT NOT NULL,
        application TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        action TEXT NOT NULL,
        priority INTEGER NOT NULL,
        version INTEGER NOT NULL,
        payload TEXT NOT NULL,
        attempt_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (attempt_status IN ('pending', 'success')),
        attempted_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_explorer_queue_pending
        ON explorer_queue(attempt_status, priority DESC, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS explorer_queue_causes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue_id INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        cause TEXT NOT NULL,
        detail TEXT,
        dropped INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_explorer_queue_causes_queue ON explorer_queue_causes(queue_id)",
];

/// Create all tables and indexes if they do not exist.
pub async fn migrate(pool: &SqlitePool) -> Result<(), RelationalError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!(statements = SCHEMA.len(), "Schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::pool::connect_in_memory;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        super::migrate(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(
            names,
            vec![
                "explorer_queue",
                "explorer_queue_causes",
                "folder_resources",
                "folders",
                "resources"
            ]
        );
    }
}
