//! Relational materialization of queued events.
//!
//! One transaction per batch with a savepoint per event, so a bad event
//! rolls back alone and its siblings still commit. Every event that makes
//! it through is enriched under its `override` namespace with fields
//! computed from the relational state:
//!
//! - folders: `parentId`, `childrenIds`, `ancestors` (root first), `name`,
//!   `visibleBy`
//! - resources: `folderIds`, `usersForFolderIds`, `visibleBy`, `creatorId`,
//!   `rights`
//!
//! When a folder changes parent, is created or is deleted, the old and new
//! parents are returned as derived events carrying a fresh `childrenIds`.
//! Deletes are soft here; `purge` removes the rows once the index write
//! for the delete has succeeded.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::{Connection, Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use explorer_types::{IngestAction, QueueToken, QueuedEvent, FOLDER_TYPE, ROOT_FOLDER_ID};

use crate::error::RelationalError;
use crate::hierarchy::HierarchyResolver;

/// Materializer behaviour switches.
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Leave links into trashed folders out of `folderIds`
    pub exclude_trashed_folders: bool,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            exclude_trashed_folders: true,
        }
    }
}

impl MaterializerConfig {
    pub fn with_exclude_trashed_folders(mut self, exclude: bool) -> Self {
        self.exclude_trashed_folders = exclude;
        self
    }
}

/// Result of materializing a batch.
#[derive(Debug, Default)]
pub struct Materialized {
    /// Enriched events to hand to the index writer
    pub ready: Vec<QueuedEvent>,
    /// Parent folder refreshes; indexed but never reported to the queue
    pub derived: Vec<QueuedEvent>,
    /// Logical no-ops: delete of a missing row, or an upsert not newer than
    /// the delete that removed its row. Already succeeded.
    pub noop: Vec<QueuedEvent>,
    /// Events that failed materialization, carrying `error`
    pub failed: Vec<QueuedEvent>,
}

enum Applied {
    Ready { touched: Vec<i64> },
    Noop,
}

/// Upserts folder/resource rows and enriches events.
pub struct Materializer {
    pool: SqlitePool,
    resolver: HierarchyResolver,
    config: MaterializerConfig,
}

impl Materializer {
    pub fn new(pool: SqlitePool, config: MaterializerConfig) -> Self {
        Self {
            pool,
            resolver: HierarchyResolver::new(),
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: HierarchyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Materialize a batch.
    ///
    /// Never fails as a whole: if the transaction itself cannot be opened
    /// or committed, every event comes back failed with that error.
    pub async fn materialize(&self, events: Vec<QueuedEvent>) -> Materialized {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return all_failed(events, &RelationalError::from(e)),
        };

        let mut out = Materialized::default();
        let mut touched: BTreeSet<i64> = BTreeSet::new();
        let mut pending = events.into_iter();

        while let Some(mut event) = pending.next() {
            let mut savepoint = match tx.begin().await {
                Ok(sp) => sp,
                Err(e) => {
                    let err = RelationalError::from(e);
                    let mut rest: Vec<QueuedEvent> = out.ready.drain(..).collect();
                    rest.extend(out.noop.drain(..));
                    rest.push(event);
                    rest.extend(pending);
                    let mut failed = all_failed(rest, &err);
                    failed.failed.extend(out.failed);
                    return failed;
                }
            };

            match self.apply(&mut savepoint, &mut event).await {
                Ok(applied) => match savepoint.commit().await {
                    Ok(()) => match applied {
                        Applied::Ready { touched: parents } => {
                            touched.extend(parents);
                            out.ready.push(event);
                        }
                        Applied::Noop => out.noop.push(event),
                    },
                    Err(e) => {
                        event.fail(RelationalError::from(e).to_string(), None);
                        out.failed.push(event);
                    }
                },
                Err(e) => {
                    if let Err(rollback) = savepoint.rollback().await {
                        warn!(error = %rollback, "Savepoint rollback failed");
                    }
                    debug!(
                        resource_id = %event.resource_id,
                        error = %e,
                        "Materialization failed"
                    );
                    event.fail(e.to_string(), Some(materialization_detail(&e)));
                    out.failed.push(event);
                }
            }
        }

        touched.remove(&ROOT_FOLDER_ID);
        if !touched.is_empty() {
            let ids: Vec<i64> = touched.into_iter().collect();
            match self.parent_refreshes(&mut tx, &ids).await {
                Ok(derived) => out.derived = derived,
                Err(e) => warn!(error = %e, "Could not compute parent refreshes"),
            }
        }

        if let Err(e) = tx.commit().await {
            let err = RelationalError::from(e);
            let mut rest: Vec<QueuedEvent> = out.ready;
            rest.extend(out.noop);
            let mut failed = all_failed(rest, &err);
            failed.failed.extend(out.failed);
            return failed;
        }

        info!(
            ready = out.ready.len(),
            derived = out.derived.len(),
            noop = out.noop.len(),
            failed = out.failed.len(),
            "Materialized batch"
        );
        out
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        event: &mut QueuedEvent,
    ) -> Result<Applied, RelationalError> {
        match (event.action, event.is_folder()) {
            (IngestAction::Upsert, true) => self.upsert_folder(conn, event).await,
            (IngestAction::Upsert, false) => self.upsert_resource(conn, event).await,
            (IngestAction::Delete, true) => self.delete_folder(conn, event).await,
            (IngestAction::Delete, false) => self.delete_resource(conn, event).await,
            (IngestAction::Audience, is_folder) => self.resolve_audience(conn, event, is_folder).await,
        }
    }

    async fn folder_id_by_ent(
        conn: &mut SqliteConnection,
        ent_id: &str,
    ) -> Result<Option<(i64, i64)>, RelationalError> {
        let row = sqlx::query("SELECT id, parent_id FROM folders WHERE ent_id = ?1 AND deleted = 0")
            .bind(ent_id)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("id")?, row.try_get("parent_id")?))),
            None => Ok(None),
        }
    }

    /// Resolve a folder reference from a payload. Absent, empty or "0"
    /// means the root.
    async fn resolve_folder_ref(
        conn: &mut SqliteConnection,
        reference: Option<String>,
    ) -> Result<i64, RelationalError> {
        match reference {
            None => Ok(ROOT_FOLDER_ID),
            Some(r) if r.is_empty() || r == ROOT_FOLDER_ID.to_string() => Ok(ROOT_FOLDER_ID),
            Some(r) => Self::folder_id_by_ent(conn, &r)
                .await?
                .map(|(id, _)| id)
                .ok_or(RelationalError::InvalidParent(r)),
        }
    }

    async fn upsert_folder(
        &self,
        conn: &mut SqliteConnection,
        event: &mut QueuedEvent,
    ) -> Result<Applied, RelationalError> {
        let parent_id = Self::resolve_folder_ref(conn, event.payload_str("parentId")).await?;

        let previous =
            sqlx::query("SELECT id, parent_id, deleted, version FROM folders WHERE ent_id = ?1")
                .bind(&event.resource_id)
                .fetch_optional(&mut *conn)
                .await?;
        let previous: Option<(i64, i64, bool)> = match previous {
            Some(row) => {
                let deleted: bool = row.try_get("deleted")?;
                let version: i64 = row.try_get("version")?;
                if deleted && event.version <= version {
                    return Ok(Applied::Noop);
                }
                Some((row.try_get("id")?, row.try_get("parent_id")?, deleted))
            }
            None => None,
        };

        if let Some((id, _, _)) = previous {
            if parent_id == id {
                return Err(RelationalError::Cycle {
                    folder: id,
                    parent: parent_id,
                });
            }
            if parent_id != ROOT_FOLDER_ID {
                let descendants = self.resolver.descendants_of(conn, &[id]).await?;
                if descendants
                    .get(&id)
                    .is_some_and(|list| list.contains(&parent_id))
                {
                    return Err(RelationalError::Cycle {
                        folder: id,
                        parent: parent_id,
                    });
                }
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO folders (
                ent_id, application, name, parent_id, creator_id, trashed,
                deleted, version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)
            ON CONFLICT(ent_id) DO UPDATE SET
                application = excluded.application,
                name = CASE WHEN excluded.name = '' THEN folders.name ELSE excluded.name END,
                parent_id = excluded.parent_id,
                creator_id = COALESCE(NULLIF(excluded.creator_id, ''), folders.creator_id),
                trashed = excluded.trashed,
                deleted = 0,
                version = MAX(folders.version, excluded.version),
                updated_at = excluded.updated_at
            WHERE excluded.version >= folders.version
            "#,
        )
        .bind(&event.resource_id)
        .bind(&event.application)
        .bind(event.payload_str("name").unwrap_or_default())
        .bind(parent_id)
        .bind(event.payload_str("creatorId").unwrap_or_default())
        .bind(event.payload_bool("trashed"))
        .bind(event.version)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(
            "SELECT id, name, parent_id, creator_id, trashed FROM folders WHERE ent_id = ?1",
        )
        .bind(&event.resource_id)
        .fetch_one(&mut *conn)
        .await?;
        let id: i64 = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        let stored_parent: i64 = row.try_get("parent_id")?;
        let creator: String = row.try_get("creator_id")?;
        let trashed: bool = row.try_get("trashed")?;

        let mut touched = Vec::new();
        match previous {
            None => touched.push(stored_parent),
            Some((_, old_parent, was_deleted)) => {
                if old_parent != stored_parent || was_deleted {
                    touched.push(old_parent);
                    touched.push(stored_parent);
                }
            }
        }

        self.enrich_folder(conn, event, id).await?;
        event.set_override("name", json!(name));
        event.set_override("trashed", json!(trashed));
        event.set_override("visibleBy", json!(visible_by(&creator, &[])));
        event.predictable_id = Some(id);

        Ok(Applied::Ready { touched })
    }

    async fn enrich_folder(
        &self,
        conn: &mut SqliteConnection,
        event: &mut QueuedEvent,
        id: i64,
    ) -> Result<(), RelationalError> {
        let relations = self.resolver.relationships_of(conn, &[id]).await?;
        let ancestors = self.resolver.ancestors_of(conn, &[id]).await?;

        let relation = relations.get(&id).cloned().unwrap_or_default();
        let mut top_down: Vec<i64> = ancestors.get(&id).cloned().unwrap_or_default();
        top_down.reverse();
        if top_down.first() != Some(&ROOT_FOLDER_ID) {
            top_down.insert(0, ROOT_FOLDER_ID);
        }

        event.set_override("parentId", json!(relation.parent.unwrap_or(ROOT_FOLDER_ID)));
        event.set_override("childrenIds", json!(relation.children));
        event.set_override("ancestors", json!(top_down));
        Ok(())
    }

    async fn upsert_resource(
        &self,
        conn: &mut SqliteConnection,
        event: &mut QueuedEvent,
    ) -> Result<Applied, RelationalError> {
        let unique_id = event.unique_id().to_string();
        let rights = payload_rights(&event.payload)?;
        let rights_text = if rights.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&rights)?
        };
        let previous =
            sqlx::query("SELECT version, deleted FROM resources WHERE resource_unique_id = ?1")
                .bind(&unique_id)
                .fetch_optional(&mut *conn)
                .await?;
        let mut stale = false;
        if let Some(row) = previous {
            let version: i64 = row.try_get("version")?;
            let deleted: bool = row.try_get("deleted")?;
            if deleted && event.version <= version {
                return Ok(Applied::Noop);
            }
            stale = event.version < version;
        }
        let now_ms = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO resources (
                resource_unique_id, ent_id, application, resource_type,
                creator_id, rights, version, deleted, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
            ON CONFLICT(resource_unique_id) DO UPDATE SET
                creator_id = COALESCE(NULLIF(excluded.creator_id, ''), resources.creator_id),
                rights = COALESCE(NULLIF(excluded.rights, ''), resources.rights),
                version = MAX(resources.version, excluded.version),
                deleted = 0,
                updated_at = excluded.updated_at
            WHERE excluded.version >= resources.version
            "#,
        )
        .bind(&unique_id)
        .bind(&event.resource_id)
        .bind(&event.application)
        .bind(&event.resource_type)
        .bind(event.payload_str("creatorId").unwrap_or_default())
        .bind(&rights_text)
        .bind(event.version)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(
            "SELECT id, creator_id, rights FROM resources WHERE resource_unique_id = ?1",
        )
        .bind(&unique_id)
        .fetch_one(&mut *conn)
        .await?;
        let id: i64 = row.try_get("id")?;
        let creator: String = row.try_get("creator_id")?;
        let stored_rights: String = row.try_get("rights")?;
        let stored_rights: Vec<String> = if stored_rights.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&stored_rights)?
        };

        if stale {
            debug!(
                resource = %unique_id,
                version = event.version,
                "Stale resource upsert, keeping stored rights and links"
            );
        } else {
            self.apply_links(conn, event, id).await?;
        }

        let (folder_ids, users) = self.folder_membership(conn, id).await?;
        event.set_override("folderIds", json!(folder_ids));
        event.set_override("usersForFolderIds", json!(users));
        event.set_override("visibleBy", json!(visible_by(&creator, &stored_rights)));
        event.set_override("creatorId", json!(creator));
        event.set_override("rights", json!(stored_rights));
        event.predictable_id = Some(id);

        Ok(Applied::Ready {
            touched: Vec::new(),
        })
    }

    /// Upsert `links: [{folderId, userId}]`; one folder per user per resource.
    async fn apply_links(
        &self,
        conn: &mut SqliteConnection,
        event: &QueuedEvent,
        resource_id: i64,
    ) -> Result<(), RelationalError> {
        let Some(links) = event.payload.get("links") else {
            return Ok(());
        };
        let links = links
            .as_array()
            .ok_or_else(|| RelationalError::InvalidPayload("links must be an array".into()))?;

        for link in links {
            let user_id = link
                .get("userId")
                .and_then(value_as_string)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| RelationalError::InvalidPayload("link without userId".into()))?;
            let folder_ref = link.get("folderId").and_then(value_as_string);
            let folder_id = Self::resolve_folder_ref(conn, folder_ref).await?;

            if folder_id == ROOT_FOLDER_ID {
                sqlx::query("DELETE FROM folder_resources WHERE resource_id = ?1 AND user_id = ?2")
                    .bind(resource_id)
                    .bind(&user_id)
                    .execute(&mut *conn)
                    .await?;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO folder_resources (resource_id, folder_id, user_id)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(resource_id, user_id) DO UPDATE SET folder_id = excluded.folder_id
                    "#,
                )
                .bind(resource_id)
                .bind(folder_id)
                .bind(&user_id)
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }

    /// Folder ids holding the resource and the users owning those links.
    async fn folder_membership(
        &self,
        conn: &mut SqliteConnection,
        resource_id: i64,
    ) -> Result<(Vec<i64>, Vec<String>), RelationalError> {
        let rows = sqlx::query(
            r#"
            SELECT fr.folder_id, fr.user_id,
                   COALESCE(f.trashed, 0) AS trashed,
                   COALESCE(f.deleted, 1) AS deleted
            FROM folder_resources fr
            LEFT JOIN folders f ON f.id = fr.folder_id
            WHERE fr.resource_id = ?1
            ORDER BY fr.folder_id, fr.user_id
            "#,
        )
        .bind(resource_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut folder_ids = BTreeSet::new();
        let mut users = BTreeSet::new();
        for row in rows {
            let trashed: bool = row.try_get("trashed")?;
            let deleted: bool = row.try_get("deleted")?;
            if deleted || (trashed && self.config.exclude_trashed_folders) {
                continue;
            }
            folder_ids.insert(row.try_get::<i64, _>("folder_id")?);
            users.insert(row.try_get::<String, _>("user_id")?);
        }
        Ok((folder_ids.into_iter().collect(), users.into_iter().collect()))
    }

    async fn delete_folder(
        &self,
        conn: &mut SqliteConnection,
        event: &mut QueuedEvent,
    ) -> Result<Applied, RelationalError> {
        let row = sqlx::query("SELECT id, parent_id FROM folders WHERE ent_id = ?1")
            .bind(&event.resource_id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(Applied::Noop);
        };
        let id: i64 = row.try_get("id")?;
        let parent: i64 = row.try_get("parent_id")?;

        sqlx::query(
            "UPDATE folders SET deleted = 1, version = MAX(version, ?1), updated_at = ?2 WHERE id = ?3",
        )
        .bind(event.version)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&mut *conn)
        .await?;

        event.predictable_id = Some(id);
        Ok(Applied::Ready {
            touched: vec![parent],
        })
    }

    async fn delete_resource(
        &self,
        conn: &mut SqliteConnection,
        event: &mut QueuedEvent,
    ) -> Result<Applied, RelationalError> {
        let unique_id = event.unique_id().to_string();
        let row = sqlx::query("SELECT id FROM resources WHERE resource_unique_id = ?1")
            .bind(&unique_id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(Applied::Noop);
        };
        let id: i64 = row.try_get("id")?;

        sqlx::query(
            "UPDATE resources SET deleted = 1, version = MAX(version, ?1), updated_at = ?2 WHERE id = ?3",
        )
        .bind(event.version)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&mut *conn)
        .await?;

        event.predictable_id = Some(id);
        Ok(Applied::Ready {
            touched: Vec::new(),
        })
    }

    /// Audience updates only need the document id of a live row.
    async fn resolve_audience(
        &self,
        conn: &mut SqliteConnection,
        event: &mut QueuedEvent,
        is_folder: bool,
    ) -> Result<Applied, RelationalError> {
        let row = if is_folder {
            sqlx::query("SELECT id FROM folders WHERE ent_id = ?1 AND deleted = 0")
                .bind(&event.resource_id)
                .fetch_optional(&mut *conn)
                .await?
        } else {
            sqlx::query("SELECT id FROM resources WHERE resource_unique_id = ?1 AND deleted = 0")
                .bind(event.unique_id().to_string())
                .fetch_optional(&mut *conn)
                .await?
        };
        let row = row.ok_or_else(|| RelationalError::NotMaterialized(event.unique_id().to_string()))?;
        event.predictable_id = Some(row.try_get("id")?);
        Ok(Applied::Ready {
            touched: Vec::new(),
        })
    }

    /// Derived events refreshing `childrenIds` of live parent folders.
    async fn parent_refreshes(
        &self,
        conn: &mut SqliteConnection,
        ids: &[i64],
    ) -> Result<Vec<QueuedEvent>, RelationalError> {
        let relations = self.resolver.relationships_of(conn, ids).await?;
        let mut derived = Vec::new();

        for id in ids {
            let Some(relation) = relations.get(id) else {
                continue;
            };
            let row = sqlx::query(
                "SELECT ent_id, application, version FROM folders WHERE id = ?1 AND deleted = 0",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
            let Some(row) = row else {
                continue;
            };

            let mut event = QueuedEvent {
                resource_id: row.try_get("ent_id")?,
                application: row.try_get("application")?,
                resource_type: FOLDER_TYPE.to_string(),
                action: IngestAction::Upsert,
                priority: explorer_types::Priority::Medium,
                payload: Map::new(),
                queue_token: QueueToken::Derived,
                attempt_count: 0,
                version: row.try_get("version")?,
                predictable_id: Some(*id),
                created_at: Utc::now(),
                error: None,
                error_detail: None,
                overrides: Map::new(),
                rejected: None,
            };
            event.set_override("childrenIds", json!(relation.children));
            derived.push(event);
        }
        Ok(derived)
    }

    /// Permanently delete rows whose delete has reached the index.
    ///
    /// Only soft-deleted rows are removed, so a resource re-created after
    /// the delete survives.
    pub async fn purge(&self, deleted: &[QueuedEvent]) -> Result<u64, RelationalError> {
        let targets: Vec<(i64, bool)> = deleted
            .iter()
            .filter(|e| e.action == IngestAction::Delete)
            .filter_map(|e| e.predictable_id.map(|id| (id, e.is_folder())))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut purged = 0;
        for (id, is_folder) in targets {
            let (table, link_column) = if is_folder {
                ("folders", "folder_id")
            } else {
                ("resources", "resource_id")
            };
            let result = sqlx::query(&format!(
                "DELETE FROM {} WHERE id = ?1 AND deleted = 1",
                table
            ))
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                sqlx::query(&format!(
                    "DELETE FROM folder_resources WHERE {} = ?1",
                    link_column
                ))
                .bind(id)
                .execute(&mut *tx)
                .await?;
                purged += 1;
            }
        }
        tx.commit().await?;

        debug!(purged, "Purged deleted rows");
        Ok(purged)
    }

    /// Folder id and ancestor chain for an external folder id, if live.
    pub async fn folder_path(&self, ent_id: &str) -> Result<Option<(i64, Vec<i64>)>, RelationalError> {
        let mut conn = self.pool.acquire().await?;
        let Some((id, _)) = Self::folder_id_by_ent(&mut conn, ent_id).await? else {
            return Ok(None);
        };
        let ancestors = self.resolver.ancestors_of(&mut conn, &[id]).await?;
        Ok(Some((id, ancestors.get(&id).cloned().unwrap_or_default())))
    }
}

fn all_failed(events: Vec<QueuedEvent>, error: &RelationalError) -> Materialized {
    let failed = events
        .into_iter()
        .map(|mut event| {
            event.fail(error.to_string(), Some("relational store unavailable".to_string()));
            event
        })
        .collect();
    Materialized {
        failed,
        ..Materialized::default()
    }
}

fn materialization_detail(error: &RelationalError) -> String {
    match error {
        RelationalError::Database(_) => "database".to_string(),
        RelationalError::InvalidParent(_) | RelationalError::Cycle { .. } => "hierarchy".to_string(),
        RelationalError::NotMaterialized(_) => "ordering".to_string(),
        RelationalError::InvalidPayload(_) | RelationalError::Serialization(_) => "payload".to_string(),
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn payload_rights(payload: &Map<String, Value>) -> Result<Vec<String>, RelationalError> {
    match payload.get("rights") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RelationalError::InvalidPayload("rights must be strings".into()))
            })
            .collect(),
        Some(_) => Err(RelationalError::InvalidPayload("rights must be an array".into())),
    }
}

/// `creator:<id>` plus one `user:<id>` / `group:<id>` tag per shared right.
///
/// Rights are `kind:id[:permission]`.
fn visible_by(creator: &str, rights: &[String]) -> Vec<String> {
    let mut tags = BTreeSet::new();
    if !creator.is_empty() {
        tags.insert(format!("creator:{}", creator));
    }
    for right in rights {
        let mut parts = right.splitn(3, ':');
        if let (Some(kind), Some(id)) = (parts.next(), parts.next()) {
            if matches!(kind, "user" | "group" | "creator") && !id.is_empty() {
                tags.insert(format!("{}:{}", kind, id));
            }
        }
    }
    tags.into_iter().collect()
}
