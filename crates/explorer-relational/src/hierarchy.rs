//! Folder hierarchy resolution.
//!
//! Each lookup is one recursive CTE over the whole input set. Recursion
//! uses `UNION` so repeated rows collapse, and a depth bound stops runaway
//! recursion should the stored tree ever contain a cycle.
//!
//! Ids that do not exist are absent from every result map. The root is
//! always known: it has no ancestors and no parent.

use std::collections::HashMap;

use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tracing::debug;

use explorer_types::ROOT_FOLDER_ID;

use crate::error::RelationalError;

/// Deepest folder chain the resolver will follow.
pub const DEFAULT_MAX_DEPTH: i64 = 64;

/// Direct neighbours of a folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderRelations {
    /// `None` only for the root
    pub parent: Option<i64>,
    /// Live (not deleted) children, ascending by id
    pub children: Vec<i64>,
}

/// Computes ancestor chains and descendant sets of folders.
#[derive(Debug, Clone, Copy)]
pub struct HierarchyResolver {
    max_depth: i64,
}

impl Default for HierarchyResolver {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

fn push_ids(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
}

impl HierarchyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: i64) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Ids among `ids` that have a folder row.
    async fn existing(
        conn: &mut SqliteConnection,
        ids: &[i64],
    ) -> Result<Vec<i64>, RelationalError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id FROM folders WHERE id IN (");
        push_ids(&mut qb, ids);
        qb.push(")");
        let rows = qb.build().fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(RelationalError::from))
            .collect()
    }

    /// Ancestor chain of each folder, from its parent up to the root.
    ///
    /// For `A -> B -> C -> root` the entry for `A` is `[B, C, root]`.
    pub async fn ancestors_of(
        &self,
        conn: &mut SqliteConnection,
        ids: &[i64],
    ) -> Result<HashMap<i64, Vec<i64>>, RelationalError> {
        let mut result: HashMap<i64, Vec<i64>> = HashMap::new();
        if ids.contains(&ROOT_FOLDER_ID) {
            result.insert(ROOT_FOLDER_ID, Vec::new());
        }
        let ids: Vec<i64> = ids.iter().copied().filter(|id| *id != ROOT_FOLDER_ID).collect();
        if ids.is_empty() {
            return Ok(result);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "WITH RECURSIVE chain(origin, id, depth) AS ( \
             SELECT f.id, f.parent_id, 1 FROM folders f WHERE f.id IN (",
        );
        push_ids(&mut qb, &ids);
        qb.push(
            ") UNION \
             SELECT c.origin, f.parent_id, c.depth + 1 FROM chain c \
             JOIN folders f ON f.id = c.id \
             WHERE f.parent_id <> c.origin AND c.depth < ",
        );
        qb.push_bind(self.max_depth);
        qb.push(") SELECT origin, id FROM chain WHERE id <> origin ORDER BY origin, depth");

        let rows = qb.build().fetch_all(&mut *conn).await?;
        for row in rows {
            let origin: i64 = row.try_get("origin")?;
            let ancestor: i64 = row.try_get("id")?;
            let chain = result.entry(origin).or_default();
            if !chain.contains(&ancestor) {
                chain.push(ancestor);
            }
        }

        debug!(requested = ids.len(), resolved = result.len(), "Resolved ancestors");
        Ok(result)
    }

    /// Every live folder below each input folder, nearest first.
    ///
    /// Asking for the root returns the whole live forest.
    pub async fn descendants_of(
        &self,
        conn: &mut SqliteConnection,
        ids: &[i64],
    ) -> Result<HashMap<i64, Vec<i64>>, RelationalError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut result: HashMap<i64, Vec<i64>> = Self::existing(conn, ids)
            .await?
            .into_iter()
            .map(|id| (id, Vec::new()))
            .collect();
        if ids.contains(&ROOT_FOLDER_ID) {
            result.insert(ROOT_FOLDER_ID, Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "WITH RECURSIVE tree(origin, id, depth) AS ( \
             SELECT f.parent_id, f.id, 1 FROM folders f WHERE f.deleted = 0 AND f.parent_id IN (",
        );
        push_ids(&mut qb, ids);
        qb.push(
            ") UNION \
             SELECT t.origin, f.id, t.depth + 1 FROM tree t \
             JOIN folders f ON f.parent_id = t.id \
             WHERE f.deleted = 0 AND f.id <> t.origin AND t.depth < ",
        );
        qb.push_bind(self.max_depth);
        qb.push(
            ") SELECT origin, id, MIN(depth) AS depth FROM tree \
             GROUP BY origin, id ORDER BY origin, depth, id",
        );

        let rows = qb.build().fetch_all(&mut *conn).await?;
        for row in rows {
            let origin: i64 = row.try_get("origin")?;
            let descendant: i64 = row.try_get("id")?;
            if let Some(list) = result.get_mut(&origin) {
                list.push(descendant);
            }
        }

        debug!(requested = ids.len(), resolved = result.len(), "Resolved descendants");
        Ok(result)
    }

    /// Direct parent and live children of each folder.
    pub async fn relationships_of(
        &self,
        conn: &mut SqliteConnection,
        ids: &[i64],
    ) -> Result<HashMap<i64, FolderRelations>, RelationalError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut result: HashMap<i64, FolderRelations> = HashMap::new();
        if ids.contains(&ROOT_FOLDER_ID) {
            result.insert(ROOT_FOLDER_ID, FolderRelations::default());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, parent_id FROM folders WHERE id IN (");
        push_ids(&mut qb, ids);
        qb.push(")");
        for row in qb.build().fetch_all(&mut *conn).await? {
            let id: i64 = row.try_get("id")?;
            let parent: i64 = row.try_get("parent_id")?;
            result.insert(
                id,
                FolderRelations {
                    parent: Some(parent),
                    children: Vec::new(),
                },
            );
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT parent_id, id FROM folders WHERE deleted = 0 AND parent_id IN (",
        );
        push_ids(&mut qb, ids);
        qb.push(") ORDER BY parent_id, id");
        for row in qb.build().fetch_all(&mut *conn).await? {
            let parent: i64 = row.try_get("parent_id")?;
            let child: i64 = row.try_get("id")?;
            if let Some(relations) = result.get_mut(&parent) {
                relations.children.push(child);
            }
        }

        Ok(result)
    }
}
