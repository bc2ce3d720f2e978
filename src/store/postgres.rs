//! Postgres + pgvector backend.
//!
//! Items live in one table (`embedding VECTOR(d)`, `path INTEGER[]`, NULL
//! meaning unset) and nodes in another (`centroid VECTOR(d)`,
//! `location INTEGER[]`). Each acquired [`PgStore`] owns its own connection.

use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use tokio_postgres::{Client, NoTls, Row};

use super::{distinct_ids, Backend, PathStore, StoreError, StoreResult, TreeStore};
use crate::item::{EmbeddedItemRecord, Item, ItemId, TreeNode};
use crate::path::TreePath;
use crate::vector_store::TableName;

/// Table layout shared by every handle of a backend.
#[derive(Debug, Clone)]
pub struct PgTables {
    /// Items table holding embeddings and paths.
    pub items: TableName,
    /// Tree table holding centroid rows.
    pub tree: TableName,
    /// Embedding width of both vector columns.
    pub dims: usize,
}

/// Statement text rendered once per backend.
struct PgSql {
    fetch_all: String,
    fetch_root: String,
    fetch_by_path: String,
    append_branch: String,
    reset_paths: String,
    insert_node: String,
    clear_nodes: String,
}

impl PgSql {
    fn new(tables: &PgTables) -> Self {
        let items = tables.items.qualified();
        let tree = tables.tree.qualified();
        Self {
            fetch_all: format!("SELECT id, embedding, path FROM {items} ORDER BY id"),
            fetch_root: format!(
                "SELECT id, embedding, path FROM {items} \
                 WHERE path IS NULL OR cardinality(path) = 0 ORDER BY id"
            ),
            fetch_by_path: format!(
                "SELECT id, embedding, path FROM {items} WHERE path = $1::INTEGER[] ORDER BY id"
            ),
            // Counts ids at the parent or already on the branch and only
            // updates when every id is accounted for, all in one statement.
            append_branch: format!(
                "WITH tally AS ( \
                     SELECT \
                         count(*) FILTER (WHERE COALESCE(path, '{{}}'::INTEGER[]) = $2::INTEGER[]) AS at_parent, \
                         count(*) FILTER (WHERE path = $3::INTEGER[]) AS at_branch \
                     FROM {items} WHERE id = ANY($1::BIGINT[]) \
                 ), updated AS ( \
                     UPDATE {items} AS t \
                     SET path = array_append(COALESCE(t.path, '{{}}'::INTEGER[]), $4::INTEGER) \
                     FROM tally \
                     WHERE t.id = ANY($1::BIGINT[]) \
                       AND COALESCE(t.path, '{{}}'::INTEGER[]) = $2::INTEGER[] \
                       AND tally.at_parent + tally.at_branch = $5::BIGINT \
                     RETURNING t.id \
                 ) \
                 SELECT tally.at_parent + tally.at_branch AS matched, \
                        (SELECT count(*) FROM updated) AS applied \
                 FROM tally"
            ),
            reset_paths: format!("UPDATE {items} SET path = NULL WHERE path IS NOT NULL"),
            insert_node: format!("INSERT INTO {tree} (centroid, location) VALUES ($1, $2)"),
            clear_nodes: format!("DELETE FROM {tree}"),
        }
    }
}

/// Connection factory for [`PgStore`] handles.
#[derive(Clone)]
pub struct PgBackend {
    database_url: String,
    tables: PgTables,
    sql: Arc<PgSql>,
}

impl PgBackend {
    /// Builds a backend for the given connection string and tables.
    pub fn new(database_url: impl Into<String>, tables: PgTables) -> Self {
        let sql = Arc::new(PgSql::new(&tables));
        Self {
            database_url: database_url.into(),
            tables,
            sql,
        }
    }

    /// Table layout used by this backend.
    pub fn tables(&self) -> &PgTables {
        &self.tables
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Handle = PgStore;

    async fn acquire(&self) -> StoreResult<PgStore> {
        let (client, connection) = tokio_postgres::connect(&self.database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(error = %err, "postgres connection error");
            }
        });
        Ok(PgStore {
            client,
            tables: self.tables.clone(),
            sql: Arc::clone(&self.sql),
        })
    }
}

/// One connection's worth of path and tree store access.
pub struct PgStore {
    client: Client,
    tables: PgTables,
    sql: Arc<PgSql>,
}

impl PgStore {
    /// Creates the vector extension, both tables and their path indexes.
    pub async fn prepare(&self) -> StoreResult<()> {
        let dims = self.tables.dims;
        let items = &self.tables.items;
        let tree = &self.tables.tree;
        let ddl = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    key TEXT NOT NULL UNIQUE,
                    text TEXT NOT NULL DEFAULT '',
                    embedding VECTOR({dims}) NOT NULL,
                    path INTEGER[]
                )",
                items.qualified()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (path)",
                items.index_name("path"),
                items.qualified()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    centroid VECTOR({dims}) NOT NULL,
                    location INTEGER[] NOT NULL
                )",
                tree.qualified()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (location)",
                tree.index_name("location"),
                tree.qualified()
            ),
        ];
        for statement in ddl {
            self.client.execute(statement.as_str(), &[]).await?;
        }
        Ok(())
    }

    /// Inserts loader records in one transaction; returns the row count.
    ///
    /// With `upsert`, an existing `key` gets the new text and embedding and
    /// its path is cleared, since the old address no longer describes it.
    pub async fn insert_records(
        &mut self,
        records: &[EmbeddedItemRecord],
        upsert: bool,
    ) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = records
            .iter()
            .find(|record| record.embedding.len() != self.tables.dims)
        {
            return Err(StoreError::DimensionMismatch {
                expected: self.tables.dims,
                got: bad.embedding.len(),
            });
        }

        let sql = insert_records_sql(&self.tables.items, upsert);
        let transaction = self.client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        let mut written = 0u64;
        for record in records {
            let vector = Vector::from(record.embedding.clone());
            written += transaction
                .execute(&statement, &[&record.key, &record.text, &vector])
                .await?;
        }
        transaction.commit().await?;
        Ok(written)
    }

    fn decode_items(&self, rows: Vec<Row>) -> StoreResult<Vec<Item>> {
        rows.iter().map(|row| self.decode_item(row)).collect()
    }

    fn decode_item(&self, row: &Row) -> StoreResult<Item> {
        let id: i64 = row.try_get(0)?;
        let embedding = row.try_get::<_, Vector>(1)?.to_vec();
        if embedding.len() != self.tables.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.tables.dims,
                got: embedding.len(),
            });
        }
        let path = row
            .try_get::<_, Option<Vec<i32>>>(2)?
            .map(|values| TreePath::from_sql_array(&values))
            .transpose()?;
        Ok(Item {
            id,
            embedding,
            path,
        })
    }
}

#[async_trait]
impl PathStore for PgStore {
    async fn fetch_all(&self) -> StoreResult<Vec<Item>> {
        let rows = self.client.query(self.sql.fetch_all.as_str(), &[]).await?;
        self.decode_items(rows)
    }

    async fn fetch_by_path(&self, path: &TreePath) -> StoreResult<Vec<Item>> {
        let rows = if path.is_root() {
            self.client.query(self.sql.fetch_root.as_str(), &[]).await?
        } else {
            let branches = path.to_sql_array();
            self.client
                .query(self.sql.fetch_by_path.as_str(), &[&branches])
                .await?
        };
        self.decode_items(rows)
    }

    async fn append_branch(
        &self,
        ids: &[ItemId],
        parent: &TreePath,
        branch: u16,
    ) -> StoreResult<()> {
        let ids = distinct_ids(ids);
        let parent_sql = parent.to_sql_array();
        let target_sql = parent.child(branch).to_sql_array();
        let branch_sql = i32::from(branch);
        let expected = ids.len() as i64;
        let row = self
            .client
            .query_one(
                self.sql.append_branch.as_str(),
                &[&ids, &parent_sql, &target_sql, &branch_sql, &expected],
            )
            .await?;
        let matched: i64 = row.try_get(0)?;
        if matched != expected {
            return Err(StoreError::BranchConflict {
                parent: parent.clone(),
                branch,
                expected: ids.len(),
                matched: usize::try_from(matched).unwrap_or(0),
            });
        }
        Ok(())
    }

    async fn reset_paths(&self) -> StoreResult<u64> {
        Ok(self
            .client
            .execute(self.sql.reset_paths.as_str(), &[])
            .await?)
    }
}

#[async_trait]
impl TreeStore for PgStore {
    async fn insert_node(&self, node: &TreeNode) -> StoreResult<()> {
        if node.centroid.len() != self.tables.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.tables.dims,
                got: node.centroid.len(),
            });
        }
        let centroid = Vector::from(node.centroid.clone());
        let location = node.location.to_sql_array();
        self.client
            .execute(self.sql.insert_node.as_str(), &[&centroid, &location])
            .await?;
        Ok(())
    }

    async fn clear_nodes(&self) -> StoreResult<u64> {
        Ok(self
            .client
            .execute(self.sql.clear_nodes.as_str(), &[])
            .await?)
    }
}

fn insert_records_sql(items: &TableName, upsert: bool) -> String {
    let mut sql = format!(
        "INSERT INTO {} (key, text, embedding) VALUES ($1, $2, $3)",
        items.qualified()
    );
    if upsert {
        sql.push_str(
            " ON CONFLICT (key) DO UPDATE SET \
                text = EXCLUDED.text, \
                embedding = EXCLUDED.embedding, \
                path = NULL",
        );
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> PgTables {
        PgTables {
            items: TableName::new("public", "cluster_tree_test_items").unwrap(),
            tree: TableName::new("public", "cluster_tree_test_tree").unwrap(),
            dims: 3,
        }
    }

    #[test]
    fn upsert_clears_path() {
        let sql = insert_records_sql(&tables().items, true);
        assert!(sql.contains("ON CONFLICT (key) DO UPDATE"));
        assert!(sql.contains("path = NULL"));
        assert!(!insert_records_sql(&tables().items, false).contains("ON CONFLICT"));
    }

    #[test]
    fn statements_target_quoted_tables() {
        let sql = PgSql::new(&tables());
        assert!(sql
            .fetch_by_path
            .contains("\"public\".\"cluster_tree_test_items\""));
        assert!(sql.append_branch.contains("'{}'::INTEGER[]"));
        assert!(sql.insert_node.contains("\"cluster_tree_test_tree\""));
    }

    /// Runs against a live database when `CLUSTER_TREE_TEST_DATABASE_URL` is set.
    #[tokio::test(flavor = "current_thread")]
    async fn live_round_trip() {
        let Ok(url) = std::env::var("CLUSTER_TREE_TEST_DATABASE_URL") else {
            return;
        };
        let backend = PgBackend::new(url, tables());
        let mut store = backend.acquire().await.expect("connect");
        store.prepare().await.expect("prepare");
        store.clear_nodes().await.expect("clear nodes");
        store
            .client
            .execute(
                format!("DELETE FROM {}", backend.tables().items.qualified()).as_str(),
                &[],
            )
            .await
            .expect("clear items");

        let records: Vec<EmbeddedItemRecord> = (0..4)
            .map(|i| EmbeddedItemRecord {
                key: format!("item-{i}"),
                text: String::new(),
                embedding: vec![i as f32, 0.0, 1.0],
            })
            .collect();
        assert_eq!(store.insert_records(&records, true).await.expect("load"), 4);

        let items = store.fetch_all().await.expect("fetch all");
        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
        let root = TreePath::root();
        store.append_branch(&ids[..2], &root, 0).await.expect("branch 0");
        store.append_branch(&ids[..2], &root, 0).await.expect("retry");
        let repeated = [ids[0], ids[0], ids[1]];
        store
            .append_branch(&repeated, &root, 0)
            .await
            .expect("repeated ids count once");
        assert!(store.append_branch(&ids[..2], &root, 1).await.is_err());

        let at_zero = store.fetch_by_path(&root.child(0)).await.expect("fetch");
        assert_eq!(at_zero.len(), 2);
        assert_eq!(store.fetch_by_path(&root).await.expect("root").len(), 2);
        assert_eq!(store.reset_paths().await.expect("reset"), 2);
    }
}
