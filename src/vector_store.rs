//! Shared pgvector table helpers reused by the store and binaries.

use std::fmt;

use anyhow::Result;
use clap::Args;

use crate::item::EMBEDDING_DIM;
use crate::store::PgTables;

/// Connection and table arguments shared by binaries that touch Postgres.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding both tables
    #[arg(long, env = "CLUSTER_TREE_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Table storing embedded items and their paths
    #[arg(long, env = "CLUSTER_TREE_ITEMS_TABLE", default_value = "items")]
    pub items_table: String,

    /// Table storing tree node centroids
    #[arg(long, env = "CLUSTER_TREE_TREE_TABLE", default_value = "tree")]
    pub tree_table: String,

    /// Embedding width of the vector columns
    #[arg(long, env = "CLUSTER_TREE_DIMENSIONS", default_value_t = EMBEDDING_DIM)]
    pub dimensions: usize,
}

impl StoreArgs {
    /// Resolves the table layout described by the arguments.
    ///
    /// A table argument written as `schema.table` overrides `--schema`.
    pub fn tables(&self) -> Result<PgTables> {
        anyhow::ensure!(self.dimensions > 0, "embedding dimension must be positive");
        Ok(PgTables {
            items: TableName::resolve(&self.schema, &self.items_table)?,
            tree: TableName::resolve(&self.schema, &self.tree_table)?,
            dims: self.dimensions,
        })
    }
}

/// Longest identifier Postgres keeps without truncating.
const MAX_IDENT_BYTES: usize = 63;

/// Schema-qualified Postgres table with its quoted form rendered once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
    qualified: String,
}

impl TableName {
    /// Builds a table identifier, rejecting names Postgres would mangle.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let schema = checked_ident("schema", schema.into())?;
        let table = checked_ident("table", table.into())?;
        let qualified = format!("{}.{}", quoted(&schema), quoted(&table));
        Ok(Self {
            schema,
            table,
            qualified,
        })
    }

    /// Reads `table` or `schema.table`, falling back to `default_schema`.
    pub fn resolve(default_schema: &str, spec: &str) -> Result<Self> {
        match spec.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(default_schema, spec),
        }
    }

    /// Quoted `"schema"."table"` reference for statement text.
    pub fn qualified(&self) -> &str {
        &self.qualified
    }

    /// Unquoted schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Unquoted table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Quoted `schema_table_column_idx` index name.
    pub fn index_name(&self, column: &str) -> String {
        let raw: String = [self.schema.as_str(), self.table.as_str(), column, "idx"]
            .iter()
            .flat_map(|part| part.chars().chain(std::iter::once('_')))
            .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
            .collect();
        quoted(raw.trim_end_matches('_'))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified)
    }
}

fn checked_ident(kind: &str, name: String) -> Result<String> {
    anyhow::ensure!(!name.trim().is_empty(), "{kind} name is required");
    anyhow::ensure!(!name.contains('\0'), "{kind} name {name:?} contains a NUL byte");
    anyhow::ensure!(
        name.len() <= MAX_IDENT_BYTES,
        "{kind} name {name:?} exceeds {MAX_IDENT_BYTES} bytes"
    );
    Ok(name)
}

fn quoted(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for ch in ident.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}
