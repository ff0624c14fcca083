use indoc::{formatdoc, indoc};
use sqlx::PgPool;

use crate::Result;

/// Local queue table. One row per pending record; `seq` preserves insertion order.
pub(crate) const LOCAL_QUEUE_DDL: &[&str] = &[
    indoc! {r#"
        create table if not exists pending_mutations (
            seq integer primary key autoincrement,
            collection text not null,
            id text not null,
            action text not null check (action in ('create', 'update', 'delete')),
            payload text,
            enqueued_at text not null,
            revision integer not null default 0,
            retry_count integer not null default 0 check (retry_count >= 0),
            last_retry_at text,
            last_error text,
            remote_ref text,
            unique (collection, id)
        )
    "#},
    "create index if not exists pending_mutations_collection_idx on pending_mutations (collection, seq)",
];

pub const DEFAULT_REMOTE_TABLE: &str = "fieldsync_docs";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    fn new(description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            sql: sql.into(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
}

impl SchemaPlan {
    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Plans and applies the DDL for the Postgres remote document table.
#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
    schema: String,
    table: String,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            table: DEFAULT_REMOTE_TABLE.to_string(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub async fn plan(&self) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();

        let schema_exists: bool = sqlx::query_scalar(
            "select exists (select 1 from information_schema.schemata where schema_name = $1)",
        )
        .bind(&self.schema)
        .fetch_one(&self.pool)
        .await?;
        if !schema_exists {
            plan.actions.push(SchemaAction::new(
                format!("create schema {}", self.schema),
                format!("create schema if not exists {}", quote_ident(&self.schema)),
            ));
        }

        let table_exists: bool = sqlx::query_scalar(
            "select exists (select 1 from information_schema.tables where table_schema = $1 and table_name = $2)",
        )
        .bind(&self.schema)
        .bind(&self.table)
        .fetch_one(&self.pool)
        .await?;
        if !table_exists {
            plan.actions.push(SchemaAction::new(
                format!("create table {}.{}", self.schema, self.table),
                remote_table_ddl(&qualified(&self.schema, &self.table)),
            ));
        }

        let index = format!("{}_collection_updated_idx", self.table);
        let index_exists: bool = sqlx::query_scalar(
            "select exists (select 1 from pg_indexes where schemaname = $1 and indexname = $2)",
        )
        .bind(&self.schema)
        .bind(&index)
        .fetch_one(&self.pool)
        .await?;
        if !index_exists {
            plan.actions.push(SchemaAction::new(
                format!("create index {index}"),
                format!(
                    "create index if not exists {} on {} (collection, updated_at desc)",
                    quote_ident(&index),
                    qualified(&self.schema, &self.table)
                ),
            ));
        }

        Ok(plan)
    }

    /// Apply whatever [`SchemaManager::plan`] reports as missing and return it.
    pub async fn sync(&self) -> Result<SchemaPlan> {
        let plan = self.plan().await?;
        for action in plan.actions() {
            sqlx::query(action.sql()).execute(&self.pool).await?;
        }
        Ok(plan)
    }
}

fn remote_table_ddl(table: &str) -> String {
    formatdoc! {r#"
            create table if not exists {table} (
                remote_key uuid primary key,
                collection text not null,
                local_id text not null,
                doc jsonb not null,
                version int not null default 1,
                created_at timestamptz not null default now(),
                updated_at timestamptz not null default now(),
                unique (collection, local_id)
            )
        "#}
}

pub(crate) fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

pub(crate) fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("docs"), "\"docs\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("public", "fieldsync_docs"), "\"public\".\"fieldsync_docs\"");
    }

    #[test]
    fn remote_table_is_unique_per_local_id() {
        let ddl = remote_table_ddl("\"public\".\"docs\"");
        assert!(ddl.contains("unique (collection, local_id)"));
    }
}
