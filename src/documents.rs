use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, types::Json};
use tracing::debug;
use uuid::Uuid;

use crate::{
    remote::{RemoteDocument, RemoteError, RemoteResult, RemoteStore},
    schema::{self, DEFAULT_REMOTE_TABLE},
};

/// [`RemoteStore`] over a Postgres jsonb table, one row per (collection, local id).
#[derive(Clone, Debug)]
pub struct PgRemoteStore {
    pool: PgPool,
    table: String,
}

impl PgRemoteStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: schema::qualified("public", DEFAULT_REMOTE_TABLE),
        }
    }

    pub async fn connect(url: &str) -> crate::Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Target a table created by a [`schema::SchemaManager`] configured the same way.
    pub fn with_table(mut self, schema: &str, table: &str) -> Self {
        self.table = schema::qualified(schema, table);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// Keys that are not UUIDs were never issued by this store.
fn parse_key(collection: &str, key: &str) -> RemoteResult<Uuid> {
    Uuid::parse_str(key).map_err(|_| RemoteError::not_found(collection, key))
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn create(&self, collection: &str, local_id: &str, data: &Value) -> RemoteResult<String> {
        // Upsert on the local id so a create replayed after a lost response lands on the same row.
        let sql = format!(
            r#"
            insert into {t} as d (remote_key, collection, local_id, doc)
            values ($1, $2, $3, $4)
            on conflict (collection, local_id) do update
              set doc = excluded.doc,
                  version = d.version + 1,
                  updated_at = now()
            returning remote_key
            "#,
            t = self.table
        );
        let key: Uuid = sqlx::query_scalar(&sql)
            .bind(Uuid::new_v4())
            .bind(collection)
            .bind(local_id)
            .bind(Json(data))
            .fetch_one(&self.pool)
            .await?;
        debug!(collection, local_id, remote_key = %key, "remote document created");
        Ok(key.to_string())
    }

    async fn update(&self, collection: &str, remote_key: &str, data: &Value) -> RemoteResult<()> {
        let key = parse_key(collection, remote_key)?;
        let sql = format!(
            "update {} set doc = $3, version = version + 1, updated_at = now() \
             where collection = $1 and remote_key = $2",
            self.table
        );
        let res = sqlx::query(&sql)
            .bind(collection)
            .bind(key)
            .bind(Json(data))
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(RemoteError::not_found(collection, remote_key));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, remote_key: &str) -> RemoteResult<()> {
        let key = parse_key(collection, remote_key)?;
        let sql = format!(
            "delete from {} where collection = $1 and remote_key = $2",
            self.table
        );
        let res = sqlx::query(&sql)
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(RemoteError::not_found(collection, remote_key));
        }
        Ok(())
    }

    async fn find_by_local_id(
        &self,
        collection: &str,
        local_id: &str,
    ) -> RemoteResult<Option<String>> {
        let sql = format!(
            "select remote_key from {} where collection = $1 and local_id = $2",
            self.table
        );
        let key: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(collection)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(key.map(|k| k.to_string()))
    }

    async fn list(&self, collection: &str) -> RemoteResult<Vec<RemoteDocument>> {
        let sql = format!(
            "select remote_key, local_id, doc, updated_at from {} \
             where collection = $1 order by created_at asc, local_id asc",
            self.table
        );
        let rows: Vec<(Uuid, String, Json<Value>, DateTime<Utc>)> = sqlx::query_as(&sql)
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(key, local_id, Json(body), updated_at)| RemoteDocument {
                remote_key: key.to_string(),
                local_id,
                body,
                updated_at: Some(updated_at),
            })
            .collect())
    }

    async fn ping(&self) -> RemoteResult<()> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }
}
