//! `LocalStore` backed by a single `SqlitePool`, with one user-document table
//! and one undo table per namespace — `sync_user_<db>.<coll>` /
//! `sync_undo_<db>.<coll>` — mirroring the teacher's `ClientDatabase` reusing
//! one pool across multiple named tables instead of standing up a second
//! bespoke store per collection.

use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use stitch_sync_core::traits::{BatchOps, LocalStore};
use stitch_sync_core::{MongoNamespace, SyncError, SyncResult};
use tokio::sync::RwLock;

fn sync_err(e: sqlx::Error) -> SyncError {
    SyncError::from(ClientError::from(e))
}

fn decode_err(e: serde_json::Error) -> SyncError {
    SyncError::from(ClientError::from(e))
}

fn doc_key(id: &Value) -> SyncResult<String> {
    serde_json::to_string(id).map_err(decode_err)
}

/// Quotes a table name as a SQLite identifier so the `sync_user_<db>.<coll>`
/// / `sync_undo_<db>.<coll>` names (which contain a literal `.`) are safe to
/// interpolate into DDL/DML.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct SqliteLocalStore {
    pool: SqlitePool,
    ensured_tables: RwLock<HashSet<String>>,
}

impl SqliteLocalStore {
    pub async fn connect(database_url: &str) -> Result<Self, ClientError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(database_url).await?;
        Ok(SqliteLocalStore { pool, ensured_tables: RwLock::new(HashSet::new()) })
    }

    /// Creates the namespace's user and undo tables on first use. Cached so
    /// steady-state reads/writes don't re-issue `CREATE TABLE IF NOT EXISTS`.
    async fn ensure_tables(&self, ns: &MongoNamespace) -> SyncResult<()> {
        let user_table = ns.user_collection();
        if self.ensured_tables.read().await.contains(&user_table) {
            return Ok(());
        }

        let undo_table = ns.undo_collection();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {user} (doc_id TEXT PRIMARY KEY, body TEXT NOT NULL); \
             CREATE TABLE IF NOT EXISTS {undo} (doc_id TEXT PRIMARY KEY, body TEXT NOT NULL);",
            user = quote_ident(&user_table),
            undo = quote_ident(&undo_table),
        );
        sqlx::query(&ddl).execute(&self.pool).await.map_err(sync_err)?;

        self.ensured_tables.write().await.insert(user_table);
        Ok(())
    }

    async fn read_rows(&self, table: &str, ids: &[Value]) -> SyncResult<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(doc_key).collect::<SyncResult<_>>()?;
        let placeholders: String = (0..keys.len()).map(|i| format!("?{}", i + 1)).collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT body FROM {table} WHERE doc_id IN ({placeholders})");

        let mut query = sqlx::query(&sql);
        for key in &keys {
            query = query.bind(key);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(sync_err)?;
        rows.iter()
            .map(|row| {
                let body: String = row.try_get("body").map_err(sync_err)?;
                serde_json::from_str(&body).map_err(decode_err)
            })
            .collect()
    }

    async fn write_row(&self, table: &str, id: &Value, doc: Value) -> SyncResult<()> {
        let key = doc_key(id)?;
        let body = serde_json::to_string(&doc).map_err(decode_err)?;
        let sql = format!(
            "INSERT INTO {table} (doc_id, body) VALUES (?1, ?2) \
             ON CONFLICT(doc_id) DO UPDATE SET body = excluded.body"
        );
        sqlx::query(&sql).bind(key).bind(body).execute(&self.pool).await.map_err(sync_err)?;
        Ok(())
    }

    async fn delete_row(&self, table: &str, id: &Value) -> SyncResult<()> {
        let key = doc_key(id)?;
        let sql = format!("DELETE FROM {table} WHERE doc_id = ?1");
        sqlx::query(&sql).bind(key).execute(&self.pool).await.map_err(sync_err)?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn find(&self, ns: &MongoNamespace, ids: &[Value]) -> SyncResult<Vec<Value>> {
        self.ensure_tables(ns).await?;
        self.read_rows(&quote_ident(&ns.user_collection()), ids).await
    }

    async fn find_one(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<Option<Value>> {
        self.ensure_tables(ns).await?;
        Ok(self.read_rows(&quote_ident(&ns.user_collection()), std::slice::from_ref(id)).await?.into_iter().next())
    }

    async fn all_ids(&self, ns: &MongoNamespace) -> SyncResult<Vec<Value>> {
        self.ensure_tables(ns).await?;
        let sql = format!("SELECT doc_id FROM {}", quote_ident(&ns.user_collection()));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(sync_err)?;
        rows.iter()
            .map(|row| {
                let key: String = row.try_get("doc_id").map_err(sync_err)?;
                serde_json::from_str(&key).map_err(decode_err)
            })
            .collect()
    }

    async fn upsert(&self, ns: &MongoNamespace, id: &Value, doc: Value) -> SyncResult<()> {
        self.ensure_tables(ns).await?;
        self.write_row(&quote_ident(&ns.user_collection()), id, doc).await
    }

    async fn delete(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()> {
        self.ensure_tables(ns).await?;
        self.delete_row(&quote_ident(&ns.user_collection()), id).await
    }

    async fn bulk_write(&self, ns: &MongoNamespace, ops: BatchOps) -> SyncResult<()> {
        self.ensure_tables(ns).await?;
        let table = quote_ident(&ns.user_collection());
        let mut tx = self.pool.begin().await.map_err(sync_err)?;

        for (id, doc) in ops.upserts {
            let key = doc_key(&id)?;
            let body = serde_json::to_string(&doc).map_err(decode_err)?;
            let sql = format!(
                "INSERT INTO {table} (doc_id, body) VALUES (?1, ?2) \
                 ON CONFLICT(doc_id) DO UPDATE SET body = excluded.body"
            );
            sqlx::query(&sql).bind(key).bind(body).execute(&mut *tx).await.map_err(sync_err)?;
        }

        for id in ops.deletes {
            let key = doc_key(&id)?;
            let sql = format!("DELETE FROM {table} WHERE doc_id = ?1");
            sqlx::query(&sql).bind(key).execute(&mut *tx).await.map_err(sync_err)?;
        }

        tx.commit().await.map_err(sync_err)?;
        Ok(())
    }

    async fn insert_undo(&self, ns: &MongoNamespace, id: &Value, pre_image: Value) -> SyncResult<()> {
        self.ensure_tables(ns).await?;
        self.write_row(&quote_ident(&ns.undo_collection()), id, pre_image).await
    }

    async fn delete_undo(&self, ns: &MongoNamespace, id: &Value) -> SyncResult<()> {
        self.ensure_tables(ns).await?;
        self.delete_row(&quote_ident(&ns.undo_collection()), id).await
    }

    async fn all_undo(&self, ns: &MongoNamespace) -> SyncResult<Vec<(Value, Value)>> {
        self.ensure_tables(ns).await?;
        let sql = format!("SELECT doc_id, body FROM {}", quote_ident(&ns.undo_collection()));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(sync_err)?;
        rows.iter()
            .map(|row| {
                let key: String = row.try_get("doc_id").map_err(sync_err)?;
                let body: String = row.try_get("body").map_err(sync_err)?;
                let id = serde_json::from_str(&key).map_err(decode_err)?;
                let doc = serde_json::from_str(&body).map_err(decode_err)?;
                Ok((id, doc))
            })
            .collect()
    }
}
