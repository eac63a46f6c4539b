//! SQLite-backed document store.
//!
//! One `documents` table holds every collection; `json_patch` implements
//! field merges server-side so merge semantics match the in-memory
//! backend. Conditional commits run inside a `BEGIN IMMEDIATE` transaction
//! and re-read each precondition's version before applying anything, so a
//! document that changed between a transactional read and the commit
//! aborts the whole batch.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};

use super::{DocRef, DocumentStore, Precondition, SetOptions, StoreResult, VersionedDocument, WriteOp};
use crate::error::StoreError;

/// [`DocumentStore`] backend over a SQLite database via sqlx.
///
/// The pool is capped at one connection: every write path already
/// serializes on the database file, and a single connection keeps
/// in-memory databases coherent.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a store at the given path.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Open an in-memory store.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(map_sqlx_err)?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn read_version(
        conn: &mut SqliteConnection,
        doc: &DocRef,
    ) -> StoreResult<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM documents WHERE collection = ?1 AND id = ?2")
                .bind(&doc.collection)
                .bind(&doc.id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
        row.map(|(v,)| decode_version(v)).transpose()
    }

    async fn exec_write(
        conn: &mut SqliteConnection,
        write: &WriteOp,
        now: &str,
    ) -> StoreResult<()> {
        match write {
            WriteOp::Set {
                doc,
                value,
                options,
            } => {
                let data = encode_value(value)?;
                let sql = if options.merge {
                    "INSERT INTO documents (collection, id, data, version, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4)
                     ON CONFLICT (collection, id) DO UPDATE SET
                         data = json_patch(documents.data, excluded.data),
                         version = documents.version + 1,
                         updated_at = excluded.updated_at"
                } else {
                    "INSERT INTO documents (collection, id, data, version, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4)
                     ON CONFLICT (collection, id) DO UPDATE SET
                         data = excluded.data,
                         version = documents.version + 1,
                         updated_at = excluded.updated_at"
                };
                sqlx::query(sql)
                    .bind(&doc.collection)
                    .bind(&doc.id)
                    .bind(data)
                    .bind(now)
                    .execute(&mut *conn)
                    .await
                    .map_err(map_sqlx_err)?;
                Ok(())
            }
            WriteOp::Update { doc, fields } => {
                let data = encode_value(fields)?;
                let result = sqlx::query(
                    "UPDATE documents
                     SET data = json_patch(data, ?3), version = version + 1, updated_at = ?4
                     WHERE collection = ?1 AND id = ?2",
                )
                .bind(&doc.collection)
                .bind(&doc.id)
                .bind(data)
                .bind(now)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_err)?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound(doc.path()));
                }
                Ok(())
            }
            WriteOp::Delete { doc } => {
                sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
                    .bind(&doc.collection)
                    .bind(&doc.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(map_sqlx_err)?;
                Ok(())
            }
        }
    }

    async fn apply_batch(
        conn: &mut SqliteConnection,
        preconditions: &[Precondition],
        writes: &[WriteOp],
    ) -> StoreResult<()> {
        for precondition in preconditions {
            let current = Self::read_version(conn, &precondition.doc).await?;
            if current != precondition.version {
                return Err(StoreError::Aborted(format!(
                    "document {} changed since read (read version {:?}, now {:?})",
                    precondition.doc, precondition.version, current
                )));
            }
        }

        let now = Utc::now().to_rfc3339();
        for write in writes {
            Self::exec_write(conn, write, &now).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, doc: &DocRef) -> StoreResult<Option<VersionedDocument>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT data, version FROM documents WHERE collection = ?1 AND id = ?2")
                .bind(&doc.collection)
                .bind(&doc.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

        match row {
            Some((data, version)) => {
                let value: Value = serde_json::from_str(&data)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(VersionedDocument {
                    data: value,
                    version: decode_version(version)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, doc: &DocRef, fields: Value) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_err)?;
        let now = Utc::now().to_rfc3339();
        Self::exec_write(
            &mut conn,
            &WriteOp::Update {
                doc: doc.clone(),
                fields,
            },
            &now,
        )
        .await
    }

    async fn set(&self, doc: &DocRef, value: Value, options: SetOptions) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_err)?;
        let now = Utc::now().to_rfc3339();
        Self::exec_write(
            &mut conn,
            &WriteOp::Set {
                doc: doc.clone(),
                value,
                options,
            },
            &now,
        )
        .await
    }

    async fn delete(&self, doc: &DocRef) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_err)?;
        let now = Utc::now().to_rfc3339();
        Self::exec_write(&mut conn, &WriteOp::Delete { doc: doc.clone() }, &now).await
    }

    async fn commit(&self, preconditions: &[Precondition], writes: &[WriteOp]) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_err)?;

        match Self::apply_batch(&mut conn, preconditions, writes).await {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(map_sqlx_err)?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(error = %rollback_err, "rollback failed after aborted commit");
                }
                Err(err)
            }
        }
    }
}

fn encode_value(value: &Value) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_version(version: i64) -> StoreResult<u64> {
    u64::try_from(version)
        .map_err(|_| StoreError::Internal(format!("negative document version {version}")))
}

/// Map a sqlx failure into the store taxonomy.
///
/// SQLITE_BUSY-style lock contention maps to [`StoreError::Unavailable`];
/// anything else becomes [`StoreError::Backend`] and is classified by the
/// message shim.
fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            if message.contains("locked") || message.contains("busy") {
                StoreError::Unavailable(db.message().to_string())
            } else {
                StoreError::Backend(err.to_string())
            }
        }
        _ => StoreError::Backend(err.to_string()),
    }
}
