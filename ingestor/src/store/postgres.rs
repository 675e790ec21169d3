use super::{KeyRange, LockMode, Transaction, TransactionalStore};
use crate::errors::{Error, Result};
use crate::router::fnv1a64;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Postgres;
use std::time::Duration;
use tracing::info;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Store binding over a single `kv_entries` table.
///
/// Per-key locks are transaction-scoped advisory locks keyed by the FNV hash
/// of `collection/key`, which also covers keys that do not exist yet. The
/// session `lock_timeout` bounds every lock wait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    async fn get_or_create_collection(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO kv_collections (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // SET does not take bind parameters
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn lock_key(&mut self, collection: &str, key: &str) -> Result<()> {
        let lock_id = fnv1a64(format!("{}/{}", collection, key).as_bytes()) as i64;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_id)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn fetch(&mut self, collection: &str, key: &str) -> Result<Option<Value>> {
        let row: Option<Json<Value>> =
            sqlx::query_scalar("SELECT value FROM kv_entries WHERE collection = $1 AND key = $2")
                .bind(collection)
                .bind(key)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(classify)?;
        Ok(row.map(|Json(value)| value))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get(&mut self, collection: &str, key: &str, mode: LockMode) -> Result<Option<Value>> {
        if mode == LockMode::Update {
            self.lock_key(collection, key).await?;
        }
        self.fetch(collection, key).await
    }

    async fn put(&mut self, collection: &str, key: &str, value: Value) -> Result<()> {
        self.lock_key(collection, key).await?;
        sqlx::query(
            r#"
            INSERT INTO kv_entries (collection, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(Json(value))
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn contains_key(&mut self, collection: &str, key: &str) -> Result<bool> {
        self.lock_key(collection, key).await?;
        Ok(self.fetch(collection, key).await?.is_some())
    }

    async fn scan(&mut self, collection: &str, range: &KeyRange) -> Result<Vec<(String, Value)>> {
        let rows: Vec<(String, Json<Value>)> = sqlx::query_as(
            r#"
            SELECT key, value FROM kv_entries
            WHERE collection = $1
              AND ($2::text IS NULL OR key >= $2)
              AND ($3::text IS NULL OR key < $3)
            ORDER BY key
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(collection)
        .bind(range.start.as_deref())
        .bind(range.end.as_deref())
        .bind(range.limit.map(|limit| limit as i64))
        .bind(range.offset as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(classify)?;

        Ok(rows.into_iter().map(|(key, Json(value))| (key, value)).collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(classify)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(classify)
    }
}

/// Folds retryable database failures into `TransientTimeout`.
fn classify(err: sqlx::Error) -> Error {
    if is_transient_error(&err) {
        Error::TransientTimeout(err.to_string())
    } else {
        Error::Database(err)
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" || // too_many_connections
            code == "55P03" || // lock_not_available
            code == "40001" || // serialization_failure
            code == "40P01" // deadlock_detected
        }),
        _ => false,
    }
}
