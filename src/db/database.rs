use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::models::{LastRequest, LastRequestRow, LastRequestUpsert};

const WRITE_QUEUE_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    sender: mpsc::Sender<LastRequestUpsert>,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database opens a fresh, empty one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS last_requests (\
                user_id INTEGER PRIMARY KEY,\
                payload TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        info!("Database tables created successfully");

        let (sender, receiver) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let writer_pool = pool.clone();
        tokio::spawn(async move {
            db_writer(writer_pool, receiver).await;
        });

        info!("Database writer task started");

        Ok(Database { pool, sender })
    }

    pub async fn queue_last_request(&self, upsert: LastRequestUpsert) -> Result<()> {
        self.sender
            .send(upsert)
            .await
            .map_err(|err| anyhow::anyhow!("Failed to queue last request write: {err}"))
    }

    pub async fn fetch_last_request(&self, user_id: i64) -> Result<Option<LastRequest>> {
        let row = sqlx::query_as::<_, LastRequestRow>("SELECT user_id, payload FROM last_requests WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        match serde_json::from_str::<LastRequest>(&row.payload) {
            Ok(request) => Ok(Some(request)),
            Err(err) => {
                warn!("Ignoring unreadable last request for user {}: {err}", row.user_id);
                Ok(None)
            }
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity().saturating_sub(self.sender.capacity())
    }
}

async fn upsert_last_request(pool: &SqlitePool, upsert: &LastRequestUpsert) -> Result<()> {
    let payload = serde_json::to_string(&upsert.request)?;
    sqlx::query(
        "INSERT INTO last_requests (user_id, payload) VALUES (?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET payload = excluded.payload",
    )
    .bind(upsert.user_id)
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(())
}

async fn db_writer(pool: SqlitePool, mut receiver: mpsc::Receiver<LastRequestUpsert>) {
    while let Some(upsert) = receiver.recv().await {
        if let Err(err) = upsert_last_request(&pool, &upsert).await {
            warn!("Error in db_writer for user {}: {err}", upsert.user_id);
        }
    }

    let _ = pool.close().await;
    info!("Database writer task stopped");
}
