use async_trait::async_trait;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::channel::{AdmissionChannel, TokenId};
use super::RateKey;
use crate::errors::IntakeError;

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn channel_error(err: impl std::fmt::Display) -> IntakeError {
    IntakeError::Channel(err.to_string())
}

/// Token log shared between processes through a SQLite file, so the dripper
/// can run apart from the workers that admit on it.
pub struct SqliteAdmissionChannel {
    pool: SqlitePool,
    consumer_id: String,
    retained: i64,
}

impl SqliteAdmissionChannel {
    /// Open (creating if needed) the token database and run migrations.
    pub async fn connect(database_url: &str, retained: usize) -> Result<Self, IntakeError> {
        if !sqlx::Sqlite::database_exists(database_url)
            .await
            .map_err(channel_error)?
        {
            info!("Creating admission database at {}", database_url);
            sqlx::Sqlite::create_database(database_url)
                .await
                .map_err(channel_error)?;
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(channel_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(channel_error)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(channel_error)?;

        Ok(Self {
            pool,
            consumer_id: uuid::Uuid::new_v4().to_string(),
            retained: retained.max(1) as i64,
        })
    }

    async fn try_claim(&self, key: RateKey, after: TokenId) -> Result<Option<TokenId>, IntakeError> {
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE admission_tokens
            SET consumed_by = ?1, consumed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = (
                SELECT id FROM admission_tokens
                WHERE rate_key = ?2 AND consumed_by IS NULL AND id > ?3
                ORDER BY id
                LIMIT 1
            )
            AND consumed_by IS NULL
            RETURNING id
            "#,
        )
        .bind(&self.consumer_id)
        .bind(key.channel_name())
        .bind(after.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(channel_error)?;

        Ok(claimed.map(|id| TokenId(id as u64)))
    }
}

#[async_trait]
impl AdmissionChannel for SqliteAdmissionChannel {
    /// Insert and retention trim commit together, so a failed append leaves
    /// no claimable token behind.
    async fn append(&self, key: RateKey) -> Result<TokenId, IntakeError> {
        let mut tx = self.pool.begin().await.map_err(channel_error)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO admission_tokens (rate_key) VALUES (?1)
            RETURNING id
            "#,
        )
        .bind(key.channel_name())
        .fetch_one(&mut *tx)
        .await
        .map_err(channel_error)?;

        sqlx::query(
            r#"
            DELETE FROM admission_tokens
            WHERE rate_key = ?1
              AND id NOT IN (
                SELECT id FROM admission_tokens
                WHERE rate_key = ?1
                ORDER BY id DESC
                LIMIT ?2
              )
            "#,
        )
        .bind(key.channel_name())
        .bind(self.retained)
        .execute(&mut *tx)
        .await
        .map_err(channel_error)?;

        tx.commit().await.map_err(channel_error)?;
        Ok(TokenId(id as u64))
    }

    async fn claim_next(
        &self,
        key: RateKey,
        after: TokenId,
        wait: Duration,
    ) -> Result<Option<TokenId>, IntakeError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(token) = self.try_claim(key, after).await? {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn available(&self, key: RateKey) -> Result<usize, IntakeError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM admission_tokens WHERE rate_key = ?1 AND consumed_by IS NULL",
        )
        .bind(key.channel_name())
        .fetch_one(&self.pool)
        .await
        .map_err(channel_error)?;
        Ok(count as usize)
    }
}
