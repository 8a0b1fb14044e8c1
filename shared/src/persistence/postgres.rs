use super::{MessageRecord, MessageStatistics, MessageStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_error::RelayResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use std::time::Duration;

pub type DbPool = Pool<Postgres>;

#[derive(Debug, Clone, sqlx::FromRow)]
struct MessageRow {
    id: String,
    tenant_id: String,
    session_id: String,
    user_id: String,
    message_type: String,
    content: Json<serde_json::Value>,
    routing_key: String,
    sent_at: DateTime<Utc>,
}

impl From<MessageRow> for MessageRecord {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            session_id: row.session_id,
            user_id: row.user_id,
            message_type: row.message_type,
            content: row.content.0,
            routing_key: row.routing_key,
            sent_at: row.sent_at,
        }
    }
}

const COLUMNS: &str =
    "id, tenant_id, session_id, user_id, message_type, content, routing_key, sent_at";

/// Message store on PostgreSQL (`relay_messages`)
#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: DbPool,
}

impl PostgresMessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connect and apply migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> RelayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .test_before_acquire(true)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(Self::new(pool))
    }

    async fn newest(&self, filter: Option<(&str, &str)>, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match filter {
            Some((column, value)) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM relay_messages WHERE {column} = $1 ORDER BY sent_at DESC LIMIT $2"
                );
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(value)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {COLUMNS} FROM relay_messages ORDER BY sent_at DESC LIMIT $1");
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(MessageRecord::from).collect())
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn save(&self, record: MessageRecord) -> RelayResult<MessageRecord> {
        let inserted = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            INSERT INTO relay_messages ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.message_type)
        .bind(Json(&record.content))
        .bind(&record.routing_key)
        .bind(record.sent_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        tracing::debug!(message_id = %record.id, "Message already stored");
        let existing = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {COLUMNS} FROM relay_messages WHERE id = $1"
        ))
        .bind(&record.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(existing.into())
    }

    async fn by_session(&self, session_id: &str, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        self.newest(Some(("session_id", session_id)), limit).await
    }

    async fn by_user(&self, user_id: &str, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        self.newest(Some(("user_id", user_id)), limit).await
    }

    async fn by_type(&self, message_type: &str, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        self.newest(Some(("message_type", message_type)), limit).await
    }

    async fn recent(&self, limit: usize) -> RelayResult<Vec<MessageRecord>> {
        self.newest(None, limit).await
    }

    async fn statistics(&self) -> RelayResult<MessageStatistics> {
        let (total, sessions, users): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(DISTINCT session_id), COUNT(DISTINCT user_id)
            FROM relay_messages
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT message_type, COUNT(*) FROM relay_messages GROUP BY message_type",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(MessageStatistics {
            total: total.max(0) as u64,
            sessions: sessions.max(0) as u64,
            users: users.max(0) as u64,
            by_type: by_type
                .into_iter()
                .map(|(kind, n)| (kind, n.max(0) as u64))
                .collect(),
        })
    }
}
