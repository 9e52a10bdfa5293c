//! Postgres 消息存储
//!
//! 表结构见 `migrations/0001_reliable_event_messages.sql`，列与 `EventMessage`
//! 字段一一对应；payload 与 metadata 以 JSONB 存储。
//! `transition_state` 借助 `WHERE state = $expected` 实现乐观领取，
//! 多个处理循环共享同一张表时不会重复领取同一条消息。
//!
use super::MessageStorage;
use crate::error::{BusError, BusResult as Result};
use crate::message::{EventMessage, MessageState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_reliable_event_messages.sql");

const SELECT_COLUMNS: &str = r#"
    SELECT id, event, payload, "timestamp", retry_count, max_retries,
           state, priority, last_attempt, error, metadata
    FROM reliable_event_messages
"#;

#[derive(Clone)]
pub struct PostgresMessageStorage {
    pool: PgPool,
}

impl PostgresMessageStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 建表（幂等）
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    event: String,
    payload: Value,
    timestamp: DateTime<Utc>,
    retry_count: i32,
    max_retries: i32,
    state: String,
    priority: String,
    last_attempt: Option<DateTime<Utc>>,
    error: Option<String>,
    metadata: Option<Value>,
}

impl TryFrom<MessageRow> for EventMessage {
    type Error = BusError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let metadata = match row.metadata {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(BusError::Parse {
                    reason: format!("metadata must be a JSON object, got {other}"),
                });
            }
        };

        Ok(EventMessage::builder()
            .id(row.id)
            .event(row.event)
            .payload(row.payload)
            .timestamp(row.timestamp)
            .retry_count(to_u32(row.retry_count, "retry_count")?)
            .max_retries(to_u32(row.max_retries, "max_retries")?)
            .state(row.state.parse()?)
            .priority(row.priority.parse()?)
            .maybe_last_attempt(row.last_attempt)
            .maybe_error(row.error)
            .maybe_metadata(metadata)
            .build())
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| BusError::Parse {
        reason: format!("{column} must not be negative, got {value}"),
    })
}

fn to_i32(value: u32, column: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| BusError::Parse {
        reason: format!("{column} out of range: {value}"),
    })
}

#[async_trait]
impl MessageStorage for PostgresMessageStorage {
    async fn save_message(&self, message: &EventMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reliable_event_messages
                (id, event, payload, "timestamp", retry_count, max_retries,
                 state, priority, last_attempt, error, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                event = EXCLUDED.event,
                payload = EXCLUDED.payload,
                "timestamp" = EXCLUDED."timestamp",
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                state = EXCLUDED.state,
                priority = EXCLUDED.priority,
                last_attempt = EXCLUDED.last_attempt,
                error = EXCLUDED.error,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(message.id())
        .bind(message.event())
        .bind(message.payload())
        .bind(message.timestamp())
        .bind(to_i32(message.retry_count(), "retry_count")?)
        .bind(to_i32(message.max_retries(), "max_retries")?)
        .bind(message.state().as_str())
        .bind(message.priority().as_str())
        .bind(message.last_attempt())
        .bind(message.error())
        .bind(message.metadata().cloned().map(Value::Object))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_messages(
        &self,
        state: MessageState,
        limit: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        // LIMIT NULL 等价于不限制
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let sql = format!(r#"{SELECT_COLUMNS} WHERE state = $1 ORDER BY "timestamp" ASC LIMIT $2"#);

        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(EventMessage::try_from).collect()
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<EventMessage>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");

        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EventMessage::try_from).transpose()
    }

    async fn update_message_state(
        &self,
        id: Uuid,
        state: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reliable_event_messages
            SET state = $2, error = $3, last_attempt = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(error)
        .bind(attempted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BusError::NotFound {
                reason: format!("message {id}"),
            });
        }
        Ok(())
    }

    async fn transition_state(
        &self,
        id: Uuid,
        expected: MessageState,
        next: MessageState,
        error: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool> {
        expected.ensure_transition(next)?;

        let result = sqlx::query(
            r#"
            UPDATE reliable_event_messages
            SET state = $3, error = $4, last_attempt = $5
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(error)
        .bind(attempted_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_message(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM reliable_event_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use serde_json::json;

    fn row() -> MessageRow {
        MessageRow {
            id: Uuid::new_v4(),
            event: "shift.completed".into(),
            payload: json!({"shift_id": "s-9"}),
            timestamp: Utc::now(),
            retry_count: 1,
            max_retries: 3,
            state: "dead-letter".into(),
            priority: "high".into(),
            last_attempt: Some(Utc::now()),
            error: Some("timeout".into()),
            metadata: Some(json!({"source": "scheduler"})),
        }
    }

    #[test]
    fn row_maps_onto_event_message() {
        let r = row();
        let id = r.id;
        let msg = EventMessage::try_from(r).unwrap();

        assert_eq!(msg.id(), id);
        assert_eq!(msg.state(), MessageState::DeadLetter);
        assert_eq!(msg.priority(), Priority::High);
        assert_eq!(msg.retry_count(), 1);
        assert_eq!(msg.error(), Some("timeout"));
        assert_eq!(msg.metadata().unwrap()["source"], json!("scheduler"));
    }

    #[test]
    fn corrupt_rows_are_rejected() {
        let mut r = row();
        r.retry_count = -1;
        assert!(matches!(EventMessage::try_from(r), Err(BusError::Parse { .. })));

        let mut r = row();
        r.state = "delivering".into();
        assert!(EventMessage::try_from(r).is_err());

        let mut r = row();
        r.metadata = Some(json!([1, 2]));
        assert!(EventMessage::try_from(r).is_err());
    }
}
