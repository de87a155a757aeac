use sqlx::{sqlite::SqliteRow, Row};

use carelink_core::domain::context::Channel;
use carelink_core::domain::message::{InboundRecord, MessageId, OutboundMessage};
use carelink_core::trace::TraceId;

use super::decode::{encode_json, parse_timestamp, parse_u32};
use super::{MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn save_inbound(&self, record: InboundRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO inbound_message (
                id,
                user_id,
                channel,
                text,
                meta_json,
                trace_id,
                received_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(&record.user_id)
        .bind(record.channel.as_str())
        .bind(&record.text)
        .bind(encode_json("meta_json", &record.meta)?)
        .bind(&record.trace_id.0)
        .bind(record.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_outbound(&self, message: OutboundMessage) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO outbound_message (
                id,
                user_id,
                channel,
                text,
                trace_id,
                sequence,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&message.user_id)
        .bind(message.channel.as_str())
        .bind(&message.text)
        .bind(&message.trace_id.0)
        .bind(i64::from(message.sequence))
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_outbound(
        &self,
        trace_id: &TraceId,
    ) -> Result<Vec<OutboundMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, channel, text, trace_id, sequence, created_at
             FROM outbound_message
             WHERE trace_id = ?
             ORDER BY sequence ASC",
        )
        .bind(&trace_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(outbound_from_row).collect()
    }
}

fn outbound_from_row(row: SqliteRow) -> Result<OutboundMessage, RepositoryError> {
    let channel_raw = row.try_get::<String, _>("channel")?;
    let channel = Channel::parse(&channel_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown channel `{channel_raw}`")))?;

    Ok(OutboundMessage {
        id: MessageId(row.try_get("id")?),
        user_id: row.try_get("user_id")?,
        channel,
        text: row.try_get("text")?,
        trace_id: TraceId(row.try_get("trace_id")?),
        sequence: parse_u32("sequence", row.try_get("sequence")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
