use carelink_core::chrono::Utc;
use sqlx::Row;

use carelink_core::domain::context::HydratedContext;

use super::decode::{encode_json, parse_json};
use super::{ContextRepository, RepositoryError};
use crate::DbPool;

/// Stores each user's context as one JSON document.
pub struct SqlContextRepository {
    pool: DbPool,
}

impl SqlContextRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ContextRepository for SqlContextRepository {
    async fn load(&self, user_id: &str) -> Result<Option<HydratedContext>, RepositoryError> {
        let row = sqlx::query("SELECT document_json FROM conversation_context WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let document = row.try_get::<String, _>("document_json")?;
            parse_json("document_json", &document)
        })
        .transpose()
    }

    async fn save(&self, context: &HydratedContext) -> Result<(), RepositoryError> {
        let document = encode_json("document_json", context)?;

        sqlx::query(
            "INSERT INTO conversation_context (
                user_id,
                session_id,
                policy_bundle,
                document_json,
                updated_at
             ) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                session_id = excluded.session_id,
                policy_bundle = excluded.policy_bundle,
                document_json = excluded.document_json,
                updated_at = excluded.updated_at",
        )
        .bind(&context.user_id)
        .bind(&context.session_id)
        .bind(&context.policy_bundle)
        .bind(document)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
