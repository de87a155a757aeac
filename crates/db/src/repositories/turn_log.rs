use sqlx::{sqlite::SqliteRow, Row};

use carelink_core::domain::turn::{
    AgentRunRecord, GuardrailEvent, GuardrailPhase, RunOutcome, UsageCounters,
};
use carelink_core::trace::TraceId;

use super::decode::{encode_json, parse_json, parse_timestamp, parse_u32, parse_u64};
use super::{RepositoryError, TurnLogRepository};
use crate::DbPool;

pub struct SqlTurnLogRepository {
    pool: DbPool,
}

impl SqlTurnLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TurnLogRepository for SqlTurnLogRepository {
    async fn log_agent_run(&self, record: AgentRunRecord) -> Result<(), RepositoryError> {
        let latency_ms = i64::try_from(record.latency_ms).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO agent_run (
                id,
                agent,
                user_id,
                policy_bundle,
                input_units,
                output_units,
                tool_calls,
                trace_id,
                latency_ms,
                outcome,
                error,
                trace_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.agent)
        .bind(&record.user_id)
        .bind(&record.policy_bundle)
        .bind(i64::from(record.usage.input_units))
        .bind(i64::from(record.usage.output_units))
        .bind(i64::from(record.usage.tool_calls))
        .bind(&record.trace_id.0)
        .bind(latency_ms)
        .bind(record.outcome.as_str())
        .bind(record.error.as_deref())
        .bind(encode_json("trace_json", &record.trace)?)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn log_guardrail(&self, event: GuardrailEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO guardrail_event (
                id,
                rule_id,
                action,
                phase,
                message,
                trace_id,
                user_id,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.rule_id)
        .bind(&event.action)
        .bind(event.phase.as_str())
        .bind(event.message.as_deref())
        .bind(&event.trace_id.0)
        .bind(&event.user_id)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_agent_runs(
        &self,
        user_id: &str,
    ) -> Result<Vec<AgentRunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                agent,
                user_id,
                policy_bundle,
                input_units,
                output_units,
                tool_calls,
                trace_id,
                latency_ms,
                outcome,
                error,
                trace_json,
                created_at
             FROM agent_run
             WHERE user_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(agent_run_from_row).collect()
    }

    async fn list_guardrails(
        &self,
        user_id: &str,
    ) -> Result<Vec<GuardrailEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, rule_id, action, phase, message, trace_id, user_id, occurred_at
             FROM guardrail_event
             WHERE user_id = ?
             ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(guardrail_from_row).collect()
    }
}

fn agent_run_from_row(row: SqliteRow) -> Result<AgentRunRecord, RepositoryError> {
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = RunOutcome::parse(&outcome_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown run outcome `{outcome_raw}`")))?;
    let trace_raw = row.try_get::<String, _>("trace_json")?;

    Ok(AgentRunRecord {
        id: row.try_get("id")?,
        agent: row.try_get("agent")?,
        user_id: row.try_get("user_id")?,
        policy_bundle: row.try_get("policy_bundle")?,
        usage: UsageCounters {
            input_units: parse_u32("input_units", row.try_get("input_units")?)?,
            output_units: parse_u32("output_units", row.try_get("output_units")?)?,
            tool_calls: parse_u32("tool_calls", row.try_get("tool_calls")?)?,
        },
        trace_id: TraceId(row.try_get("trace_id")?),
        latency_ms: parse_u64("latency_ms", row.try_get("latency_ms")?)?,
        outcome,
        error: row.try_get("error")?,
        trace: parse_json("trace_json", &trace_raw)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn guardrail_from_row(row: SqliteRow) -> Result<GuardrailEvent, RepositoryError> {
    let phase_raw = row.try_get::<String, _>("phase")?;
    let phase = GuardrailPhase::parse(&phase_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown guardrail phase `{phase_raw}`")))?;

    Ok(GuardrailEvent {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        action: row.try_get("action")?,
        phase,
        message: row.try_get("message")?,
        trace_id: TraceId(row.try_get("trace_id")?),
        user_id: row.try_get("user_id")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use carelink_core::chrono::Utc;
    use carelink_core::domain::turn::{
        AgentRunRecord, GuardrailEvent, GuardrailPhase, RunOutcome, UsageCounters,
    };
    use carelink_core::trace::Trace;
    use serde_json::json;

    use super::SqlTurnLogRepository;
    use crate::repositories::TurnLogRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn agent_runs_and_guardrails_round_trip() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        let repo = SqlTurnLogRepository::new(pool.clone());

        let trace = Trace::new();
        trace.push("stream.chunk", json!({ "size": 4 }));

        let run = AgentRunRecord {
            id: "run-1".to_string(),
            agent: "main".to_string(),
            user_id: "user-1".to_string(),
            policy_bundle: "default".to_string(),
            usage: UsageCounters { input_units: 3, output_units: 1, tool_calls: 0 },
            trace_id: trace.id().clone(),
            latency_ms: 12,
            outcome: RunOutcome::Completed,
            error: None,
            trace: trace.steps(),
            created_at: Utc::now(),
        };
        repo.log_agent_run(run.clone()).await.expect("log run");

        let event = GuardrailEvent {
            id: "guard-1".to_string(),
            rule_id: "medical_advice".to_string(),
            action: "block_with_message:medical_disclaimer".to_string(),
            phase: GuardrailPhase::Pre,
            message: Some("I can't give medical advice.".to_string()),
            trace_id: trace.id().clone(),
            user_id: "user-1".to_string(),
            occurred_at: Utc::now(),
        };
        repo.log_guardrail(event.clone()).await.expect("log guardrail");

        assert_eq!(repo.list_agent_runs("user-1").await.expect("runs"), vec![run]);
        assert_eq!(repo.list_guardrails("user-1").await.expect("guardrails"), vec![event]);
        assert!(repo.list_guardrails("user-2").await.expect("guardrails").is_empty());

        pool.close().await;
    }
}
