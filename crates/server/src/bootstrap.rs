use std::sync::Arc;

use carelink_agent::{
    default_registry, driver_from_config, ModelError, RuleBasedPolicy, TurnPipeline,
};
use carelink_core::config::{AppConfig, ConfigError, LoadOptions};
use carelink_core::domain::job::JobType;
use carelink_db::{connect_from_config, migrations, DbPool, Store};
use thiserror::Error;
use tracing::info;

use crate::handlers::{
    InboundMessageHandler, PaymentEventHandler, SendEmailHandler, SendSmsHandler,
};
use crate::messaging::{provider_from_config, MessagingError};
use crate::worker::{JobDispatcher, JobWorker};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub store: Store,
    pub pipeline: Arc<TurnPipeline>,
    pub worker: JobWorker,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model driver setup failed: {0}")]
    Model(#[from] ModelError),
    #[error("messaging setup failed: {0}")]
    Messaging(#[from] MessagingError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store = Store::sqlite(db_pool.clone(), config.worker.queue_config());
    let model = driver_from_config(&config.llm)?;
    let pipeline = Arc::new(
        TurnPipeline::new(
            store.clone(),
            Arc::new(RuleBasedPolicy::default()),
            model,
            Arc::new(default_registry()),
        )
        .with_budgets(config.budget.clone()),
    );
    let messaging = provider_from_config(&config.messaging)?;

    let dispatcher = JobDispatcher::new()
        .register(JobType::OutboundMessage, Arc::new(SendSmsHandler::new(messaging.clone())))
        .register(JobType::OutboundEmail, Arc::new(SendEmailHandler::new(messaging.clone())))
        .register(
            JobType::InboundMessageProcessing,
            Arc::new(InboundMessageHandler::new(pipeline.clone(), store.clone())),
        )
        .register(
            JobType::PaymentEventProcessing,
            Arc::new(PaymentEventHandler::new(store.clone())),
        );
    let worker = JobWorker::new(store.clone(), dispatcher, &config.worker);

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        llm_provider = ?config.llm.provider,
        messaging_provider = messaging.name(),
        "application components wired"
    );

    Ok(Application { config, db_pool, store, pipeline, worker })
}

#[cfg(test)]
mod tests {
    use carelink_core::config::{AppConfig, ConfigOverrides, LoadOptions, MessagingProviderKind};
    use carelink_core::domain::context::{Channel, Inbound};
    use carelink_core::domain::job::{IdempotencyKey, JobStatus, JobType};
    use serde_json::json;

    use crate::bootstrap::{bootstrap, bootstrap_with_config};

    fn single_connection_config() -> AppConfig {
        let mut config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config");
        // every pooled connection to `sqlite::memory:` is its own database
        config.database.max_connections = 1;
        config
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_twilio_credentials() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                messaging_provider: Some(MessagingProviderKind::Twilio),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("account_sid"), "unexpected error: {message}");
    }

    #[tokio::test]
    async fn bootstrap_wires_pipeline_and_worker_end_to_end() {
        let app = bootstrap_with_config(single_connection_config()).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('job', 'conversation_context')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema");
        assert_eq!(table_count, 2);

        let result = app
            .pipeline
            .handle(Inbound::new(Channel::Web, "u-boot", "hello"))
            .await
            .expect("turn");
        assert_eq!(result.outcome.kind(), "stream");

        app.store
            .jobs
            .ensure_unique_job(
                IdempotencyKey::twilio("SM-boot"),
                JobType::InboundMessageProcessing,
                json!({ "from": "+15550100", "body": "hi", "message_sid": "SM-boot" }),
                None,
            )
            .await
            .expect("enqueue");
        let report = app.worker.run_batch().await.expect("batch");
        assert_eq!(report.processed, 2);

        let reply = app
            .store
            .jobs
            .find_by_key(&IdempotencyKey::new("reply:twilio:SM-boot"))
            .await
            .expect("find")
            .expect("reply");
        assert_eq!(reply.status, JobStatus::Completed);

        app.db_pool.close().await;
    }
}
