use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{Budget, BudgetTable};
use crate::job_queue::JobQueueConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub messaging: MessagingConfig,
    pub worker: WorkerConfig,
    pub server: ServerConfig,
    pub webhooks: WebhookConfig,
    pub logging: LoggingConfig,
    pub budget: BudgetTable,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MessagingConfig {
    pub provider: MessagingProviderKind,
    pub account_sid: Option<String>,
    pub auth_token: Option<SecretString>,
    pub from_number: Option<String>,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub batch_size: u32,
    pub poll_interval_ms: u64,
    pub default_max_attempts: u32,
    pub processing_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub payment_signing_secret: Option<SecretString>,
    pub signature_tolerance_secs: u64,
    /// Token the SMS provider signs inbound webhooks with. Unset disables the check.
    pub sms_auth_token: Option<SecretString>,
    /// Externally visible origin, e.g. `https://carelink.example.org`. The SMS
    /// signature covers the URL the provider called, not the one we bind to.
    pub public_base_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Deterministic offline driver
    Scripted,
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingProviderKind {
    Log,
    Twilio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub messaging_provider: Option<MessagingProviderKind>,
    pub worker_enabled: Option<bool>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://carelink.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Scripted,
                api_key: None,
                base_url: None,
                model: "gpt-4o-mini".to_string(),
                timeout_secs: 30,
            },
            messaging: MessagingConfig {
                provider: MessagingProviderKind::Log,
                account_sid: None,
                auth_token: None,
                from_number: None,
            },
            worker: WorkerConfig {
                enabled: true,
                batch_size: 10,
                poll_interval_ms: 5_000,
                default_max_attempts: 3,
                processing_timeout_secs: 900,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            webhooks: WebhookConfig {
                payment_signing_secret: None,
                signature_tolerance_secs: 300,
                sms_auth_token: None,
                public_base_url: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            budget: BudgetTable::default(),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scripted" => Ok(Self::Scripted),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected scripted|openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for MessagingProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "twilio" => Ok(Self::Twilio),
            other => Err(ConfigError::Validation(format!(
                "unsupported messaging provider `{other}` (expected log|twilio)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl WorkerConfig {
    pub fn queue_config(&self) -> JobQueueConfig {
        JobQueueConfig {
            default_max_attempts: self.default_max_attempts,
            processing_timeout_seconds: i64::try_from(self.processing_timeout_secs)
                .unwrap_or(i64::MAX),
            ..JobQueueConfig::default()
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("carelink.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(messaging) = patch.messaging {
            if let Some(provider) = messaging.provider {
                self.messaging.provider = provider;
            }
            if let Some(account_sid) = messaging.account_sid {
                self.messaging.account_sid = Some(account_sid);
            }
            if let Some(auth_token) = messaging.auth_token {
                self.messaging.auth_token = Some(secret_value(auth_token));
            }
            if let Some(from_number) = messaging.from_number {
                self.messaging.from_number = Some(from_number);
            }
        }

        if let Some(worker) = patch.worker {
            if let Some(enabled) = worker.enabled {
                self.worker.enabled = enabled;
            }
            if let Some(batch_size) = worker.batch_size {
                self.worker.batch_size = batch_size;
            }
            if let Some(poll_interval_ms) = worker.poll_interval_ms {
                self.worker.poll_interval_ms = poll_interval_ms;
            }
            if let Some(default_max_attempts) = worker.default_max_attempts {
                self.worker.default_max_attempts = default_max_attempts;
            }
            if let Some(processing_timeout_secs) = worker.processing_timeout_secs {
                self.worker.processing_timeout_secs = processing_timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(webhooks) = patch.webhooks {
            if let Some(secret) = webhooks.payment_signing_secret {
                self.webhooks.payment_signing_secret = Some(secret_value(secret));
            }
            if let Some(tolerance) = webhooks.signature_tolerance_secs {
                self.webhooks.signature_tolerance_secs = tolerance;
            }
            if let Some(token) = webhooks.sms_auth_token {
                self.webhooks.sms_auth_token = Some(secret_value(token));
            }
            if let Some(public_base_url) = webhooks.public_base_url {
                self.webhooks.public_base_url = Some(public_base_url);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(budget) = patch.budget {
            if let Some(default) = budget.default {
                self.budget.default = default;
            }
            self.budget.agents.extend(budget.agents);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CARELINK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CARELINK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CARELINK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CARELINK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CARELINK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CARELINK_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CARELINK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CARELINK_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CARELINK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CARELINK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CARELINK_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CARELINK_MESSAGING_PROVIDER") {
            self.messaging.provider = value.parse()?;
        }
        if let Some(value) = read_env("CARELINK_MESSAGING_ACCOUNT_SID") {
            self.messaging.account_sid = Some(value);
        }
        if let Some(value) = read_env("CARELINK_MESSAGING_AUTH_TOKEN") {
            self.messaging.auth_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CARELINK_MESSAGING_FROM_NUMBER") {
            self.messaging.from_number = Some(value);
        }

        if let Some(value) = read_env("CARELINK_WORKER_ENABLED") {
            self.worker.enabled = parse_bool("CARELINK_WORKER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CARELINK_WORKER_BATCH_SIZE") {
            self.worker.batch_size = parse_u32("CARELINK_WORKER_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("CARELINK_WORKER_POLL_INTERVAL_MS") {
            self.worker.poll_interval_ms = parse_u64("CARELINK_WORKER_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("CARELINK_WORKER_MAX_ATTEMPTS") {
            self.worker.default_max_attempts = parse_u32("CARELINK_WORKER_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("CARELINK_WORKER_PROCESSING_TIMEOUT_SECS") {
            self.worker.processing_timeout_secs =
                parse_u64("CARELINK_WORKER_PROCESSING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CARELINK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CARELINK_SERVER_PORT") {
            self.server.port = parse_u16("CARELINK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CARELINK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CARELINK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CARELINK_WEBHOOK_PAYMENT_SECRET") {
            self.webhooks.payment_signing_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("CARELINK_WEBHOOK_SIGNATURE_TOLERANCE_SECS") {
            self.webhooks.signature_tolerance_secs =
                parse_u64("CARELINK_WEBHOOK_SIGNATURE_TOLERANCE_SECS", &value)?;
        }
        if let Some(value) = read_env("CARELINK_WEBHOOK_SMS_AUTH_TOKEN") {
            self.webhooks.sms_auth_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CARELINK_WEBHOOK_PUBLIC_BASE_URL") {
            self.webhooks.public_base_url = Some(value);
        }

        let log_level =
            read_env("CARELINK_LOGGING_LEVEL").or_else(|| read_env("CARELINK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CARELINK_LOGGING_FORMAT").or_else(|| read_env("CARELINK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(messaging_provider) = overrides.messaging_provider {
            self.messaging.provider = messaging_provider;
        }
        if let Some(worker_enabled) = overrides.worker_enabled {
            self.worker.enabled = worker_enabled;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_messaging(&self.messaging)?;
        validate_worker(&self.worker)?;
        validate_server(&self.server)?;
        validate_webhooks(&self.webhooks)?;
        validate_logging(&self.logging)?;
        validate_budget(&self.budget)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("carelink.toml"), PathBuf::from("config/carelink.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::Scripted => {}
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_messaging(messaging: &MessagingConfig) -> Result<(), ConfigError> {
    if messaging.provider != MessagingProviderKind::Twilio {
        return Ok(());
    }

    let blank = |value: Option<&str>| value.map(|value| value.trim().is_empty()).unwrap_or(true);
    if blank(messaging.account_sid.as_deref()) {
        return Err(ConfigError::Validation(
            "messaging.account_sid is required for the twilio provider".to_string(),
        ));
    }
    if blank(messaging.auth_token.as_ref().map(|token| token.expose_secret())) {
        return Err(ConfigError::Validation(
            "messaging.auth_token is required for the twilio provider".to_string(),
        ));
    }
    if blank(messaging.from_number.as_deref()) {
        return Err(ConfigError::Validation(
            "messaging.from_number is required for the twilio provider".to_string(),
        ));
    }

    Ok(())
}

fn validate_webhooks(webhooks: &WebhookConfig) -> Result<(), ConfigError> {
    if webhooks.sms_auth_token.is_none() {
        return Ok(());
    }
    match webhooks.public_base_url.as_deref().map(str::trim) {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
        _ => Err(ConfigError::Validation(
            "webhooks.public_base_url must be an http(s) origin when webhooks.sms_auth_token is set"
                .to_string(),
        )),
    }
}

fn validate_worker(worker: &WorkerConfig) -> Result<(), ConfigError> {
    if worker.batch_size == 0 {
        return Err(ConfigError::Validation(
            "worker.batch_size must be greater than zero".to_string(),
        ));
    }
    if worker.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "worker.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if worker.default_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "worker.default_max_attempts must be greater than zero".to_string(),
        ));
    }
    if worker.processing_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "worker.processing_timeout_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_budget(budget: &BudgetTable) -> Result<(), ConfigError> {
    let zero_output = |entry: &Budget| entry.max_output_units == 0;
    if zero_output(&budget.default) {
        return Err(ConfigError::Validation(
            "budget.default.max_output_units must be greater than zero".to_string(),
        ));
    }
    if let Some((key, _)) = budget.agents.iter().find(|(_, entry)| zero_output(entry)) {
        return Err(ConfigError::Validation(format!(
            "budget.agents.{key}.max_output_units must be greater than zero"
        )));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    messaging: Option<MessagingPatch>,
    worker: Option<WorkerPatch>,
    server: Option<ServerPatch>,
    webhooks: Option<WebhookPatch>,
    logging: Option<LoggingPatch>,
    budget: Option<BudgetPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagingPatch {
    provider: Option<MessagingProviderKind>,
    account_sid: Option<String>,
    auth_token: Option<String>,
    from_number: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    enabled: Option<bool>,
    batch_size: Option<u32>,
    poll_interval_ms: Option<u64>,
    default_max_attempts: Option<u32>,
    processing_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    payment_signing_secret: Option<String>,
    signature_tolerance_secs: Option<u64>,
    sms_auth_token: Option<String>,
    public_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct BudgetPatch {
    default: Option<Budget>,
    #[serde(default)]
    agents: std::collections::BTreeMap<String, Budget>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat,
        MessagingProviderKind,
    };
    use crate::budget::Budget;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_run_offline() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.llm.provider == LlmProvider::Scripted, "default model driver is scripted")?;
        ensure(
            config.messaging.provider == MessagingProviderKind::Log,
            "default messaging provider only logs",
        )?;
        ensure(config.worker.batch_size == 10, "default batch size is ten")?;
        ensure(config.worker.default_max_attempts == 3, "default max attempts is three")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CARELINK_TWILIO_TOKEN", "token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("carelink.toml");
            fs::write(
                &path,
                r#"
[messaging]
provider = "twilio"
account_sid = "AC123"
auth_token = "${TEST_CARELINK_TWILIO_TOKEN}"
from_number = "+15550000000"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let token = config.messaging.auth_token.as_ref().map(|token| token.expose_secret());
            ensure(token == Some("token-from-env"), "auth token should come from environment")?;
            ensure(
                config.messaging.provider == MessagingProviderKind::Twilio,
                "provider should come from file",
            )
        })();

        clear_vars(&["TEST_CARELINK_TWILIO_TOKEN"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("carelink.toml");
        fs::write(&path, "[llm]\napi_key = \"${CARELINK_TEST_UNSET_VARIABLE}\"\n")
            .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected interpolation failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::MissingEnvInterpolation { ref var } if var == "CARELINK_TEST_UNSET_VARIABLE"),
            "error should name the missing variable",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CARELINK_LOG_LEVEL", "warn");
        env::set_var("CARELINK_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["CARELINK_LOG_LEVEL", "CARELINK_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CARELINK_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CARELINK_WORKER_BATCH_SIZE", "25");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("carelink.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[worker]
batch_size = 5
poll_interval_ms = 250

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.worker.batch_size == 25, "env batch size should win over file")?;
            ensure(config.worker.poll_interval_ms == 250, "file poll interval should apply")
        })();

        clear_vars(&["CARELINK_DATABASE_URL", "CARELINK_WORKER_BATCH_SIZE"]);
        result
    }

    #[test]
    fn budget_table_is_patched_from_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("carelink.toml");
        fs::write(
            &path,
            r#"
[budget.agents."pilot:main"]
max_input_units = 500
max_output_units = 200
max_tools = 0
"#,
        )
        .map_err(|err| err.to_string())?;

        let config =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                .map_err(|err| format!("config load failed: {err}"))?;

        ensure(
            config.budget.resolve("main", "pilot") == Budget::new(500, 200, 0),
            "bundle-specific budget should be loaded",
        )?;
        ensure(
            config.budget.resolve("crisis", "pilot") == Budget::new(2000, 600, 1),
            "built-in agent budgets should survive the patch",
        )
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CARELINK_MESSAGING_PROVIDER", "twilio");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("messaging.account_sid")
            );
            ensure(has_message, "validation failure should mention messaging.account_sid")
        })();

        clear_vars(&["CARELINK_MESSAGING_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CARELINK_WORKER_BATCH_SIZE", "lots");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected invalid override failure".to_string()),
            Err(error) => ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "CARELINK_WORKER_BATCH_SIZE"),
                "error should name the offending variable",
            ),
        };

        clear_vars(&["CARELINK_WORKER_BATCH_SIZE"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CARELINK_LLM_PROVIDER", "openai");
        env::set_var("CARELINK_LLM_API_KEY", "sk-secret-value");
        env::set_var("CARELINK_WEBHOOK_PAYMENT_SECRET", "whsec-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("whsec-secret-value"),
                "debug output should not contain webhook secret",
            )
        })();

        clear_vars(&[
            "CARELINK_LLM_PROVIDER",
            "CARELINK_LLM_API_KEY",
            "CARELINK_WEBHOOK_PAYMENT_SECRET",
        ]);
        result
    }

    #[test]
    fn sms_auth_token_requires_public_base_url() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CARELINK_WEBHOOK_SMS_AUTH_TOKEN", "twilio-token");
        let missing = AppConfig::load(LoadOptions::default());

        env::set_var("CARELINK_WEBHOOK_PUBLIC_BASE_URL", "https://carelink.example.org");
        let complete = AppConfig::load(LoadOptions::default());

        clear_vars(&["CARELINK_WEBHOOK_SMS_AUTH_TOKEN", "CARELINK_WEBHOOK_PUBLIC_BASE_URL"]);

        ensure(
            matches!(missing, Err(ConfigError::Validation(ref message)) if message.contains("public_base_url")),
            "token without a public base url should fail validation",
        )?;
        let config = complete.map_err(|err| format!("config load failed: {err}"))?;
        ensure(
            config.webhooks.sms_auth_token.as_ref().map(|token| token.expose_secret())
                == Some("twilio-token"),
            "sms auth token should load from env",
        )
    }
}
