use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use carelink_core::config::{MessagingConfig, MessagingProviderKind};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const TWILIO_API_BASE: &str = "https://api.twilio.com";
const TWILIO_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("messaging provider misconfigured: {0}")]
    Configuration(String),
    #[error("messaging transport failed: {0}")]
    Transport(String),
    #[error("messaging provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("{provider} does not deliver {channel}")]
    Unsupported { provider: &'static str, channel: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub provider: String,
    pub provider_message_id: String,
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_sms(&self, to: &str, body: &str) -> Result<DeliveryReceipt, MessagingError>;

    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, MessagingError>;
}

pub fn provider_from_config(
    config: &MessagingConfig,
) -> Result<Arc<dyn MessagingProvider>, MessagingError> {
    match config.provider {
        MessagingProviderKind::Log => Ok(Arc::new(LogOnlyMessagingProvider::default())),
        MessagingProviderKind::Twilio => {
            let missing = |field: &str| {
                MessagingError::Configuration(format!("messaging.{field} is required for twilio"))
            };
            let account_sid = config.account_sid.clone().ok_or_else(|| missing("account_sid"))?;
            let auth_token = config.auth_token.clone().ok_or_else(|| missing("auth_token"))?;
            let from_number = config.from_number.clone().ok_or_else(|| missing("from_number"))?;
            Ok(Arc::new(TwilioMessagingProvider::new(
                TWILIO_API_BASE,
                account_sid,
                auth_token,
                from_number,
            )?))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: &'static str,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Logs deliveries instead of sending them. Keeps a copy for inspection.
#[derive(Default)]
pub struct LogOnlyMessagingProvider {
    sent: Mutex<Vec<SentMessage>>,
}

impl LogOnlyMessagingProvider {
    pub fn sent(&self) -> Vec<SentMessage> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, message: SentMessage) -> DeliveryReceipt {
        info!(
            event_name = "messaging.log_only.sent",
            channel = message.channel,
            to = %message.to,
            chars = message.body.chars().count(),
            "message delivery logged"
        );
        match self.sent.lock() {
            Ok(mut guard) => guard.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
        DeliveryReceipt {
            provider: self.name().to_owned(),
            provider_message_id: format!("log-{}", Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl MessagingProvider for LogOnlyMessagingProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<DeliveryReceipt, MessagingError> {
        Ok(self.record(SentMessage {
            channel: "sms",
            to: to.to_owned(),
            subject: None,
            body: body.to_owned(),
        }))
    }

    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, MessagingError> {
        Ok(self.record(SentMessage {
            channel: "email",
            to: to.to_owned(),
            subject: Some(subject.to_owned()),
            body: body.to_owned(),
        }))
    }
}

pub struct TwilioMessagingProvider {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: SecretString,
    from_number: String,
}

#[derive(Deserialize)]
struct TwilioMessageResponse {
    sid: String,
}

impl TwilioMessagingProvider {
    pub fn new(
        base_url: &str,
        account_sid: String,
        auth_token: SecretString,
        from_number: String,
    ) -> Result<Self, MessagingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TWILIO_TIMEOUT_SECS))
            .build()
            .map_err(|error| MessagingError::Configuration(error.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            account_sid,
            auth_token,
            from_number,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/2010-04-01/Accounts/{}/Messages.json", self.base_url, self.account_sid)
    }
}

#[async_trait]
impl MessagingProvider for TwilioMessagingProvider {
    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<DeliveryReceipt, MessagingError> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&[("To", to), ("From", self.from_number.as_str()), ("Body", body)])
            .send()
            .await
            .map_err(|error| MessagingError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MessagingError::Rejected { status: status.as_u16(), message });
        }

        let parsed: TwilioMessageResponse =
            response.json().await.map_err(|error| MessagingError::Transport(error.to_string()))?;
        Ok(DeliveryReceipt { provider: self.name().to_owned(), provider_message_id: parsed.sid })
    }

    async fn send_email(
        &self,
        _to: &str,
        _subject: &str,
        _body: &str,
    ) -> Result<DeliveryReceipt, MessagingError> {
        Err(MessagingError::Unsupported { provider: "twilio", channel: "email" })
    }
}
