use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use carelink_core::config::{LlmConfig, LlmProvider};

use crate::capabilities::CapabilitySpec;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model backend unreachable: {0}")]
    Network(String),
    #[error("model backend returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("model driver misconfigured: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Default)]
pub struct StreamRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_output_units: u32,
    pub tools: Vec<CapabilitySpec>,
}

pub type FragmentStream = mpsc::Receiver<Result<String, ModelError>>;

#[async_trait]
pub trait ModelDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Starts generation. Fragments arrive on the returned channel in order;
    /// the channel closes when generation ends.
    async fn stream(&self, request: StreamRequest) -> Result<FragmentStream, ModelError>;
}

pub fn driver_from_config(config: &LlmConfig) -> Result<Arc<dyn ModelDriver>, ModelError> {
    match config.provider {
        LlmProvider::Scripted => Ok(Arc::new(ScriptedModelDriver::default())),
        LlmProvider::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                ModelError::Configuration("openai provider requires an api key".to_owned())
            })?;
            let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_OPENAI_BASE_URL);
            Ok(Arc::new(OpenAiCompatibleDriver::new(
                "openai",
                base_url,
                Some(api_key),
                &config.model,
                config.timeout_secs,
            )?))
        }
        LlmProvider::Ollama => {
            let base_url = config.base_url.as_deref().ok_or_else(|| {
                ModelError::Configuration("ollama provider requires a base url".to_owned())
            })?;
            Ok(Arc::new(OpenAiCompatibleDriver::new(
                "ollama",
                base_url,
                config.api_key.clone(),
                &config.model,
                config.timeout_secs,
            )?))
        }
    }
}

#[derive(Default)]
struct ScriptState {
    calls: usize,
    last_request: Option<StreamRequest>,
}

/// Offline driver that replays a fixed list of fragments.
pub struct ScriptedModelDriver {
    fragments: Vec<String>,
    failure: Option<ModelError>,
    stall_after_script: bool,
    state: Mutex<ScriptState>,
}

impl Default for ScriptedModelDriver {
    fn default() -> Self {
        Self::new(vec![
            "Thank you for reaching out. ".to_owned(),
            "I'm here with you, and we can take this one step at a time.".to_owned(),
        ])
    }
}

impl ScriptedModelDriver {
    pub fn new(fragments: Vec<String>) -> Self {
        Self {
            fragments,
            failure: None,
            stall_after_script: false,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Sends the scripted fragments, then reports `error` on the stream.
    pub fn failing_after(mut self, error: ModelError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Sends the scripted fragments, then keeps the stream open until the
    /// receiver goes away.
    pub fn stalling(mut self) -> Self {
        self.stall_after_script = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.with_state(|state| state.calls)
    }

    pub fn last_request(&self) -> Option<StreamRequest> {
        self.with_state(|state| state.last_request.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl ModelDriver for ScriptedModelDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: StreamRequest) -> Result<FragmentStream, ModelError> {
        self.with_state(|state| {
            state.calls += 1;
            state.last_request = Some(request);
        });

        let (tx, rx) = mpsc::channel(self.fragments.len() + 1);
        for fragment in &self.fragments {
            tx.try_send(Ok(fragment.clone()))
                .map_err(|error| ModelError::StreamInterrupted(error.to_string()))?;
        }
        if let Some(error) = &self.failure {
            tx.try_send(Err(error.clone()))
                .map_err(|error| ModelError::StreamInterrupted(error.to_string()))?;
        }
        if self.stall_after_script {
            tokio::spawn(async move { tx.closed().await });
        }

        Ok(rx)
    }
}

/// Streams `/chat/completions` from any OpenAI-compatible backend.
pub struct OpenAiCompatibleDriver {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
}

impl OpenAiCompatibleDriver {
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<SecretString>,
        model: &str,
        timeout_secs: u64,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|error| ModelError::Configuration(error.to_string()))?;

        Ok(Self {
            name: name.to_owned(),
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            model: model.to_owned(),
        })
    }
}

#[async_trait]
impl ModelDriver for OpenAiCompatibleDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: StreamRequest) -> Result<FragmentStream, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
            "max_tokens": request.max_output_units,
            "stream": true,
        });

        debug!(provider = %self.name, model = %self.model, "sending streaming request");

        let mut builder = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response =
            builder.send().await.map_err(|error| ModelError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status = status.as_u16(), "model streaming error");
            return Err(ModelError::Api { status: status.as_u16(), message });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        let _ = tx.send(Err(ModelError::StreamInterrupted(error.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line: String = buffer.drain(..=line_end).collect();
                    match parse_sse_line(&line) {
                        SseLine::Content(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        SseLine::Done => return,
                        SseLine::Skip => {}
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Content(String),
    Done,
    Skip,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Interprets one server-sent-events line from a chat completion stream.
pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    serde_json::from_str::<StreamResponse>(data)
        .ok()
        .and_then(|response| response.choices.into_iter().next())
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map_or(SseLine::Skip, SseLine::Content)
}
