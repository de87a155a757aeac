use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_LOCALE: &str = "en";
pub const DEFAULT_POLICY_BUNDLE: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Web,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Web => "web",
            Self::Email => "email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sms" => Some(Self::Sms),
            "web" => Some(Self::Web),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

/// One user message entering the system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub channel: Channel,
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Inbound {
    pub fn new(channel: Channel, user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { channel, user_id: user_id.into(), text: text.into(), meta: Map::new() }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentFlags {
    pub emergency: bool,
    pub marketing: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptEntry {
    pub field_id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssessmentPointer {
    pub definition_id: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisFlags {
    pub active: bool,
    #[serde(default)]
    pub terms: Vec<String>,
}

/// Everything known about a user that a turn may read or update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HydratedContext {
    pub user_id: String,
    pub session_id: String,
    pub locale: String,
    pub policy_bundle: String,
    #[serde(default)]
    pub consent: ConsentFlags,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub prompt_history: Vec<PromptEntry>,
    #[serde(default)]
    pub last_assessment: Option<AssessmentPointer>,
    #[serde(default)]
    pub crisis_flags: Option<CrisisFlags>,
}

impl HydratedContext {
    /// The safe default used when nothing is stored for the user or the store
    /// cannot be read: no consent, no crisis state, default bundle.
    pub fn fallback(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            session_id: format!("session-{user_id}"),
            user_id,
            locale: DEFAULT_LOCALE.to_owned(),
            policy_bundle: DEFAULT_POLICY_BUNDLE.to_owned(),
            consent: ConsentFlags::default(),
            metadata: Map::new(),
            prompt_history: Vec::new(),
            last_assessment: None,
            crisis_flags: None,
        }
    }

    pub fn crisis_active(&self) -> bool {
        self.crisis_flags.as_ref().is_some_and(|flags| flags.active)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}
