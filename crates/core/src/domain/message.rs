use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::context::Channel;
use crate::trace::TraceId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(format!("msg-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundRecord {
    pub id: MessageId,
    pub user_id: String,
    pub channel: Channel,
    pub text: String,
    pub meta: Map<String, Value>,
    pub trace_id: TraceId,
    pub received_at: DateTime<Utc>,
}

/// One streamed fragment delivered to the user's channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub user_id: String,
    pub channel: Channel,
    pub text: String,
    pub trace_id: TraceId,
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
}
