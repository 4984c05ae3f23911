use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    Chat,
    /// Text started with `/`; `text` holds the command line without it.
    Command,
    /// A shared card whose prompt and link were extracted into `text`.
    Share,
}

/// A gateway message event that survived edge filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: i32,
    pub user_id: i64,
    pub group_id: Option<i64>,
    pub nickname: String,
    pub reply_to: Option<i32>,
    pub text: String,
    pub category: MessageCategory,
    pub mentions_bot: bool,
    pub is_from_self: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub user_id: i64,
    pub group_id: Option<i64>,
    /// The user message this answers; also the parent of the recorded reply.
    pub reply_to_message_id: i32,
    pub content: String,
    #[serde(default)]
    pub model_label: Option<String>,
    /// Command output is delivered but never persisted.
    #[serde(default)]
    pub is_command: bool,
}

impl OutboundMessage {
    pub fn reply_to(inbound: &InboundMessage, content: impl Into<String>) -> Self {
        Self {
            user_id: inbound.user_id,
            group_id: inbound.group_id,
            reply_to_message_id: inbound.message_id,
            content: content.into(),
            model_label: None,
            is_command: false,
        }
    }

    pub fn with_model_label(mut self, label: impl Into<String>) -> Self {
        self.model_label = Some(label.into());
        self
    }

    pub fn as_command(mut self) -> Self {
        self.is_command = true;
        self
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}
