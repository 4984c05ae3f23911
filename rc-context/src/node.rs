use crate::error::{ContextError, Result};
use crate::key::NodeKey;
use chrono::{DateTime, Utc};
use rc_llm::ChatMessage;
use serde::{Deserialize, Serialize};

/// Value stored under a [`NodeKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i32>,
    pub message: ChatMessage,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

impl ConversationNode {
    pub fn new(reply_to: Option<i32>, message: ChatMessage, timestamp: DateTime<Utc>) -> Self {
        Self {
            reply_to,
            message,
            timestamp,
        }
    }

    pub fn is_root(&self) -> bool {
        self.reply_to.is_none()
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ContextError::Storage(format!("encode node: {e}")))
    }

    pub(crate) fn decode(key: NodeKey, raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|source| ContextError::Corrupt { key, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RootId;
    use chrono::TimeZone;

    #[test]
    fn root_node_omits_reply_to() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("ts");
        let node = ConversationNode::new(None, ChatMessage::user("hello"), ts);
        let json: serde_json::Value =
            serde_json::from_slice(&node.encode().expect("encode")).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "message": { "role": "user", "content": "hello" },
                "timestamp": "2024-05-01T12:00:00Z",
            })
        );
    }

    #[test]
    fn decode_reports_the_offending_key() {
        let key = RootId::user(1).node(2);
        let err = ConversationNode::decode(key, b"{not json").expect_err("corrupt");
        assert!(matches!(err, ContextError::Corrupt { key: k, .. } if k == key));
    }
}
