use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "onebot".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Post a reply. Returns the transport-assigned message id, or `None`
    /// when the transport accepted the post without assigning one.
    async fn send(&self, message: &OutboundMessage) -> Result<Option<i32>>;

    /// Deliver `text` folded into a forwarded-message card addressed to the
    /// same conversation as a reply to `user_id` / `group_id`.
    async fn send_forward(&self, _user_id: i64, _group_id: Option<i64>, _text: &str) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_forward is not supported by this channel"
        ))
    }

    fn supports_forward(&self) -> bool {
        false
    }
}
