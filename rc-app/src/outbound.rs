//! Single consumer of the outbound queue: posts replies through the channel
//! and records the assistant turn under the id the transport assigned.

use chrono::{DateTime, Utc};
use rc_channels::{ChannelAdapter, OutboundMessage};
use rc_context::{ContextEngine, RootId};
use rc_llm::{ChatMessage, split_reasoning};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Negative id standing in for a reply the transport did not number.
/// Gateway ids are positive, so these never collide with real ones.
pub(crate) fn fallback_message_id(now: DateTime<Utc>) -> i32 {
    let micros = (now.timestamp_micros() & 0x7fff_ffff) as i32;
    -micros.max(1)
}

pub struct OutboundSender {
    channel: Arc<dyn ChannelAdapter>,
    context: ContextEngine,
}

impl OutboundSender {
    pub fn new(channel: Arc<dyn ChannelAdapter>, context: ContextEngine) -> Self {
        Self { channel, context }
    }

    /// Deliver queued messages one at a time until every sender is gone.
    /// On `shutdown`, whatever is already queued is still delivered.
    #[tracing::instrument(level = "info", skip_all, fields(channel = %self.channel.channel_id()))]
    pub async fn run(self, mut rx: mpsc::Receiver<OutboundMessage>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(message) => self.deliver(message).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Ok(message) = rx.try_recv() {
                        self.deliver(message).await;
                    }
                    break;
                }
            }
        }
        tracing::info!("outbound loop stopped");
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(reply_to = message.reply_to_message_id, user_id = message.user_id, group_id = ?message.group_id)
    )]
    pub async fn deliver(&self, message: OutboundMessage) {
        let (reasoning, answer) = split_reasoning(&message.content);
        if let Some(reasoning) = reasoning {
            if self.channel.supports_forward() {
                if let Err(e) = self
                    .channel
                    .send_forward(message.user_id, message.group_id, reasoning)
                    .await
                {
                    tracing::warn!(error = %e, "reasoning forward failed");
                }
            } else {
                tracing::debug!("channel cannot forward; reasoning dropped");
            }
        }

        let reply = OutboundMessage {
            content: answer.to_string(),
            ..message.clone()
        };
        let assigned = match self.channel.send(&reply).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "reply post failed; nothing recorded");
                return;
            }
        };
        if message.is_command {
            return;
        }

        let message_id = assigned.unwrap_or_else(|| {
            let id = fallback_message_id(Utc::now());
            tracing::debug!(fallback_id = id, "transport assigned no id");
            id
        });
        let root = RootId::for_sender(message.user_id, message.group_id);
        let context = self.context.clone();
        let parent = message.reply_to_message_id;
        let recorded = tokio::task::spawn_blocking(move || {
            context.append_node(
                root,
                message_id,
                Some(parent),
                ChatMessage::assistant(reply.content),
                Utc::now(),
            )
        })
        .await;
        match recorded {
            Ok(Ok(())) => tracing::info!(%root, message_id, "reply delivered and recorded"),
            Ok(Err(e)) => tracing::warn!(%root, message_id, error = %e, "reply delivered but not recorded"),
            Err(e) => tracing::error!(%root, error = %e, "record task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rc_channels::InboundMessage;
    use rc_context::MemoryStore;
    use rc_llm::Role;
    use std::sync::Mutex;

    struct FakeChannel {
        assigned: Option<i32>,
        fail_send: bool,
        forward: bool,
        sent: Mutex<Vec<OutboundMessage>>,
        forwarded: Mutex<Vec<String>>,
    }

    impl FakeChannel {
        fn new(assigned: Option<i32>) -> Self {
            Self {
                assigned,
                fail_send: false,
                forward: true,
                sent: Mutex::default(),
                forwarded: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for FakeChannel {
        fn channel_id(&self) -> &str {
            "fake"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, message: &OutboundMessage) -> anyhow::Result<Option<i32>> {
            if self.fail_send {
                return Err(anyhow::anyhow!("gateway down"));
            }
            self.sent.lock().expect("sent").push(message.clone());
            Ok(self.assigned)
        }

        async fn send_forward(&self, _user_id: i64, _group_id: Option<i64>, text: &str) -> anyhow::Result<()> {
            self.forwarded.lock().expect("forwarded").push(text.to_string());
            Ok(())
        }

        fn supports_forward(&self) -> bool {
            self.forward
        }
    }

    fn reply(content: &str) -> OutboundMessage {
        OutboundMessage {
            user_id: 42,
            group_id: None,
            reply_to_message_id: 100,
            content: content.to_string(),
            model_label: Some("primary".to_string()),
            is_command: false,
        }
    }

    fn seeded_context() -> ContextEngine {
        let context = ContextEngine::new(Arc::new(MemoryStore::new()));
        context
            .append_node(RootId::user(42), 100, None, ChatMessage::user("hello"), Utc::now())
            .expect("user turn");
        context
    }

    #[test]
    fn fallback_ids_are_negative() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_000).single().expect("ts");
        let id = fallback_message_id(at);
        assert!(id < 0);
        assert_eq!(id, -((at.timestamp_micros() & 0x7fff_ffff) as i32));
        let epoch = Utc.timestamp_opt(0, 0).single().expect("epoch");
        assert_eq!(fallback_message_id(epoch), -1);
    }

    #[tokio::test]
    async fn reply_is_recorded_under_assigned_id() {
        let channel = Arc::new(FakeChannel::new(Some(555)));
        let context = seeded_context();
        let sender = OutboundSender::new(channel.clone(), context.clone());
        sender.deliver(reply("hi")).await;

        let sent = channel.sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "hi");
        assert_eq!(sent[0].model_label.as_deref(), Some("primary"));

        let root = RootId::user(42);
        assert!(context.is_assistant_reply(root, 555));
        let node = context.lookup_node(root.node(555)).expect("lookup").expect("node");
        assert_eq!(node.reply_to, Some(100));
        context
            .append_node(root, 101, Some(555), ChatMessage::user("how are you"), Utc::now())
            .expect("follow-up");
        let history: Vec<String> = context
            .load_linear_history(root, 101)
            .expect("history")
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(history, vec!["hello", "hi", "how are you"]);
    }

    #[tokio::test]
    async fn reasoning_is_forwarded_and_not_recorded() {
        let channel = Arc::new(FakeChannel::new(Some(7)));
        let context = seeded_context();
        OutboundSender::new(channel.clone(), context.clone())
            .deliver(reply("<think>ponder</think>\n\nthe answer"))
            .await;

        assert_eq!(*channel.forwarded.lock().expect("forwarded"), vec!["ponder"]);
        assert_eq!(channel.sent.lock().expect("sent")[0].content, "the answer");
        let node = context
            .lookup_node(RootId::user(42).node(7))
            .expect("lookup")
            .expect("node");
        assert_eq!(node.message.content, "the answer");
        assert_eq!(node.message.role, Role::Assistant);
    }

    #[tokio::test]
    async fn unassigned_id_falls_back_to_negative() {
        let channel = Arc::new(FakeChannel::new(None));
        let context = seeded_context();
        OutboundSender::new(channel, context.clone())
            .deliver(reply("hi"))
            .await;
        let latest = context.load_latest_history(RootId::user(42)).expect("latest");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].content, "hi");
    }

    #[tokio::test]
    async fn commands_and_failed_posts_are_not_recorded() {
        let context = seeded_context();
        let channel = Arc::new(FakeChannel::new(Some(8)));
        let mut command = reply("1");
        command.is_command = true;
        OutboundSender::new(channel.clone(), context.clone())
            .deliver(command)
            .await;
        assert_eq!(channel.sent.lock().expect("sent").len(), 1);
        assert!(context.lookup_node(RootId::user(42).node(8)).expect("lookup").is_none());

        let broken = Arc::new(FakeChannel {
            fail_send: true,
            ..FakeChannel::new(Some(9))
        });
        OutboundSender::new(broken, context.clone())
            .deliver(reply("lost"))
            .await;
        assert!(context.lookup_node(RootId::user(42).node(9)).expect("lookup").is_none());
    }

    #[tokio::test]
    async fn run_drains_queue_on_shutdown() {
        let channel = Arc::new(FakeChannel::new(Some(1)));
        let (tx, rx) = mpsc::channel(8);
        tx.send(reply("a")).await.expect("a");
        tx.send(reply("b")).await.expect("b");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        OutboundSender::new(channel.clone(), seeded_context())
            .run(rx, shutdown)
            .await;
        assert_eq!(channel.sent.lock().expect("sent").len(), 2);
        assert!(tx.is_closed());
    }
}
