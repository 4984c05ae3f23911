//! Inbound message dispatch: admission, continuation, history and provider
//! failover. Every accepted message runs on its own tracked task.

use crate::commands;
use crate::config::DispatchConfig;
use crate::prompts::SystemPrompts;
use crate::whitelist::Whitelist;
use rc_channels::{InboundMessage, MessageCategory, OutboundMessage};
use rc_context::{ContextEngine, RootId};
use rc_llm::{ChatCompletion, ChatMessage, ProviderRegistry, split_reasoning};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const LOG_PREVIEW_CHARS: usize = 80;

/// First characters of `text`, for log lines.
pub(crate) fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    if text.chars().nth(LOG_PREVIEW_CHARS).is_some() {
        out.push('…');
    }
    out
}

pub struct Dispatcher {
    context: ContextEngine,
    providers: ProviderRegistry,
    completion: Arc<dyn ChatCompletion>,
    whitelist: Arc<Whitelist>,
    prompts: SystemPrompts,
    limiter: Arc<Semaphore>,
    acquire_timeout: Duration,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        context: ContextEngine,
        providers: ProviderRegistry,
        completion: Arc<dyn ChatCompletion>,
        whitelist: Arc<Whitelist>,
        prompts: SystemPrompts,
        limits: &DispatchConfig,
        outbound_tx: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            context,
            providers,
            completion,
            whitelist,
            prompts,
            limiter: Arc::new(Semaphore::new(limits.max_concurrent)),
            acquire_timeout: limits.acquire_timeout(),
            outbound_tx,
            tasks: TaskTracker::new(),
        }
    }

    /// Consume `inbound_rx` until it closes or `shutdown` fires, then wait
    /// for every in-flight message to finish.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbound_rx.recv() => match msg {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            let this = self.clone();
            self.tasks.spawn(async move { this.handle(inbound).await });
        }

        self.tasks.close();
        tracing::info!(in_flight = self.tasks.len(), "dispatcher stopped, draining");
        self.tasks.wait().await;
        tracing::info!("dispatcher drained");
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(message_id = inbound.message_id, user_id = inbound.user_id, group_id = ?inbound.group_id)
    )]
    async fn handle(&self, inbound: InboundMessage) {
        if inbound.is_from_self {
            tracing::debug!("dropping self-authored message");
            return;
        }
        let root = RootId::for_sender(inbound.user_id, inbound.group_id);
        let whitelist = self.whitelist.clone();
        match tokio::task::spawn_blocking(move || whitelist.admits(root)).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(%root, "root not whitelisted");
                return;
            }
            Err(e) => {
                tracing::error!(%root, error = %e, "whitelist task failed");
                return;
            }
        }

        if inbound.category == MessageCategory::Command {
            let whitelist = self.whitelist.clone();
            let (user_id, line) = (inbound.user_id, inbound.text.clone());
            let output = match tokio::task::spawn_blocking(move || {
                commands::handle_command(&whitelist, user_id, &line)
            })
            .await
            {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(error = %e, "command task failed");
                    return;
                }
            };
            tracing::info!(command = %preview(&inbound.text), "command handled");
            self.emit(OutboundMessage::reply_to(&inbound, output).as_command())
                .await;
            return;
        }

        let history = {
            let context = self.context.clone();
            let turn = inbound.clone();
            match tokio::task::spawn_blocking(move || accept_turn(&context, root, &turn)).await {
                Ok(Ok(Some(history))) => history,
                Ok(Ok(None)) => return,
                Ok(Err(e)) => {
                    tracing::warn!(%root, error = %e, "abandoning message: context unavailable");
                    return;
                }
                Err(e) => {
                    tracing::error!(%root, error = %e, "context task failed");
                    return;
                }
            }
        };
        tracing::info!(%root, depth = history.len(), text = %preview(&inbound.text), "turn accepted");

        let prompt = self.prompts.build(root.kind, &inbound.nickname, history);
        match self.complete_with_failover(&prompt).await {
            Some((provider, reply)) => {
                let content = reply.content.trim();
                self.emit(OutboundMessage::reply_to(&inbound, content).with_model_label(provider))
                    .await;
            }
            None => tracing::warn!(%root, "no provider produced a reply; dropping message"),
        }
    }

    /// Try providers in priority order, one limiter permit per attempt.
    /// A reply with nothing left after its reasoning segment counts as a
    /// failure. Returns the answering provider's name and its message.
    async fn complete_with_failover(&self, prompt: &[ChatMessage]) -> Option<(String, ChatMessage)> {
        for provider in self.providers.iter() {
            let permit =
                match tokio::time::timeout(self.acquire_timeout, self.limiter.acquire()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "provider limiter closed");
                        return None;
                    }
                    Err(_) => {
                        tracing::warn!(
                            timeout_ms = self.acquire_timeout.as_millis() as u64,
                            "timed out waiting for a provider slot"
                        );
                        return None;
                    }
                };
            let result = self.completion.complete(provider, prompt).await;
            drop(permit);
            match result {
                Ok(message) if split_reasoning(&message.content).1.trim().is_empty() => {
                    tracing::warn!(provider = %provider.name, "provider answered with reasoning only");
                }
                Ok(message) => return Some((provider.name.clone(), message)),
                Err(e) => tracing::warn!(provider = %provider.name, error = %e, "provider failed"),
            }
        }
        None
    }

    async fn emit(&self, message: OutboundMessage) {
        if let Err(e) = self.outbound_tx.send(message).await {
            tracing::error!(error = %e, "outbound queue closed");
        }
    }
}

/// Applies the continuation rule, stores the user turn and loads its
/// history. `Ok(None)` means the message does not continue anything the
/// bot takes part in.
fn accept_turn(
    context: &ContextEngine,
    root: RootId,
    inbound: &InboundMessage,
) -> rc_context::Result<Option<Vec<ChatMessage>>> {
    let mut reply_to = inbound.reply_to;
    if let Some(parent) = reply_to {
        if !context.is_assistant_reply(root, parent) {
            if !inbound.mentions_bot {
                tracing::debug!(parent, "reply to a non-bot message without mention");
                return Ok(None);
            }
            // Unknown parents start a fresh conversation.
            if context.lookup_node(root.node(parent))?.is_none() {
                reply_to = None;
            }
        }
    }

    context.append_node(
        root,
        inbound.message_id,
        reply_to,
        ChatMessage::user(inbound.text.clone()),
        inbound.received_at,
    )?;
    context
        .load_linear_history(root, inbound.message_id)
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundSender;
    use async_trait::async_trait;
    use chrono::Utc;
    use rc_channels::ChannelAdapter;
    use rc_context::MemoryStore;
    use rc_llm::{LlmError, ProviderConfig};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedCompletion {
        failing: HashSet<String>,
        scripted: HashMap<String, String>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedCompletion {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl ChatCompletion for ScriptedCompletion {
        async fn complete(
            &self,
            provider: &ProviderConfig,
            messages: &[ChatMessage],
        ) -> rc_llm::Result<ChatMessage> {
            self.calls.lock().expect("calls").push(provider.name.clone());
            self.prompts.lock().expect("prompts").push(messages.to_vec());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(&provider.name) {
                return Err(LlmError::Http(format!("{} is down", provider.name)));
            }
            let content = self
                .scripted
                .get(&provider.name)
                .cloned()
                .unwrap_or_else(|| format!("  answer from {}\n", provider.name));
            Ok(ChatMessage::assistant(content))
        }
    }

    /// Accepts every post and numbers it with `assigned`.
    struct NumberingChannel {
        assigned: i32,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl ChannelAdapter for NumberingChannel {
        fn channel_id(&self) -> &str {
            "numbering"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, message: &OutboundMessage) -> anyhow::Result<Option<i32>> {
            self.sent.lock().expect("sent").push(message.clone());
            Ok(Some(self.assigned))
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        outbound_rx: mpsc::Receiver<OutboundMessage>,
        completion: Arc<ScriptedCompletion>,
        context: ContextEngine,
        _dir: tempfile::TempDir,
    }

    fn fixture(providers: &[&str], completion: ScriptedCompletion, limits: DispatchConfig) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("whitelist.json");
        std::fs::write(&path, r#"{"user_ids":[42],"group_ids":[9],"admin":42}"#).expect("whitelist");
        let whitelist = Arc::new(Whitelist::open(path).expect("open"));
        let registry = ProviderRegistry::new(
            providers
                .iter()
                .map(|name| {
                    ProviderConfig::new(*name, format!("https://{name}.test/v1"), "m", vec!["k".to_string()])
                })
                .collect(),
        )
        .expect("registry");
        let context = ContextEngine::new(Arc::new(MemoryStore::new()));
        let completion = Arc::new(completion);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let dispatcher = Arc::new(Dispatcher::new(
            context.clone(),
            registry,
            completion.clone(),
            whitelist,
            SystemPrompts {
                private: vec![ChatMessage::system("be nice")],
                ..SystemPrompts::default()
            },
            &limits,
            outbound_tx,
        ));
        Fixture {
            dispatcher,
            outbound_rx,
            completion,
            context,
            _dir: dir,
        }
    }

    fn message(message_id: i32, text: &str) -> InboundMessage {
        InboundMessage {
            message_id,
            user_id: 42,
            group_id: None,
            nickname: "alice".to_string(),
            reply_to: None,
            text: text.to_string(),
            category: MessageCategory::Chat,
            mentions_bot: false,
            is_from_self: false,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fails_over_to_first_working_provider() {
        let mut fx = fixture(
            &["a", "b", "c"],
            ScriptedCompletion {
                failing: HashSet::from(["a".to_string(), "b".to_string()]),
                ..ScriptedCompletion::default()
            },
            DispatchConfig::default(),
        );
        fx.dispatcher.handle(message(100, "hello")).await;

        let out = fx.outbound_rx.try_recv().expect("one reply");
        assert_eq!(out.content, "answer from c");
        assert_eq!(out.model_label.as_deref(), Some("c"));
        assert_eq!(out.reply_to_message_id, 100);
        assert!(!out.is_command);
        assert!(fx.outbound_rx.try_recv().is_err());
        assert_eq!(fx.completion.calls(), vec!["a", "b", "c"]);

        let prompt = &fx.completion.prompts.lock().expect("prompts")[2];
        let contents: Vec<&str> = prompt.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["be nice", "hello"]);
    }

    #[tokio::test]
    async fn first_success_stops_failover() {
        let mut fx = fixture(&["a", "b"], ScriptedCompletion::default(), DispatchConfig::default());
        fx.dispatcher.handle(message(1, "q")).await;
        assert_eq!(fx.outbound_rx.try_recv().expect("reply").model_label.as_deref(), Some("a"));
        assert_eq!(fx.completion.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn total_failure_is_silent() {
        let mut fx = fixture(
            &["a", "b"],
            ScriptedCompletion {
                failing: HashSet::from(["a".to_string(), "b".to_string()]),
                ..ScriptedCompletion::default()
            },
            DispatchConfig::default(),
        );
        fx.dispatcher.handle(message(1, "q")).await;
        assert!(fx.outbound_rx.try_recv().is_err());
        // the user turn is still on record
        assert!(fx.context.lookup_node(RootId::user(42).node(1)).expect("lookup").is_some());
    }

    #[tokio::test]
    async fn provider_calls_respect_the_limiter() {
        let fx = fixture(
            &["a"],
            ScriptedCompletion {
                delay: Duration::from_millis(50),
                ..ScriptedCompletion::default()
            },
            DispatchConfig {
                max_concurrent: 2,
                ..DispatchConfig::default()
            },
        );
        let Fixture {
            dispatcher,
            mut outbound_rx,
            completion,
            ..
        } = fx;

        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        for id in 0..6 {
            inbound_tx.send(message(id, "q")).await.expect("queue");
        }
        drop(inbound_tx);
        dispatcher.run(inbound_rx, CancellationToken::new()).await;

        let mut replies = 0;
        while outbound_rx.try_recv().is_ok() {
            replies += 1;
        }
        assert_eq!(replies, 6);
        assert!(completion.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(completion.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slot_timeout_aborts_without_trying_others() {
        let mut fx = fixture(
            &["a", "b"],
            ScriptedCompletion::default(),
            DispatchConfig {
                max_concurrent: 1,
                ..DispatchConfig::default()
            },
        );
        let dispatcher = Arc::get_mut(&mut fx.dispatcher).expect("unshared");
        dispatcher.acquire_timeout = Duration::from_millis(20);
        let _held = fx.dispatcher.limiter.clone().try_acquire_owned().expect("permit");

        fx.dispatcher.handle(message(1, "q")).await;
        assert!(fx.outbound_rx.try_recv().is_err());
        assert!(fx.completion.calls().is_empty());
    }

    #[tokio::test]
    async fn unlisted_roots_and_self_messages_are_dropped() {
        let mut fx = fixture(&["a"], ScriptedCompletion::default(), DispatchConfig::default());
        let mut stranger = message(1, "hi");
        stranger.user_id = 7;
        fx.dispatcher.handle(stranger).await;

        let mut unlisted_group = message(2, "hi");
        unlisted_group.group_id = Some(10);
        fx.dispatcher.handle(unlisted_group).await;

        let mut own = message(3, "echo");
        own.is_from_self = true;
        fx.dispatcher.handle(own).await;

        assert!(fx.outbound_rx.try_recv().is_err());
        assert!(fx.completion.calls().is_empty());
    }

    #[tokio::test]
    async fn commands_skip_the_providers() {
        let mut fx = fixture(&["a"], ScriptedCompletion::default(), DispatchConfig::default());
        let mut cmd = message(5, "ch");
        cmd.category = MessageCategory::Command;
        fx.dispatcher.handle(cmd).await;

        let out = fx.outbound_rx.try_recv().expect("command reply");
        assert_eq!(out.content, "1");
        assert!(out.is_command);
        assert!(out.model_label.is_none());
        assert!(fx.completion.calls().is_empty());
        assert!(fx.context.lookup_node(RootId::user(42).node(5)).expect("lookup").is_none());
    }

    #[tokio::test]
    async fn replies_continue_only_bot_turns_or_mentions() {
        let mut fx = fixture(&["a"], ScriptedCompletion::default(), DispatchConfig::default());
        let root = RootId::group(9);
        fx.context
            .append_node(root, 1, None, ChatMessage::user("q1"), Utc::now())
            .expect("q1");
        fx.context
            .append_node(root, 2, Some(1), ChatMessage::assistant("a1"), Utc::now())
            .expect("a1");

        let in_group = |id: i32, reply_to: i32, mentions_bot: bool| {
            let mut m = message(id, "more");
            m.group_id = Some(9);
            m.reply_to = Some(reply_to);
            m.mentions_bot = mentions_bot;
            m
        };

        // reply to another user's message, no mention
        fx.dispatcher.handle(in_group(10, 1, false)).await;
        assert!(fx.outbound_rx.try_recv().is_err());
        assert!(fx.context.lookup_node(root.node(10)).expect("lookup").is_none());

        // reply to the bot continues the chain
        fx.dispatcher.handle(in_group(11, 2, false)).await;
        assert!(fx.outbound_rx.try_recv().is_ok());
        let history = fx.context.load_linear_history(root, 11).expect("history");
        assert_eq!(history.len(), 3);

        // mention while replying to something never stored starts over
        fx.dispatcher.handle(in_group(12, 999, true)).await;
        assert!(fx.outbound_rx.try_recv().is_ok());
        let node = fx.context.lookup_node(root.node(12)).expect("lookup").expect("stored");
        assert!(node.is_root());
    }

    #[tokio::test]
    async fn shutdown_stops_consuming() {
        let fx = fixture(&["a"], ScriptedCompletion::default(), DispatchConfig::default());
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        fx.dispatcher.clone().run(inbound_rx, shutdown).await;
        assert!(inbound_tx.is_closed());
    }

    #[tokio::test]
    async fn reasoning_only_answer_moves_to_next_provider() {
        let mut fx = fixture(
            &["a", "b"],
            ScriptedCompletion {
                scripted: HashMap::from([("a".to_string(), "<think>pondering</think>   ".to_string())]),
                ..ScriptedCompletion::default()
            },
            DispatchConfig::default(),
        );
        fx.dispatcher.handle(message(1, "q")).await;

        let out = fx.outbound_rx.try_recv().expect("reply");
        assert_eq!(out.model_label.as_deref(), Some("b"));
        assert_eq!(out.content, "answer from b");
        assert_eq!(fx.completion.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn conversation_continues_through_a_delivered_reply() {
        let mut fx = fixture(
            &["a"],
            ScriptedCompletion {
                scripted: HashMap::from([("a".to_string(), "hi".to_string())]),
                ..ScriptedCompletion::default()
            },
            DispatchConfig::default(),
        );
        let channel = Arc::new(NumberingChannel {
            assigned: 555,
            sent: Mutex::default(),
        });
        let sender = OutboundSender::new(channel.clone(), fx.context.clone());
        let root = RootId::user(42);

        fx.dispatcher.handle(message(100, "hello")).await;
        let first = fx.outbound_rx.try_recv().expect("first reply");
        assert_eq!(first.reply_to_message_id, 100);
        sender.deliver(first).await;

        let node = fx.context.lookup_node(root.node(555)).expect("lookup").expect("recorded");
        assert_eq!(node.reply_to, Some(100));
        assert_eq!(node.message.content, "hi");

        let mut follow_up = message(101, "how are you");
        follow_up.reply_to = Some(555);
        fx.dispatcher.handle(follow_up).await;
        let second = fx.outbound_rx.try_recv().expect("second reply");
        assert_eq!(second.reply_to_message_id, 101);

        let history: Vec<String> = fx
            .context
            .load_linear_history(root, 101)
            .expect("history")
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(history, vec!["hello", "hi", "how are you"]);
        let prompt = fx.completion.prompts.lock().expect("prompts")[1].clone();
        let contents: Vec<&str> = prompt.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["be nice", "hello", "hi", "how are you"]);
        assert_eq!(channel.sent.lock().expect("sent").len(), 1);
    }

    #[tokio::test]
    async fn whitelist_commands_write_the_file() {
        let mut fx = fixture(&["a"], ScriptedCompletion::default(), DispatchConfig::default());
        let mut cmd = message(6, "wl add user 7");
        cmd.category = MessageCategory::Command;
        fx.dispatcher.handle(cmd).await;
        assert!(fx.outbound_rx.try_recv().expect("command reply").is_command);

        let mut newcomer = message(7, "hi");
        newcomer.user_id = 7;
        fx.dispatcher.handle(newcomer).await;
        assert_eq!(fx.outbound_rx.try_recv().expect("reply").user_id, 7);
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(100);
        assert_eq!(preview(&long).chars().count(), LOG_PREVIEW_CHARS + 1);
    }
}
