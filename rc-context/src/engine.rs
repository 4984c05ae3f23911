use crate::error::{ContextError, Result};
use crate::forest::{DialogForest, ForestFilter};
use crate::key::{NodeKey, RootId};
use crate::node::ConversationNode;
use crate::store::ConversationStore;
use chrono::{DateTime, Utc};
use rc_llm::{ChatMessage, Role};
use std::collections::HashSet;
use std::sync::Arc;

/// Reads and writes reply-chain addressed conversation records.
#[derive(Clone)]
pub struct ContextEngine {
    store: Arc<dyn ConversationStore>,
}

impl ContextEngine {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(root = %root, message_id = message_id, reply_to = ?reply_to))]
    pub fn append_node(
        &self,
        root: RootId,
        message_id: i32,
        reply_to: Option<i32>,
        message: ChatMessage,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let key = root.node(message_id);
        let node = ConversationNode::new(reply_to, message, timestamp);
        self.store.put(&key.to_bytes(), &node.encode()?)?;
        tracing::debug!(%key, role = %node.message.role, "node appended");
        Ok(())
    }

    /// Decoded node at `key`, `None` when absent.
    pub fn lookup_node(&self, key: NodeKey) -> Result<Option<ConversationNode>> {
        match self.store.get(&key.to_bytes())? {
            Some(raw) => ConversationNode::decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Root-to-leaf messages ending at `message_id`.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %root, message_id = message_id))]
    pub fn load_linear_history(&self, root: RootId, message_id: i32) -> Result<Vec<ChatMessage>> {
        let mut reversed = Vec::new();
        let mut visited = HashSet::new();
        let mut current = root.node(message_id);
        let mut referenced_by = None;

        loop {
            if !visited.insert(current.message_id) {
                return Err(ContextError::ChainCycle(current));
            }
            let node = self
                .lookup_node(current)?
                .ok_or(ContextError::ChainBroken {
                    missing: current,
                    referenced_by,
                })?;
            let parent = node.reply_to;
            reversed.push(node.message);
            match parent {
                Some(parent) => {
                    referenced_by = Some(current);
                    current = current.sibling(parent);
                }
                None => break,
            }
        }

        reversed.reverse();
        Ok(reversed)
    }

    /// History of the most recently written branch under `root`.
    #[tracing::instrument(level = "debug", skip_all, fields(root = %root))]
    pub fn load_latest_history(&self, root: RootId) -> Result<Vec<ChatMessage>> {
        let mut latest: Option<(NodeKey, DateTime<Utc>)> = None;
        for (raw_key, raw_value) in self.store.scan_prefix(&root.prefix())? {
            let key = match NodeKey::parse(&raw_key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unparsable key");
                    continue;
                }
            };
            let node = match ConversationNode::decode(key, &raw_value) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping corrupt record");
                    continue;
                }
            };
            if latest.is_none_or(|(_, ts)| node.timestamp > ts) {
                latest = Some((key, node.timestamp));
            }
        }

        let (key, _) = latest.ok_or_else(|| ContextError::NoHistory(root.to_string()))?;
        self.load_linear_history(root, key.message_id)
    }

    /// Whether the message at `(root, message_id)` was written by the bot.
    pub fn is_assistant_reply(&self, root: RootId, message_id: i32) -> bool {
        match self.lookup_node(root.node(message_id)) {
            Ok(Some(node)) => node.message.role == Role::Assistant,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(root = %root, message_id, error = %e, "assistant lookup failed");
                false
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn build_dialog_forest(&self, filter: &ForestFilter) -> Result<DialogForest> {
        let entries = match filter {
            ForestFilter::Only(root) => self.store.scan_prefix(&root.prefix())?,
            _ => self.store.scan_all()?,
        };
        Ok(DialogForest::from_entries(entries, filter))
    }
}
