//! Per-conversation-kind system prompts, loaded once at startup.

use crate::config::{PromptsConfig, expand_home};
use anyhow::Context;
use rc_context::RootKind;
use rc_llm::ChatMessage;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct SystemPrompts {
    pub private: Vec<ChatMessage>,
    pub group: Vec<ChatMessage>,
    pub include_nickname: bool,
}

impl SystemPrompts {
    pub fn load(cfg: &PromptsConfig) -> anyhow::Result<Self> {
        let load = |path: &Option<String>| -> anyhow::Result<Vec<ChatMessage>> {
            match path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
                Some(path) => load_prompt_file(&expand_home(path)?),
                None => Ok(Vec::new()),
            }
        };
        Ok(Self {
            private: load(&cfg.private).context("private prompt")?,
            group: load(&cfg.group).context("group prompt")?,
            include_nickname: cfg.include_nickname,
        })
    }

    pub fn for_root(&self, kind: RootKind) -> &[ChatMessage] {
        match kind {
            RootKind::User => &self.private,
            RootKind::Group => &self.group,
        }
    }

    /// System messages, an optional line naming the asker, then `history`.
    pub fn build(&self, kind: RootKind, nickname: &str, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let system = self.for_root(kind);
        let mut prompt = Vec::with_capacity(system.len() + history.len() + 1);
        prompt.extend_from_slice(system);
        if self.include_nickname && !nickname.trim().is_empty() {
            prompt.push(ChatMessage::system(format!(
                "The user talking to you is {}",
                nickname.trim()
            )));
        }
        prompt.extend(history);
        prompt
    }
}

fn load_prompt_file(path: &Path) -> anyhow::Result<Vec<ChatMessage>> {
    let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}
