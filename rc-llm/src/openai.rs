//! OpenAI-compatible chat completion wire format.

use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Role};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

impl<'a> OpenAiChatRequest<'a> {
    pub(crate) fn new(model: &'a str, messages: &'a [ChatMessage]) -> Self {
        Self {
            model,
            messages,
            stream: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
}

impl TryFrom<OpenAiChatResponse> for ChatMessage {
    type Error = LlmError;

    fn try_from(v: OpenAiChatResponse) -> Result<Self> {
        let choice = v.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("completion response missing choices".to_string())
        })?;
        Ok(ChatMessage {
            role: choice.message.role.unwrap_or(Role::Assistant),
            content: choice.message.content.unwrap_or_default(),
        })
    }
}
