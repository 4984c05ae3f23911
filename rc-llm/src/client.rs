use crate::error::{LlmError, Result};
use crate::openai::{OpenAiChatRequest, OpenAiChatResponse};
use crate::provider::ProviderConfig;
use crate::reasoning::append_think_marker;
use crate::types::ChatMessage;
use async_trait::async_trait;
use std::time::Duration;

/// Issues one non-streaming completion against one provider.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<ChatMessage>;
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { http }
    }
}

#[async_trait]
impl ChatCompletion for LlmClient {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(provider = %provider.name, model = %provider.model)
    )]
    async fn complete(
        &self,
        provider: &ProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<ChatMessage> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("prompt is empty".to_string()));
        }
        let mut messages = messages.to_vec();
        if provider.reasoning {
            append_think_marker(&mut messages);
        }

        let api_key = provider.next_key()?;
        let req = OpenAiChatRequest::new(&provider.model, &messages);
        let response = self
            .http
            .post(&provider.url)
            .bearer_auth(api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: provider.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        let message = ChatMessage::try_from(parsed)?;
        if message.content.trim().is_empty() {
            return Err(LlmError::EmptyCompletion(provider.name.clone()));
        }
        tracing::debug!(
            prompt_messages = messages.len(),
            content_len = message.content.len(),
            "completion received"
        );
        Ok(message)
    }
}
