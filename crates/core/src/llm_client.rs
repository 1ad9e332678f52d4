use crate::context::ContextSnapshot;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// A one-shot text completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextCompleter: Send + Sync {
    /// Completes `prompt`. Never fails; errors and timeouts yield an empty string.
    async fn complete(&self, prompt: &str) -> String;
}

/// An implementation of `TextCompleter` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions.
    /// * `timeout` - Upper bound on one completion round trip.
    pub fn new(config: OpenAIConfig, model: String, timeout: Duration) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            timeout,
        }
    }

    async fn try_complete(&self, prompt: &str) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content("You are a patient, concise chess coach.")
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt.to_string())
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .context("Text completion timed out")??;

        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .clone()
            .context("No content in LLM response")?;
        Ok(answer)
    }
}

#[async_trait]
impl TextCompleter for OpenAICompatibleClient {
    async fn complete(&self, prompt: &str) -> String {
        self.try_complete(prompt).await.unwrap_or_else(|e| {
            warn!(error = %e, "Text completion failed; returning empty text");
            String::new()
        })
    }
}

/// Asks the coach a free-form question about the current game.
pub async fn ask_coach(
    completer: &dyn TextCompleter,
    ctx: &ContextSnapshot,
    question: &str,
) -> String {
    let mut prompt = format!(
        "{} is playing {} in a chess game.",
        ctx.participant_name, ctx.side
    );
    if !ctx.position.is_empty() {
        prompt.push_str(&format!(" The current position (FEN) is {}.", ctx.position));
    }
    prompt.push_str(&format!(
        " They ask: \"{}\". Answer in at most three sentences.",
        question.trim()
    ));
    completer.complete(&prompt).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Side;

    #[tokio::test]
    async fn test_ask_coach_builds_prompt_from_context() {
        let mut completer = MockTextCompleter::new();
        completer
            .expect_complete()
            .withf(|prompt| {
                let prompt = prompt.to_string();
                prompt.starts_with("Ana is playing Black in a chess game.")
                    && prompt.contains("The current position (FEN) is 8/8/8/8/8/8/8/K6k w - - 0 1.")
                    && prompt.contains("They ask: \"Is this a draw?\"")
            })
            .times(1)
            .returning(|_| "Yes, insufficient material.".to_string());

        let ctx = ContextSnapshot::new("8/8/8/8/8/8/8/K6k w - - 0 1", Side::Black, "Ana");
        let answer = ask_coach(&completer, &ctx, "  Is this a draw? ").await;
        assert_eq!(answer, "Yes, insufficient material.");
    }

    #[tokio::test]
    async fn test_ask_coach_without_position() {
        let mut completer = MockTextCompleter::new();
        completer
            .expect_complete()
            .withf(|prompt| !prompt.to_string().contains("FEN"))
            .returning(|_| String::new());

        let answer = ask_coach(&completer, &ContextSnapshot::default(), "hi").await;
        assert!(answer.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_back_to_empty() {
        let config = OpenAIConfig::new()
            .with_api_key("test-key")
            .with_api_base("http://127.0.0.1:9/v1");
        let client =
            OpenAICompatibleClient::new(config, "test-model".into(), Duration::from_millis(500));
        assert_eq!(client.complete("hello").await, "");
    }
}
