//! Answer generation over an OpenAI-compatible chat completions endpoint.

use crate::config::GenerationConfig;
use crate::error::{status_fault, transport_fault, Fault, PipelineError};
use crate::models::{ChatRole, ChatTurn};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ANSWER_SYSTEM_PROMPT: &str = "Answer the user's questions based on the below context:\n\n";
const REWRITE_INSTRUCTION: &str = "Given the above conversation, generate a search query to look up in order to get information relevant to the conversation. Respond with the query only.";

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Answers `question` from `context`. Never returns an empty answer.
    async fn generate(
        &self,
        context: &str,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError>;

    /// Turns a follow-up question into a standalone search query.
    async fn rewrite_query(
        &self,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError>;
}

#[async_trait]
impl<T: AnswerGenerator + ?Sized> AnswerGenerator for Arc<T> {
    async fn generate(
        &self,
        context: &str,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError> {
        (**self).generate(context, question, history).await
    }

    async fn rewrite_query(
        &self,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError> {
        (**self).rewrite_query(question, history).await
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

fn history_messages(history: &[ChatTurn]) -> impl Iterator<Item = ChatMessage> + '_ {
    history.iter().map(|turn| {
        let role = match turn.role {
            ChatRole::Human => "user",
            ChatRole::Ai => "assistant",
        };
        ChatMessage::new(role, turn.text.clone())
    })
}

pub fn answer_messages(context: &str, question: &str, history: &[ChatTurn]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new(
        "system",
        format!("{ANSWER_SYSTEM_PROMPT}{context}"),
    )];
    messages.extend(history_messages(history));
    messages.push(ChatMessage::new("user", question));
    messages
}

pub fn rewrite_messages(question: &str, history: &[ChatTurn]) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = history_messages(history).collect();
    messages.push(ChatMessage::new("user", question));
    messages.push(ChatMessage::new("user", REWRITE_INSTRUCTION));
    messages
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

pub struct ChatCompletionsGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &GenerationConfig, api_key: impl Into<String>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| PipelineError::generation("", Fault::Unavailable, error.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, PipelineError> {
        debug!(model = %self.model, messages = messages.len(), "requesting completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
                temperature: self.temperature,
                max_tokens: self.max_output_tokens,
            })
            .send()
            .await
            .map_err(|error| {
                PipelineError::generation("", transport_fault(&error), error.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::generation(
                "",
                status_fault(status),
                format!("completion endpoint returned {status}: {body}"),
            ));
        }

        let payload: Value = response.json().await.map_err(|error| {
            PipelineError::generation("", Fault::Malformed, format!("invalid json: {error}"))
        })?;

        completion_text(&payload)
    }
}

/// Pulls `choices[0].message.content`, rejecting missing or blank answers.
pub fn completion_text(payload: &Value) -> Result<String, PipelineError> {
    let content = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            PipelineError::generation("", Fault::Malformed, "response has no answer field")
        })?
        .trim();

    if content.is_empty() {
        return Err(PipelineError::generation(
            "",
            Fault::Malformed,
            "response answer is empty",
        ));
    }

    Ok(content.to_string())
}

#[async_trait]
impl AnswerGenerator for ChatCompletionsGenerator {
    async fn generate(
        &self,
        context: &str,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError> {
        self.complete(&answer_messages(context, question, history))
            .await
    }

    async fn rewrite_query(
        &self,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError> {
        self.complete(&rewrite_messages(question, history)).await
    }
}
