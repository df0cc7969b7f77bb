//! Scripted model implementation for testing.
//!
//! Returns predefined chat turns and completions in order, recording every
//! request so tests can assert on what the runtime actually sent.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::usage::TokenUsage;

use super::{ChatOptions, ChatResponse, CompletionOptions, CompletionResponse, LanguageModel};

/// A recorded chat request.
#[derive(Debug, Clone)]
pub struct RecordedChat {
    /// The messages sent to the model.
    pub messages: Vec<Message>,
    /// Names of the tools offered.
    pub tool_names: Vec<String>,
    /// The temperature requested, if any.
    pub temperature: Option<f32>,
}

/// A scripted mock model.
///
/// Chat turns are consumed front to back; once the script is exhausted the
/// model answers with a plain "Done." turn so loops always terminate.
/// Completions behave the same way with their own script.
#[derive(Debug, Default)]
pub struct MockModel {
    model_id: String,
    turns: Mutex<VecDeque<ChatResponse>>,
    completions: Mutex<VecDeque<String>>,
    chats: Mutex<Vec<RecordedChat>>,
    failures: Mutex<VecDeque<String>>,
}

impl MockModel {
    /// Create an empty mock model.
    #[must_use]
    pub fn new() -> Self {
        Self {
            model_id: "mock-model".to_string(),
            ..Self::default()
        }
    }

    /// Use a custom model identifier.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Append a scripted chat turn.
    #[must_use]
    pub fn with_turn(self, turn: ChatResponse) -> Self {
        self.turns.lock().expect("mock poisoned").push_back(turn);
        self
    }

    /// Append a scripted completion.
    #[must_use]
    pub fn with_completion(self, text: impl Into<String>) -> Self {
        self.completions
            .lock()
            .expect("mock poisoned")
            .push_back(text.into());
        self
    }

    /// Queue a model transport error for the next call; chain to fail
    /// several consecutive calls.
    #[must_use]
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.failures
            .lock()
            .expect("mock poisoned")
            .push_back(message.into());
        self
    }

    /// All chat requests seen so far.
    #[must_use]
    pub fn recorded_chats(&self) -> Vec<RecordedChat> {
        self.chats.lock().expect("mock poisoned").clone()
    }

    /// Number of chat calls made.
    #[must_use]
    pub fn chat_count(&self) -> usize {
        self.chats.lock().expect("mock poisoned").len()
    }

    fn take_failure(&self) -> Option<String> {
        self.failures.lock().expect("mock poisoned").pop_front()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn id(&self) -> &str {
        &self.model_id
    }

    async fn complete(
        &self,
        _prompt: &str,
        _options: CompletionOptions,
    ) -> Result<CompletionResponse> {
        if let Some(message) = self.take_failure() {
            return Err(Error::model(message));
        }
        let content = self
            .completions
            .lock()
            .expect("mock poisoned")
            .pop_front()
            .unwrap_or_else(|| "Done.".to_string());
        Ok(CompletionResponse {
            usage: TokenUsage::new(content.len() as u64 / 4, content.len() as u64 / 4),
            content,
        })
    }

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        options: ChatOptions,
    ) -> Result<ChatResponse> {
        self.chats.lock().expect("mock poisoned").push(RecordedChat {
            messages: messages.to_vec(),
            tool_names: options.tools.iter().map(|t| t.name.clone()).collect(),
            temperature: options.temperature,
        });

        if let Some(message) = self.take_failure() {
            return Err(Error::model(message));
        }

        let turn = self
            .turns
            .lock()
            .expect("mock poisoned")
            .pop_front()
            .unwrap_or_else(|| ChatResponse::text("Done.").with_usage(TokenUsage::new(10, 2)));
        Ok(turn)
    }
}
