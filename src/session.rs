//! A chat conversation on the consumer side. Owns the message list and runs
//! turns through [`RelayClient`] and [`StreamConsumer`], reporting every list
//! change to a [`MessageSink`].
//!
//! Every operation that runs a turn takes `&mut self`, so two turns can never
//! overlap on one session. Callers sharing a session serialize through a mutex.

use crate::chat::{ChatMessage, ChatRequest, ChatSettings, Role};
use crate::client::{RelayClient, StreamConsumer, TurnCanceller, TurnState};
use crate::str_utils;
use crate::types::{RelayError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Receives the full message list after every change.
pub trait MessageSink: Send {
    fn messages_changed(
        &mut self,
        messages: &[ChatMessage],
    ) -> impl Future<Output = Result<()>> + Send;
}

impl MessageSink for () {
    async fn messages_changed(&mut self, _messages: &[ChatMessage]) -> Result<()> {
        Ok(())
    }
}

pub struct ChatSession<S> {
    client: RelayClient,
    sink: S,
    messages: Vec<ChatMessage>,
    settings: ChatSettings,
    streaming: watch::Sender<Option<ChatMessage>>,
    state: watch::Sender<TurnState>,
    canceller: Arc<Mutex<TurnCanceller>>,
}

impl<S: MessageSink> ChatSession<S> {
    pub fn new(
        client: RelayClient,
        settings: ChatSettings,
        initial_messages: Vec<ChatMessage>,
        sink: S,
    ) -> Self {
        let (streaming, _) = watch::channel(None);
        let (state, _) = watch::channel(TurnState::Idle);
        Self {
            client,
            sink,
            messages: initial_messages,
            settings,
            streaming,
            state,
            canceller: Arc::new(Mutex::new(TurnCanceller::new())),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: ChatSettings) {
        self.settings = settings;
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn turn_state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// The in-progress assistant message, `None` between turns.
    pub fn subscribe_streaming(&self) -> watch::Receiver<Option<ChatMessage>> {
        self.streaming.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// Handle that cancels the next (or current) turn. Take it before starting
    /// the turn; a fresh one is minted after each turn ends.
    pub fn canceller(&self) -> TurnCanceller {
        match self.canceller.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn send_message(&mut self, text: &str) -> Result<TurnState> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RelayError::Validation("Message is empty".to_string()).into());
        }

        let before = self.messages.clone();
        self.messages.push(ChatMessage::user(text));
        self.notify().await;
        self.run_turn(before).await
    }

    /// Drops the last user message and everything after it, then sends that
    /// text again.
    pub async fn regenerate_last_message(&mut self) -> Result<TurnState> {
        if self.messages.len() < 2 {
            return Ok(self.turn_state());
        }
        let Some(idx) = self.messages.iter().rposition(|m| m.role == Role::User) else {
            return Ok(self.turn_state());
        };
        let text = self.messages[idx].content.clone();
        self.messages.truncate(idx);
        self.send_message(&text).await
    }

    /// Rewrites a user message, discards everything after it and asks again.
    pub async fn edit_message(&mut self, id: &str, text: &str) -> Result<TurnState> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RelayError::Validation("Message is empty".to_string()).into());
        }
        let Some(idx) = self.messages.iter().position(|m| m.id == id) else {
            return Err(RelayError::Validation(format!("No message with id {}", id)).into());
        };
        if self.messages[idx].role != Role::User {
            return Err(
                RelayError::Validation("Only user messages can be edited".to_string()).into(),
            );
        }

        let before = self.messages.clone();
        self.messages.truncate(idx + 1);
        self.messages[idx].content = text.to_string();
        self.notify().await;
        self.run_turn(before).await
    }

    pub async fn clear_messages(&mut self) {
        self.messages.clear();
        self.streaming.send_replace(None);
        self.state.send_replace(TurnState::Idle);
        self.notify().await;
    }

    async fn run_turn(&mut self, rollback: Vec<ChatMessage>) -> Result<TurnState> {
        let canceller = self.canceller();
        let result = self.drive_turn(&canceller, rollback).await;

        self.streaming.send_replace(None);
        if let Ok(mut guard) = self.canceller.lock() {
            *guard = TurnCanceller::new();
        }

        let state = match &result {
            Ok(state) => *state,
            Err(_) => TurnState::Failed,
        };
        self.state.send_replace(state);
        result
    }

    async fn drive_turn(
        &mut self,
        canceller: &TurnCanceller,
        rollback: Vec<ChatMessage>,
    ) -> Result<TurnState> {
        self.state.send_replace(TurnState::Sending);
        let request = ChatRequest::new(&self.messages, &self.settings);

        let opened = tokio::select! {
            biased;
            _ = canceller.cancelled() => None,
            r = self.client.open(&request) => Some(r),
        };
        let response = match opened {
            None => return Ok(TurnState::Cancelled),
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                tracing::error!("Chat turn failed before streaming: {}", e);
                self.restore(rollback).await;
                return Err(e);
            }
        };

        let assistant_id = ChatMessage::new_id();
        let streaming = self.streaming.clone();
        let state = self.state.clone();
        let outcome = StreamConsumer::new()
            .consume(response.bytes_stream(), canceller, |consumer| {
                state.send_if_modified(|s| {
                    if *s == TurnState::Streaming {
                        false
                    } else {
                        *s = TurnState::Streaming;
                        true
                    }
                });
                let mut partial = ChatMessage::assistant(
                    assistant_id.as_str(),
                    consumer.content(),
                    consumer.stream_data().cloned(),
                );
                partial.is_streaming = true;
                streaming.send_replace(Some(partial));
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Chat turn failed mid-stream: {}", e);
                self.restore(rollback).await;
                return Err(e);
            }
        };

        if outcome.state == TurnState::Cancelled {
            if outcome.frames > 0 {
                self.messages.push(ChatMessage::assistant(
                    assistant_id,
                    outcome.content,
                    outcome.stream_data,
                ));
                self.notify().await;
            }
            return Ok(TurnState::Cancelled);
        }

        if outcome.content.trim().is_empty() {
            tracing::warn!("Relay returned an empty response; discarding the turn");
            self.restore(rollback).await;
            return Err(RelayError::EmptyResponse.into());
        }

        self.messages.push(ChatMessage::assistant(
            assistant_id,
            outcome.content,
            outcome.stream_data,
        ));
        self.notify().await;
        Ok(TurnState::Settled)
    }

    async fn restore(&mut self, rollback: Vec<ChatMessage>) {
        self.messages = rollback;
        self.notify().await;
    }

    async fn notify(&mut self) {
        if let Err(e) = self.sink.messages_changed(&self.messages).await {
            tracing::warn!("Failed to persist chat messages: {}", e);
        }
    }
}

/// Writes an answer out incrementally as it streams.
///
/// The streaming channel only keeps the latest snapshot, so a follower can
/// miss the last few updates before the session clears it. Once the turn is
/// over, hand the saved answer to [`AnswerEcho::finish`] to write whatever the
/// stream did not deliver.
#[derive(Debug, Default)]
pub struct AnswerEcho {
    written: usize,
}

impl AnswerEcho {
    pub fn new() -> Self {
        Self::default()
    }

    /// Characters written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// The part of `content` not written yet; counts it as written.
    pub fn advance<'a>(&mut self, content: &'a str) -> &'a str {
        let fresh = str_utils::skip_chars(content, self.written);
        self.written += str_utils::char_len(fresh);
        fresh
    }

    /// Follows the streaming channel until its session is dropped.
    pub async fn follow<F>(
        mut self,
        mut streaming: watch::Receiver<Option<ChatMessage>>,
        mut write: F,
    ) -> Self
    where
        F: FnMut(&str),
    {
        while streaming.changed().await.is_ok() {
            let next = streaming
                .borrow_and_update()
                .as_ref()
                .map(|m| m.content.clone());
            if let Some(content) = next {
                let fresh = self.advance(&content);
                if !fresh.is_empty() {
                    write(fresh);
                }
            }
        }
        self
    }

    /// Writes the tail of the saved answer the stream never delivered.
    pub fn finish<F>(mut self, saved: &str, mut write: F)
    where
        F: FnMut(&str),
    {
        let tail = self.advance(saved);
        if !tail.is_empty() {
            write(tail);
        }
    }
}

/// The answer a finished turn left at the end of the list, if any.
pub fn settled_answer(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .last()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
}
