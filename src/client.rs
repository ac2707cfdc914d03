//! Consumer side of the relay: posts a chat turn and folds the relay's SSE
//! frames back into answer text plus the latest `streamData` snapshot.

use crate::aggregate::StreamAggregate;
use crate::chat::ChatRequest;
use crate::encoder::RelayPayload;
use crate::frame::{frames, Frame};
use crate::types::{RelayError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Settled,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Settled | TurnState::Cancelled | TurnState::Failed
        )
    }
}

/// Cloneable cancel handle for one in-flight turn.
#[derive(Debug, Clone, Default)]
pub struct TurnCanceller {
    token: CancellationToken,
}

impl TurnCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    session_cookie: Option<String>,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_cookie: None,
        })
    }

    /// Sends `auth_token=<value>` with every request, for gated relays.
    pub fn with_session_cookie(mut self, value: impl Into<String>) -> Self {
        self.session_cookie = Some(value.into());
        self
    }

    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// Posts the turn. A non-success status becomes `Upstream` with the
    /// relay's `error` field, or a generic message when there is none.
    pub async fn open(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(self.chat_url())
            .header(header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(cookie) = &self.session_cookie {
            builder = builder.header(
                header::COOKIE,
                format!("{}={}", crate::constants::AUTH_COOKIE_NAME, cookie),
            );
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let fallback = format!(
            "Failed to get response: {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or_default()
        );
        let message = match response.json::<serde_json::Value>().await {
            Ok(body) => body
                .get("error")
                .and_then(|e| e.as_str())
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .unwrap_or(fallback),
            Err(_) => fallback,
        };
        Err(RelayError::Upstream(status, message).into())
    }
}

/// What one applied frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStep {
    Updated,
    Skipped,
    Done,
}

/// Result of reading a relay stream to its end or to cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub state: TurnState,
    pub content: String,
    pub stream_data: Option<StreamAggregate>,
    pub frames: usize,
}

#[derive(Debug, Default)]
pub struct StreamConsumer {
    content: String,
    stream_data: Option<StreamAggregate>,
    frames: usize,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn stream_data(&self) -> Option<&StreamAggregate> {
        self.stream_data.as_ref()
    }

    /// Frames that carried a decodable payload.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn apply(&mut self, frame: &Frame) -> ConsumerStep {
        if frame.is_done() {
            return ConsumerStep::Done;
        }
        let payload: RelayPayload = match serde_json::from_str(&frame.data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Skipping malformed relay frame: {}", e);
                return ConsumerStep::Skipped;
            }
        };

        self.frames += 1;
        if let Some(content) = payload.content {
            self.content.push_str(&content);
        }
        // Snapshots are already cumulative; the newest one replaces ours.
        if payload.stream_data.is_some() {
            self.stream_data = payload.stream_data;
        }
        ConsumerStep::Updated
    }

    pub fn into_outcome(self, state: TurnState) -> StreamOutcome {
        StreamOutcome {
            state,
            content: self.content,
            stream_data: self.stream_data,
            frames: self.frames,
        }
    }

    /// Reads `byte_stream` until `[DONE]`, end of body, or cancellation,
    /// calling `on_update` after every applied frame. A transport error is
    /// returned as `MidStream`; a body that ends without `[DONE]` still settles.
    pub async fn consume<S, E, F>(
        mut self,
        byte_stream: S,
        canceller: &TurnCanceller,
        mut on_update: F,
    ) -> Result<StreamOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        F: FnMut(&StreamConsumer),
    {
        let incoming = frames(byte_stream);
        tokio::pin!(incoming);

        loop {
            let next = tokio::select! {
                biased;
                _ = canceller.cancelled() => {
                    tracing::info!("Turn cancelled after {} frames", self.frames);
                    return Ok(self.into_outcome(TurnState::Cancelled));
                }
                next = incoming.next() => next,
            };

            match next {
                None => {
                    tracing::debug!("Relay stream ended without [DONE]");
                    return Ok(self.into_outcome(TurnState::Settled));
                }
                Some(Err(e)) => return Err(RelayError::MidStream(e.to_string()).into()),
                Some(Ok(frame)) => match self.apply(&frame) {
                    ConsumerStep::Done => return Ok(self.into_outcome(TurnState::Settled)),
                    ConsumerStep::Updated => on_update(&self),
                    ConsumerStep::Skipped => {}
                },
            }
        }
    }
}
