//! Client-facing SSE frames. Every frame is `data: <json>\n\n`; the stream always
//! closes with a literal `data: [DONE]\n\n`.

use crate::aggregate::StreamAggregate;
use crate::constants::{ANSWER_CHUNK_CHARS, DONE_MARKER};
use crate::reducer::{error_annotation, Emission};
use crate::str_utils;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_data: Option<&'a StreamAggregate>,
    #[serde(rename = "final", skip_serializing_if = "std::ops::Not::not")]
    is_final: bool,
}

/// Owned form of an outbound payload, as the client reads it back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_data: Option<StreamAggregate>,
    #[serde(default, rename = "final", skip_serializing_if = "std::ops::Not::not")]
    pub is_final: bool,
}

/// The `data` field of one outbound SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame(String);

impl OutboundFrame {
    pub fn done() -> Self {
        Self(DONE_MARKER.to_string())
    }

    pub fn data(&self) -> &str {
        &self.0
    }

    pub fn is_done(&self) -> bool {
        self.0 == DONE_MARKER
    }

    pub fn to_wire(&self) -> String {
        format!("data: {}\n\n", self.0)
    }

    pub fn into_event(self) -> axum::response::sse::Event {
        axum::response::sse::Event::default().data(self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayEncoder {
    chunk_chars: usize,
}

impl Default for RelayEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayEncoder {
    pub fn new() -> Self {
        Self {
            chunk_chars: ANSWER_CHUNK_CHARS,
        }
    }

    pub fn with_chunk_chars(chunk_chars: usize) -> Self {
        Self { chunk_chars }
    }

    pub fn encode(&self, emission: &Emission, aggregate: &StreamAggregate) -> Vec<OutboundFrame> {
        match emission {
            Emission::Nothing => Vec::new(),
            Emission::Snapshot => frame(PayloadRef {
                content: None,
                stream_data: Some(aggregate),
                is_final: false,
            })
            .into_iter()
            .collect(),
            Emission::Thinking(text) => frame(PayloadRef {
                content: Some(text),
                stream_data: Some(aggregate),
                is_final: false,
            })
            .into_iter()
            .collect(),
            Emission::Answer(delta) => str_utils::chunk_chars(delta, self.chunk_chars)
                .into_iter()
                .filter_map(content_frame)
                .collect(),
            Emission::Annotation(text) => content_frame(text).into_iter().collect(),
        }
    }

    /// Frames for a normal end of stream: the final snapshot (only when some log
    /// has entries) followed by `[DONE]`.
    pub fn finish(&self, aggregate: &StreamAggregate) -> Vec<OutboundFrame> {
        let mut out = Vec::with_capacity(2);
        if aggregate.has_activity() {
            out.extend(frame(PayloadRef {
                content: None,
                stream_data: Some(aggregate),
                is_final: true,
            }));
        }
        out.push(OutboundFrame::done());
        out
    }

    /// Frames for a failure after the stream opened: an in-band note, then `[DONE]`.
    pub fn failure(&self, message: &str) -> Vec<OutboundFrame> {
        let note = error_annotation(message);
        let mut out: Vec<OutboundFrame> = content_frame(&note).into_iter().collect();
        out.push(OutboundFrame::done());
        out
    }
}

fn content_frame(text: &str) -> Option<OutboundFrame> {
    frame(PayloadRef {
        content: Some(text),
        stream_data: None,
        is_final: false,
    })
}

fn frame(payload: PayloadRef<'_>) -> Option<OutboundFrame> {
    match serde_json::to_string(&payload) {
        Ok(json) => Some(OutboundFrame(json)),
        Err(e) => {
            tracing::error!("Failed to serialize outbound frame: {}", e);
            None
        }
    }
}
