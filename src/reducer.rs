use crate::aggregate::{AnswerAccumulator, StreamAggregate};
use crate::events::UpstreamEvent;
use crate::frame::Frame;
use crate::types::{now_millis, Result};

/// What a single upstream event asks the encoder to send downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Nothing,
    /// Side-channel update only: `{streamData}`.
    Snapshot,
    /// Thinking text goes out both as visible content and in the snapshot.
    Thinking(String),
    /// New answer suffix; the encoder chunks it.
    Answer(String),
    /// In-band error note rendered as content.
    Annotation(String),
}

/// Per-turn reduction state. One instance per upstream connection, owned by the
/// pump for the lifetime of the turn and never shared.
#[derive(Debug, Default)]
pub struct UpstreamEventReducer {
    aggregate: StreamAggregate,
    answer: AnswerAccumulator,
}

impl UpstreamEventReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&self) -> &StreamAggregate {
        &self.aggregate
    }

    pub fn answer(&self) -> &AnswerAccumulator {
        &self.answer
    }

    pub fn apply(&mut self, frame: &Frame) -> Result<Emission> {
        self.apply_at(frame, now_millis())
    }

    /// Decodes and folds one frame, stamping tool records with `now_ms`.
    /// A decode failure leaves the state untouched.
    pub fn apply_at(&mut self, frame: &Frame, now_ms: i64) -> Result<Emission> {
        let event = UpstreamEvent::decode(frame)?;
        Ok(self.reduce(event, now_ms))
    }

    pub fn reduce(&mut self, event: UpstreamEvent, now_ms: i64) -> Emission {
        match event {
            UpstreamEvent::Start { query, timestamp } => {
                if !self.aggregate.record_start(query, timestamp) {
                    tracing::debug!("Ignoring repeated start event");
                }
                Emission::Snapshot
            }
            UpstreamEvent::Thinking { content } => {
                self.aggregate.push_thinking(content.clone());
                Emission::Thinking(content)
            }
            UpstreamEvent::ToolCall { tool, input } => {
                self.aggregate.push_tool_call(tool, input, now_ms);
                Emission::Snapshot
            }
            UpstreamEvent::ToolResult { tool, output } => {
                self.aggregate.push_tool_result(tool, output, now_ms);
                Emission::Snapshot
            }
            UpstreamEvent::FinalAnswer { answer } => match self.answer.advance(&answer) {
                Some(suffix) => Emission::Answer(suffix),
                None => Emission::Nothing,
            },
            UpstreamEvent::Error { error } => Emission::Annotation(error_annotation(&error)),
            UpstreamEvent::Ignored => Emission::Nothing,
        }
    }
}

pub fn error_annotation(message: &str) -> String {
    format!("\n\nError: {}", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> Frame {
        Frame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn logs_grow_in_arrival_order() {
        let mut reducer = UpstreamEventReducer::new();
        let frames = [
            frame("thinking", r#"{"content":"one"}"#),
            frame("tool_call", r#"{"tool":"a","input":"x"}"#),
            frame("thinking", r#"{"content":"two"}"#),
            frame("tool_result", r#"{"tool":"a","output":"y"}"#),
            frame("tool_call", r#"{"tool":"b"}"#),
        ];
        for (i, f) in frames.iter().enumerate() {
            reducer.apply_at(f, i as i64).unwrap();
        }

        let agg = reducer.aggregate();
        assert_eq!(agg.thinking, vec!["one", "two"]);
        assert_eq!(agg.tool_calls.len(), 2);
        assert_eq!(agg.tool_calls[0].timestamp, 1);
        assert_eq!(agg.tool_calls[1].tool, "b");
        assert_eq!(agg.tool_calls[1].input, "");
        assert_eq!(agg.tool_results.len(), 1);
        assert_eq!(agg.tool_results[0].output, "y");
    }

    #[test]
    fn thinking_is_emitted_as_content_too() {
        let mut reducer = UpstreamEventReducer::new();
        let emission = reducer
            .apply_at(&frame("thinking", r#"{"content":"hmm"}"#), 0)
            .unwrap();
        assert_eq!(emission, Emission::Thinking("hmm".into()));
    }

    #[test]
    fn cumulative_answers_emit_suffixes_once() {
        let mut reducer = UpstreamEventReducer::new();
        let mut out = String::new();
        for answer in ["Rev", "Revenue", "Revenue", "Revenue grew 8%."] {
            let data = serde_json::json!({ "answer": answer }).to_string();
            if let Emission::Answer(s) = reducer.apply_at(&frame("final_answer", &data), 0).unwrap() {
                out.push_str(&s);
            }
        }
        assert_eq!(out, "Revenue grew 8%.");
        assert_eq!(reducer.answer().emitted_chars(), "Revenue grew 8%.".len());
    }

    #[test]
    fn start_is_recorded_once_but_always_snapshotted() {
        let mut reducer = UpstreamEventReducer::new();
        let first = reducer
            .apply_at(&frame("start", r#"{"query":"q1","timestamp":"t"}"#), 0)
            .unwrap();
        let second = reducer
            .apply_at(&frame("start", r#"{"query":"q2"}"#), 0)
            .unwrap();
        assert_eq!(first, Emission::Snapshot);
        assert_eq!(second, Emission::Snapshot);
        assert_eq!(reducer.aggregate().start.as_ref().unwrap().query, "q1");
    }

    #[test]
    fn upstream_error_becomes_annotation() {
        let mut reducer = UpstreamEventReducer::new();
        let emission = reducer
            .apply_at(&frame("error", r#"{"error":"quota exceeded"}"#), 0)
            .unwrap();
        assert_eq!(
            emission,
            Emission::Annotation("\n\nError: quota exceeded".into())
        );
    }

    #[test]
    fn bad_frame_leaves_state_untouched() {
        let mut reducer = UpstreamEventReducer::new();
        reducer
            .apply_at(&frame("thinking", r#"{"content":"kept"}"#), 0)
            .unwrap();
        assert!(reducer.apply_at(&frame("thinking", "{oops"), 0).is_err());
        assert_eq!(reducer.aggregate().thinking, vec!["kept"]);
        assert_eq!(
            reducer.apply_at(&frame("unknown", r#"{}"#), 0).unwrap(),
            Emission::Nothing
        );
    }
}
