use crate::str_utils;
use serde::{Deserialize, Serialize};

/// One tool invocation reported by the analysis API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub tool: String,
    pub input: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResultRecord {
    pub tool: String,
    pub output: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartInfo {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Side-channel state for one turn: reasoning fragments, tool traffic and the
/// run's start metadata. Every field only grows while the turn is live.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamAggregate {
    #[serde(default)]
    pub thinking: Vec<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartInfo>,
}

impl StreamAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any of the logs has an entry. `start` alone does not count.
    pub fn has_activity(&self) -> bool {
        !self.thinking.is_empty() || !self.tool_calls.is_empty() || !self.tool_results.is_empty()
    }

    pub fn push_thinking(&mut self, fragment: impl Into<String>) {
        self.thinking.push(fragment.into());
    }

    pub fn push_tool_call(&mut self, tool: impl Into<String>, input: impl Into<String>, ts: i64) {
        self.tool_calls.push(ToolCallRecord {
            tool: tool.into(),
            input: input.into(),
            timestamp: ts,
        });
    }

    pub fn push_tool_result(
        &mut self,
        tool: impl Into<String>,
        output: impl Into<String>,
        ts: i64,
    ) {
        self.tool_results.push(ToolResultRecord {
            tool: tool.into(),
            output: output.into(),
            timestamp: ts,
        });
    }

    /// Records the start metadata unless a previous `start` already did.
    /// Returns whether this call set it.
    pub fn record_start(&mut self, query: String, timestamp: Option<String>) -> bool {
        if self.start.is_some() {
            return false;
        }
        self.start = Some(StartInfo { query, timestamp });
        true
    }
}

/// Tracks the cumulative answer text and how much of it was already relayed.
///
/// The cursor counts characters, never bytes, so slicing cannot land inside a
/// multi-byte sequence. It never moves backwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerAccumulator {
    answer: String,
    emitted_chars: usize,
}

impl AnswerAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn emitted_chars(&self) -> usize {
        self.emitted_chars
    }

    /// Takes the latest full answer and returns the part not yet emitted, if any.
    /// A shorter (or equal-length) answer than what was already sent yields nothing.
    pub fn advance(&mut self, full_answer: &str) -> Option<String> {
        let suffix = str_utils::skip_chars(full_answer, self.emitted_chars);
        if suffix.is_empty() {
            return None;
        }
        self.emitted_chars = str_utils::char_len(full_answer);
        self.answer = full_answer.to_string();
        Some(suffix.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_serializes_with_camel_case_keys() {
        let mut agg = StreamAggregate::new();
        agg.push_tool_call("search_filings", "AAPL 10-K", 1);
        agg.push_tool_result("search_filings", "3 hits", 2);
        let json = serde_json::to_value(&agg).unwrap();
        assert!(json.get("toolCalls").is_some());
        assert!(json.get("toolResults").is_some());
        assert!(json.get("start").is_none());
        assert_eq!(json["toolCalls"][0]["input"], "AAPL 10-K");
    }

    #[test]
    fn first_start_wins() {
        let mut agg = StreamAggregate::new();
        assert!(agg.record_start("first".into(), Some("t1".into())));
        assert!(!agg.record_start("second".into(), None));
        assert_eq!(agg.start.as_ref().map(|s| s.query.as_str()), Some("first"));
        assert!(!agg.has_activity());
    }

    #[test]
    fn accumulator_emits_only_new_suffix() {
        let mut acc = AnswerAccumulator::new();
        assert_eq!(acc.advance("Hello"), Some("Hello".to_string()));
        assert_eq!(acc.advance("Hello world"), Some(" world".to_string()));
        assert_eq!(acc.advance("Hello world"), None);
        assert_eq!(acc.advance("Hi"), None);
        assert_eq!(acc.emitted_chars(), 11);
        assert_eq!(acc.answer(), "Hello world");
    }

    #[test]
    fn accumulator_cursor_counts_characters() {
        let mut acc = AnswerAccumulator::new();
        assert_eq!(acc.advance("né"), Some("né".to_string()));
        assert_eq!(acc.advance("néon"), Some("on".to_string()));
        assert_eq!(acc.emitted_chars(), 4);
    }
}
