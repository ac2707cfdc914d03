use crate::chat::ChatRequest;
use crate::reducer::Emission;
use crate::str_utils;
use axum::{
    body::Body,
    http::{HeaderMap, Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use std::path::Path;
use tracing::{error, info, warn};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

pub const RELAY_TURN_ID_HEADER: &str = "x-relay-turn-id";

const DEFAULT_FILTER: &str = "secagent=info";

/// Installs the global subscriber: env filter, stderr, optional daily file and
/// the span-trace layer. Keep the returned guard alive for the process lifetime
/// or buffered file lines are lost.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Could not create log directory {}: {}", dir.display(), e);
            }
            let appender = tracing_appender::rolling::daily(dir, "secagent.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if let Err(e) = installed {
        eprintln!("Tracing subscriber already installed: {}", e);
    }

    guard
}

/// Sets up a global panic hook that logs panics through tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    if let Ok(val) = turn_id.parse() {
        req.headers_mut().insert(RELAY_TURN_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        turn_id = %str_utils::prefix_chars(&turn_id, 8),
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = turn_id.parse() {
        response.headers_mut().insert(RELAY_TURN_ID_HEADER, val);
    }
    response
}

/// Turn id stamped by [`turn_id_middleware`], or `"unknown"` outside it.
pub fn turn_id(headers: &HeaderMap) -> String {
    headers
        .get(RELAY_TURN_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn log_request_summary(request: &ChatRequest) {
    let msg_count = request.messages.len();
    let last_role = match request.messages.last() {
        Some(m) => m.role.as_str(),
        None => "NONE",
    };
    let ticker = request
        .settings
        .as_ref()
        .and_then(|s| s.ticker())
        .unwrap_or("-");
    let query_chars = str_utils::char_len(request.latest_user_query());

    if last_role != "user" && msg_count > 0 {
        warn!(
            target: "flight_recorder",
            "{}", "[REQ] Last message is not from the user; routing on the latest user turn".yellow()
        );
    }

    info!(
        target: "flight_recorder",
        "[REQ] Messages: {} | Last Role: {} | Ticker: {} | Query: {} chars",
        msg_count, last_role, ticker, query_chars
    );
}

/// Per-turn counters for the relay pump, logged once when the stream ends.
#[derive(Debug, Default)]
pub struct StreamMetric {
    pub frames_in: usize,
    pub frames_out: usize,
    pub thinking: usize,
    pub snapshots: usize,
    pub annotations: usize,
    pub answer_chars: usize,
    pub decode_failures: usize,
    pub client_gone: bool,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_emission(&mut self, emission: &Emission) {
        match emission {
            Emission::Nothing => {}
            Emission::Snapshot => self.snapshots += 1,
            Emission::Thinking(_) => self.thinking += 1,
            Emission::Answer(delta) => self.answer_chars += str_utils::char_len(delta),
            Emission::Annotation(_) => self.annotations += 1,
        }
    }

    pub fn log_summary(&self) {
        if self.decode_failures > 0 || self.annotations > 0 {
            warn!(
                target: "flight_recorder",
                "{}",
                format!(
                    "[STREAM] {} undecodable frames, {} error notes",
                    self.decode_failures, self.annotations
                )
                .bold()
                .red()
            );
        }

        info!(
            target: "flight_recorder",
            "[STREAM END] In: {} | Out: {} | Thinking: {} | Snapshots: {} | Answer: {} chars | Client gone: {}",
            self.frames_in,
            self.frames_out,
            self.thinking,
            self.snapshots,
            self.answer_chars,
            self.client_gone
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_counts_each_emission_kind() {
        let mut metric = StreamMetric::new();
        metric.record_emission(&Emission::Thinking("t".into()));
        metric.record_emission(&Emission::Snapshot);
        metric.record_emission(&Emission::Answer("héllo".into()));
        metric.record_emission(&Emission::Annotation("x".into()));
        metric.record_emission(&Emission::Nothing);
        assert_eq!(metric.thinking, 1);
        assert_eq!(metric.snapshots, 1);
        assert_eq!(metric.answer_chars, 5);
        assert_eq!(metric.annotations, 1);
    }

    #[test]
    fn turn_id_falls_back_to_unknown() {
        let mut headers = HeaderMap::new();
        assert_eq!(turn_id(&headers), "unknown");
        headers.insert(RELAY_TURN_ID_HEADER, "abc".parse().unwrap());
        assert_eq!(turn_id(&headers), "abc");
    }
}
