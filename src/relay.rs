//! One chat turn end to end: route, connect to the analysis API, then pump its
//! SSE stream through parse, reduce and encode into the outbound channel.
//!
//! Everything up to and including the upstream status check happens before the
//! outbound stream exists, so failures there become ordinary JSON error
//! responses. Once the pump is running the only way to report trouble is an
//! in-band annotation followed by `[DONE]`.

use crate::chat::ChatRequest;
use crate::constants::{KEEPALIVE_INTERVAL_SECS, MAX_STREAM_FRAMES, OUTBOUND_CHANNEL_CAPACITY};
use crate::encoder::{OutboundFrame, RelayEncoder};
use crate::frame::frames;
use crate::hardening::{CircuitBreaker, RetryPolicy};
use crate::logging::StreamMetric;
use crate::reducer::UpstreamEventReducer;
use crate::router::{RequestRouter, UpstreamTarget};
use crate::types::{RelayError, Result, UpstreamHealth};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// An upstream response that passed the status check.
pub struct UpstreamConnection {
    pub target: UpstreamTarget,
    pub response: reqwest::Response,
}

pub struct RelayService {
    client: reqwest::Client,
    router: RequestRouter,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    health: Arc<UpstreamHealth>,
    encoder: RelayEncoder,
    max_frames: usize,
}

impl RelayService {
    pub fn new(
        client: reqwest::Client,
        router: RequestRouter,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        health: Arc<UpstreamHealth>,
    ) -> Self {
        Self {
            client,
            router,
            retry,
            breaker,
            health,
            encoder: RelayEncoder::new(),
            max_frames: MAX_STREAM_FRAMES,
        }
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn health(&self) -> &UpstreamHealth {
        &self.health
    }

    /// Routes the request and opens the upstream SSE connection.
    pub async fn connect(&self, request: &ChatRequest) -> Result<UpstreamConnection> {
        let target = self.router.route(request)?;
        let base = self.router.base_url().unwrap_or_default().to_string();

        self.breaker.check(&base).await?;

        tracing::info!(
            mode = target.mode.as_str(),
            ticker = target.ticker.as_deref().unwrap_or("-"),
            "[⚙️  -> ☁️ ] GET {}",
            target.url.path()
        );

        let attempt = self
            .retry
            .execute_with_retry(|| self.send_once(&target, &base))
            .await;

        let response = match attempt {
            Ok(r) => {
                self.breaker.record_success().await;
                self.health.record_success();
                r
            }
            Err(e) => {
                self.breaker.record_failure().await;
                self.health.record_failure();
                tracing::error!("[☁️  -> ⚙️ ] Upstream unreachable: {}", e);
                return Err(e);
            }
        };

        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);
        if !status.is_success() {
            let body = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to read upstream error body: {}", e);
                    String::new()
                }
            };
            let body = if body.trim().is_empty() {
                format!("Analysis API returned status {}", status.as_u16())
            } else {
                body
            };
            tracing::error!("[☁️  -> ⚙️ ] Upstream Error: {}", body);
            return Err(RelayError::Upstream(status, body).into());
        }

        Ok(UpstreamConnection { target, response })
    }

    async fn send_once(&self, target: &UpstreamTarget, base: &str) -> Result<reqwest::Response> {
        self.client
            .get(target.url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                RelayError::UpstreamUnavailable {
                    url: base.to_string(),
                    message: e.to_string(),
                }
                .into()
            })
    }

    /// Connects, then spawns the pump. The receiver yields encoded frames and
    /// closes after `[DONE]` (or early, if the pump saw the client go away).
    pub async fn stream(
        &self,
        request: &ChatRequest,
        turn_id: &str,
    ) -> Result<mpsc::Receiver<OutboundFrame>> {
        let UpstreamConnection { target, response } = self.connect(request).await?;

        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let encoder = self.encoder;
        let max_frames = self.max_frames;
        let span = tracing::info_span!(
            "stream",
            turn_id = %turn_id,
            mode = target.mode.as_str(),
            ticker = target.ticker.as_deref().unwrap_or("-"),
        );

        tokio::spawn(
            async move {
                let metric = pump(response.bytes_stream(), tx, encoder, max_frames).await;
                metric.log_summary();
            }
            .instrument(span),
        );

        Ok(rx)
    }
}

/// Drives parse, reduce and encode over `byte_stream` in a single forward
/// pass. Always ends the channel with `[DONE]` unless the receiver is gone.
pub async fn pump<S, E>(
    byte_stream: S,
    tx: mpsc::Sender<OutboundFrame>,
    encoder: RelayEncoder,
    max_frames: usize,
) -> StreamMetric
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let upstream = frames(byte_stream);
    tokio::pin!(upstream);

    let mut reducer = UpstreamEventReducer::new();
    let mut metric = StreamMetric::new();

    let failure = loop {
        let frame = match upstream.next().await {
            None => break None,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Some(RelayError::MidStream(e.to_string())),
        };

        metric.frames_in += 1;
        if metric.frames_in > max_frames {
            break Some(RelayError::MidStream(format!(
                "upstream sent more than {} events",
                max_frames
            )));
        }

        let emission = match reducer.apply(&frame) {
            Ok(emission) => emission,
            Err(e) => {
                metric.decode_failures += 1;
                tracing::warn!("Skipping upstream frame: {}", e);
                continue;
            }
        };
        metric.record_emission(&emission);

        for out in encoder.encode(&emission, reducer.aggregate()) {
            if !forward(&tx, out, &mut metric).await {
                return metric;
            }
        }
    };

    let tail = match failure {
        None => encoder.finish(reducer.aggregate()),
        Some(err) => {
            tracing::error!("Relay stream failed mid-flight: {}", err);
            let message = match &err {
                RelayError::MidStream(m) => m.clone(),
                other => other.to_string(),
            };
            encoder.failure(&message)
        }
    };
    for out in tail {
        if !forward(&tx, out, &mut metric).await {
            break;
        }
    }
    metric
}

async fn forward(
    tx: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
    metric: &mut StreamMetric,
) -> bool {
    match tx.send(frame).await {
        Ok(()) => {
            metric.frames_out += 1;
            true
        }
        Err(_) => {
            metric.client_gone = true;
            tracing::info!("Client disconnected; stopping upstream read");
            false
        }
    }
}

/// Wraps the pump's receiver as the `text/event-stream` response.
pub fn sse_response(rx: mpsc::Receiver<OutboundFrame>) -> Response {
    let events = ReceiverStream::new(rx)
        .map(|frame| Ok::<Event, Infallible>(frame.into_event()));
    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS))
            .text("keepalive"),
    );
    ([(header::CONNECTION, "keep-alive")], sse).into_response()
}
