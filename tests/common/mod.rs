#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use secagent::{AppConfig, AppState, ServeArgs};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Canned reply served for every request to a mock server.
#[derive(Clone)]
pub enum Reply {
    Events(StatusCode, &'static str),
    /// Sends one chunk, then keeps the connection open.
    Stalled(&'static str),
}

#[derive(Clone)]
struct MockState {
    reply: Reply,
    seen: Arc<Mutex<Vec<Seen>>>,
}

#[derive(Debug, Clone)]
pub struct Seen {
    pub uri: String,
    pub body: String,
}

pub struct MockServer {
    pub base_url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl MockServer {
    pub fn requests(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

async fn mock_handler(State(state): State<MockState>, uri: Uri, body: Bytes) -> Response {
    state.seen.lock().unwrap().push(Seen {
        uri: uri.to_string(),
        body: String::from_utf8_lossy(&body).to_string(),
    });

    match state.reply {
        Reply::Events(status, text) => (
            status,
            [(header::CONTENT_TYPE, "text/event-stream")],
            text,
        )
            .into_response(),
        Reply::Stalled(first) => {
            let chunks = futures_util::stream::once(async move {
                Ok::<_, std::io::Error>(Bytes::from_static(first.as_bytes()))
            });
            let stream = futures_util::StreamExt::chain(chunks, futures_util::stream::pending());
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

/// Starts a server on an ephemeral port that answers every path with `reply`.
pub async fn spawn_mock(reply: Reply) -> MockServer {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().fallback(mock_handler).with_state(MockState {
        reply,
        seen: seen.clone(),
    });
    let base_url = serve_on_ephemeral_port(app).await;
    MockServer { base_url, seen }
}

pub async fn serve_on_ephemeral_port(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A base URL nothing is listening on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn app_state(upstream_url: Option<String>, password: Option<&str>) -> Arc<AppState> {
    let config = AppConfig {
        upstream_url,
        access_password: password.map(str::to_string),
        session_secret: Some("test-secret".to_string()),
        secure_cookies: false,
    };
    let args = ServeArgs {
        max_retries: 1,
        request_timeout_secs: 10,
        ..Default::default()
    };
    Arc::new(AppState::new(config, args).unwrap())
}

pub async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// `data` fields of an SSE body, in order.
pub fn data_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:")))
        .map(|d| d.trim().to_string())
        .collect()
}
