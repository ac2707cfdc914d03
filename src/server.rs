use crate::chat::ChatRequest;
use crate::logging::{self, turn_id_middleware};
use crate::main_helper::AppState;
use crate::relay::sse_response;
use crate::types::{ObservedError, RelayError, Result};
use crate::{auth, health};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/verify", get(auth::verify))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness));

    // Built browser front-end, with index.html as the SPA fallback.
    if let Some(dir) = state.args.static_dir.as_ref() {
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(
            ServeDir::new(dir)
                .append_index_html_on_directories(true)
                .fallback(index),
        );
    }

    app.layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::gate_middleware,
        ))
        .layer(middleware::from_fn(turn_id_middleware))
        .with_state(state)
}

#[tracing::instrument(
    name = "relay.chat",
    skip_all,
    fields(http.status = tracing::field::Empty, relay.outcome = tracing::field::Empty)
)]
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let span = tracing::Span::current();

    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            span.record("relay.outcome", "client_error");
            return rejection.into_response();
        }
        Err(rejection) => {
            span.record("relay.outcome", "client_error");
            return ObservedError::from(RelayError::Validation(rejection.body_text()))
                .into_response();
        }
    };

    logging::log_request_summary(&request);
    let turn_id = logging::turn_id(&headers);

    match state.relay.stream(&request, &turn_id).await {
        Ok(rx) => {
            span.record("http.status", 200);
            span.record("relay.outcome", "streaming");
            sse_response(rx)
        }
        Err(e) => {
            let response = e.into_response();
            span.record("http.status", response.status().as_u16());
            span.record("relay.outcome", "pre_stream_error");
            response
        }
    }
}

/// Binds and serves until Ctrl-C.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", state.args.host, state.args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = build_router(state.clone());

    tracing::info!("secagent relay listening on {}", addr);
    if !state.auth.is_enabled() {
        tracing::warn!("ACCESS_PASSWORD is not set; the password gate is disabled");
    }
    if state.relay.router().base_url().is_none() {
        tracing::warn!("DROPANALYSIS_API_URL is not set; chat requests will fail");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
