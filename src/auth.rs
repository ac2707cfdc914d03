//! Shared-password gate. A successful login sets an HMAC-signed session cookie;
//! the gate middleware checks it on every non-public path.

use crate::constants::{
    AUTH_COOKIE_NAME, PUBLIC_ASSET_EXTENSIONS, PUBLIC_PATHS, PUBLIC_PREFIXES,
    SESSION_DURATION_SECS, SESSION_SECRET_LABEL,
};
use crate::main_helper::AppState;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AuthGate {
    password: Option<String>,
    secret: Vec<u8>,
    secure_cookies: bool,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.is_enabled())
            .field("secure_cookies", &self.secure_cookies)
            .finish()
    }
}

impl AuthGate {
    /// An empty password disables the gate. Without an explicit secret the
    /// signing key is derived from the password.
    pub fn new(password: Option<String>, secret: Option<String>, secure_cookies: bool) -> Self {
        let password = password.filter(|p| !p.is_empty());
        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(s) => s.into_bytes(),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(SESSION_SECRET_LABEL.as_bytes());
                hasher.update(password.as_deref().unwrap_or_default().as_bytes());
                hasher.finalize().to_vec()
            }
        };
        Self {
            password,
            secret,
            secure_cookies,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.password.is_some()
    }

    /// Constant-time comparison: both sides are MACed and compared with
    /// `verify_slice`.
    pub fn check_password(&self, candidate: &str) -> bool {
        let Some(expected) = self.password.as_deref() else {
            return false;
        };
        let Some(mut mac) = self.mac() else {
            return false;
        };
        mac.update(expected.as_bytes());
        let expected_tag = mac.finalize().into_bytes();

        let Some(mut mac) = self.mac() else {
            return false;
        };
        mac.update(candidate.as_bytes());
        mac.verify_slice(&expected_tag).is_ok()
    }

    pub fn issue(&self) -> String {
        self.issue_at(chrono::Utc::now().timestamp())
    }

    /// `<token>.<expires>.<mac>`, all hex except the unix-seconds expiry.
    pub fn issue_at(&self, now_secs: i64) -> String {
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let expires = now_secs + SESSION_DURATION_SECS;
        let signed = format!("{}.{}", token, expires);
        let tag = self.sign(&signed);
        format!("{}.{}", signed, tag)
    }

    pub fn verify(&self, value: &str) -> bool {
        self.verify_at(value, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(&self, value: &str, now_secs: i64) -> bool {
        let Some((signed, tag_hex)) = value.rsplit_once('.') else {
            return false;
        };
        let Some((token, expires)) = signed.split_once('.') else {
            return false;
        };
        if token.is_empty() {
            return false;
        }
        let Ok(expires) = expires.parse::<i64>() else {
            return false;
        };
        if expires <= now_secs {
            return false;
        }
        let Some(tag) = hex_decode(tag_hex) else {
            return false;
        };
        let Some(mut mac) = self.mac() else {
            return false;
        };
        mac.update(signed.as_bytes());
        mac.verify_slice(&tag).is_ok()
    }

    pub fn is_authenticated(&self, headers: &HeaderMap) -> bool {
        if !self.is_enabled() {
            return true;
        }
        cookie_value(headers, AUTH_COOKIE_NAME)
            .map(|v| self.verify(&v))
            .unwrap_or(false)
    }

    pub fn session_cookie(&self, value: &str) -> String {
        self.cookie(value, SESSION_DURATION_SECS)
    }

    pub fn clear_cookie(&self) -> String {
        self.cookie("", 0)
    }

    fn cookie(&self, value: &str, max_age: i64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
            AUTH_COOKIE_NAME, value, max_age
        );
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }

    fn mac(&self) -> Option<HmacSha256> {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => Some(mac),
            Err(e) => {
                tracing::error!("Invalid session secret: {}", e);
                None
            }
        }
    }

    fn sign(&self, message: &str) -> String {
        match self.mac() {
            Some(mut mac) => {
                mac.update(message.as_bytes());
                hex_encode(&mac.finalize().into_bytes())
            }
            None => String::new(),
        }
    }
}

/// Paths reachable without a session.
pub fn is_public_path(path: &str) -> bool {
    if PUBLIC_PATHS.contains(&path) {
        return true;
    }
    if PUBLIC_PREFIXES
        .iter()
        .any(|p| path == *p || path.starts_with(&format!("{}/", p)))
    {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    PUBLIC_ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[derive(Deserialize)]
struct LoginBody {
    #[serde(default)]
    password: Option<serde_json::Value>,
}

fn auth_failure(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

pub async fn login(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let password = serde_json::from_slice::<LoginBody>(&body)
        .ok()
        .and_then(|b| b.password)
        .and_then(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        });
    let Some(password) = password else {
        return auth_failure(StatusCode::BAD_REQUEST, "Password is required");
    };

    let gate = &state.auth;
    if !gate.is_enabled() {
        return Json(json!({ "success": true })).into_response();
    }

    if !gate.check_password(&password) {
        tracing::warn!("Login rejected: invalid password");
        return auth_failure(StatusCode::UNAUTHORIZED, "Invalid password");
    }

    let cookie = gate.session_cookie(&gate.issue());
    tracing::info!("Login accepted; session issued");
    match HeaderValue::from_str(&cookie) {
        Ok(value) => (
            [(header::SET_COOKIE, value)],
            Json(json!({ "success": true })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Could not build session cookie header: {}", e);
            auth_failure(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed")
        }
    }
}

pub async fn logout(State(state): State<Arc<AppState>>) -> Response {
    match HeaderValue::from_str(&state.auth.clear_cookie()) {
        Ok(value) => (
            [(header::SET_COOKIE, value)],
            Json(json!({ "success": true })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Could not build logout cookie header: {}", e);
            auth_failure(StatusCode::INTERNAL_SERVER_ERROR, "Logout failed")
        }
    }
}

pub async fn verify(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let authenticated = state.auth.is_authenticated(&headers);
    Json(json!({ "authenticated": authenticated })).into_response()
}

pub async fn gate_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let gate = &state.auth;
    let path = req.uri().path().to_string();
    if !gate.is_enabled() || is_public_path(&path) || gate.is_authenticated(req.headers()) {
        return next.run(req).await;
    }

    if path.starts_with("/api/") {
        tracing::debug!("Rejecting unauthenticated API request to {}", path);
        return crate::types::ObservedError::from(crate::types::RelayError::Unauthorized(
            "Authentication required".to_string(),
        ))
        .into_response();
    }

    let mut login = match reqwest::Url::parse("http://gate.local/login") {
        Ok(u) => u,
        Err(_) => return Redirect::temporary("/login").into_response(),
    };
    login.query_pairs_mut().append_pair("redirect", &path);
    let target = match login.query() {
        Some(q) => format!("/login?{}", q),
        None => "/login".to_string(),
    };
    Redirect::temporary(&target).into_response()
}
