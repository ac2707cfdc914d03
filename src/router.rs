use crate::chat::{ChatRequest, ChatSettings, DateInput};
use crate::constants::{
    ANALYSIS_GOAL_MIN_CHARS, ANALYZE_STREAM_PATH, DEFAULT_FORM_TYPES, QUERY_STREAM_PATH,
};
use crate::str_utils;
use crate::types::{RelayError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Per-ticker filing analysis (`/analyze/stream`).
    Structured,
    /// Free-form question (`/query/stream`).
    FreeForm,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Structured => "structured",
            RouteMode::FreeForm => "free_form",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTarget {
    pub mode: RouteMode,
    pub url: Url,
    pub ticker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestRouter {
    base_url: Option<String>,
}

impl RequestRouter {
    pub fn new(base_url: Option<String>) -> Self {
        Self { base_url }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    /// Picks the endpoint for the latest user message of `request`.
    pub fn route(&self, request: &ChatRequest) -> Result<UpstreamTarget> {
        let base = self.base_url().ok_or_else(|| {
            RelayError::Configuration("Analysis API URL is not configured".to_string())
        })?;

        let query = request.latest_user_query();
        if query.trim().is_empty() {
            return Err(RelayError::Validation("Query is required".to_string()).into());
        }

        let default_settings = ChatSettings::default();
        let settings = request.settings.as_ref().unwrap_or(&default_settings);
        build_target(base, query, settings)
    }
}

fn build_target(base: &str, query: &str, settings: &ChatSettings) -> Result<UpstreamTarget> {
    match settings.ticker() {
        Some(ticker) => {
            let mut url = endpoint(base, ANALYZE_STREAM_PATH)?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("ticker", ticker);

                let form_types = settings
                    .form_types
                    .as_deref()
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .unwrap_or(DEFAULT_FORM_TYPES);
                pairs.append_pair("form_types", form_types);

                if let Some(start) = settings.start_date.as_ref().and_then(format_date) {
                    pairs.append_pair("start_date", &start);
                }
                if let Some(end) = settings.end_date.as_ref().and_then(format_date) {
                    pairs.append_pair("end_date", &end);
                }

                let deep = settings.deep_analysis.unwrap_or(false);
                pairs.append_pair("deep_analysis", if deep { "true" } else { "false" });

                let goal = query.trim();
                if str_utils::char_len(goal) > ANALYSIS_GOAL_MIN_CHARS {
                    pairs.append_pair("analysis_goal", goal);
                }
            }
            Ok(UpstreamTarget {
                mode: RouteMode::Structured,
                url,
                ticker: Some(ticker.to_string()),
            })
        }
        None => {
            let mut url = endpoint(base, QUERY_STREAM_PATH)?;
            url.query_pairs_mut().append_pair("query", query);
            Ok(UpstreamTarget {
                mode: RouteMode::FreeForm,
                url,
                ticker: None,
            })
        }
    }
}

fn endpoint(base: &str, path: &str) -> Result<Url> {
    let raw = format!("{}{}", base.trim_end_matches('/'), path);
    Url::parse(&raw).map_err(|e| {
        RelayError::Configuration(format!("Invalid analysis API URL '{}': {}", base, e)).into()
    })
}

/// Formats a settings date as `YYYY-MM-DD` (UTC). Anything unparseable yields
/// `None`, which means "leave the parameter out".
pub fn format_date(input: &DateInput) -> Option<String> {
    let date = match input {
        DateInput::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(*ms)?.date_naive(),
        DateInput::Text(text) => parse_date_text(text.trim())?,
    };
    Some(date.format("%Y-%m-%d").to_string())
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(d);
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.date())
}
