use crate::auth::AuthGate;
use crate::constants::{
    ACCESS_PASSWORD_ENV, CIRCUIT_RECOVERY_SECS, RETRY_BASE_DELAY_MS, SECURE_COOKIES_ENV,
    SESSION_SECRET_ENV, UPSTREAM_URL_ENV,
};
use crate::hardening::{CircuitBreaker, RetryPolicy};
use crate::relay::RelayService;
use crate::router::RequestRouter;
use crate::types::{RelayError, Result, UpstreamHealth};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "SEC filing analysis chat relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP relay.
    Serve(ServeArgs),
    /// Ask one question through a running relay and store the turn.
    Ask(AskArgs),
    /// List or delete stored chats.
    History(HistoryArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long)]
    pub static_dir: Option<PathBuf>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
            max_retries: 2,
            circuit_breaker_threshold: 5,
            max_body_size: 1024 * 1024,
            static_dir: None,
            log_dir: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub relay: String,
    #[arg(long)]
    pub ticker: Option<String>,
    #[arg(long)]
    pub form_types: Option<String>,
    #[arg(long)]
    pub start_date: Option<String>,
    #[arg(long)]
    pub end_date: Option<String>,
    #[arg(long, default_value_t = false)]
    pub deep_analysis: bool,
    /// Continue an existing chat instead of starting a new one.
    #[arg(long)]
    pub chat: Option<String>,
    #[arg(long, default_value = "secagent.db")]
    pub database: PathBuf,
    #[arg(required = true, num_args = 1..)]
    pub question: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    #[arg(long, default_value = "secagent.db")]
    pub database: PathBuf,
    #[arg(long)]
    pub delete: Option<String>,
}

/// Deployment values read from the environment (after `.env`).
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub upstream_url: Option<String>,
    pub access_password: Option<String>,
    pub session_secret: Option<String>,
    pub secure_cookies: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secure_cookies = match lookup(SECURE_COOKIES_ENV) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            None => false,
        };
        Self {
            upstream_url: non_empty(UPSTREAM_URL_ENV),
            access_password: non_empty(ACCESS_PASSWORD_ENV),
            session_secret: non_empty(SESSION_SECRET_ENV),
            secure_cookies,
        }
    }
}

pub struct AppState {
    pub relay: RelayService,
    pub auth: AuthGate,
    pub health: Arc<UpstreamHealth>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub config: AppConfig,
    pub args: Arc<ServeArgs>,
}

impl AppState {
    pub fn new(config: AppConfig, args: ServeArgs) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(args.request_timeout_secs))
            .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()
            .map_err(|e| RelayError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let health = Arc::new(UpstreamHealth::default());
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            args.circuit_breaker_threshold,
            Duration::from_secs(CIRCUIT_RECOVERY_SECS),
        ));
        let relay = RelayService::new(
            client,
            RequestRouter::new(config.upstream_url.clone()),
            RetryPolicy::new(args.max_retries, RETRY_BASE_DELAY_MS),
            circuit_breaker.clone(),
            health.clone(),
        );
        let auth = AuthGate::new(
            config.access_password.clone(),
            config.session_secret.clone(),
            config.secure_cookies,
        );

        Ok(Self {
            relay,
            auth,
            health,
            circuit_breaker,
            config,
            args: Arc::new(args),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_reads_env_values() {
        let env: HashMap<&str, &str> = [
            ("DROPANALYSIS_API_URL", "http://localhost:8000"),
            ("ACCESS_PASSWORD", ""),
            ("SECURE_COOKIES", "TRUE"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.upstream_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.access_password, None);
        assert_eq!(config.session_secret, None);
        assert!(config.secure_cookies);
    }

    #[test]
    fn cli_parses_ask_with_settings() {
        let cli = Cli::try_parse_from([
            "secagent",
            "ask",
            "--ticker",
            "AAPL",
            "--deep-analysis",
            "What",
            "changed?",
        ])
        .unwrap();
        match cli.command {
            Command::Ask(args) => {
                assert_eq!(args.ticker.as_deref(), Some("AAPL"));
                assert!(args.deep_analysis);
                assert_eq!(args.question.join(" "), "What changed?");
                assert_eq!(args.relay, "http://127.0.0.1:3000");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn serve_defaults_match_default_impl() {
        let cli = Cli::try_parse_from(["secagent", "serve"]).unwrap();
        match cli.command {
            Command::Serve(args) => {
                let d = ServeArgs::default();
                assert_eq!(args.port, d.port);
                assert_eq!(args.max_retries, d.max_retries);
                assert_eq!(args.max_body_size, d.max_body_size);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
