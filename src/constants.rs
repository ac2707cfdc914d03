/// Answer deltas longer than this many characters are split into successive frames.
pub const ANSWER_CHUNK_CHARS: usize = 50;

/// Terminal marker written as the last frame of every relay stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Prefixes recognised by the line-oriented SSE parser.
pub const EVENT_PREFIX: &str = "event: ";
pub const DATA_PREFIX: &str = "data: ";

/// Upstream analysis API endpoints
pub const ANALYZE_STREAM_PATH: &str = "/analyze/stream";
pub const QUERY_STREAM_PATH: &str = "/query/stream";

/// Structured-analysis defaults
pub const DEFAULT_FORM_TYPES: &str = "10-K";
pub const ANALYSIS_GOAL_MIN_CHARS: usize = 10;

/// Environment keys
pub const UPSTREAM_URL_ENV: &str = "DROPANALYSIS_API_URL";
pub const ACCESS_PASSWORD_ENV: &str = "ACCESS_PASSWORD";
pub const SESSION_SECRET_ENV: &str = "SESSION_SECRET";
pub const SECURE_COOKIES_ENV: &str = "SECURE_COOKIES";
pub const SESSION_COOKIE_ENV: &str = "SECAGENT_SESSION";

/// Stream guards
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_STREAM_FRAMES: usize = 100_000;
pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 100;

/// Circuit breaker recovery window
pub const CIRCUIT_RECOVERY_SECS: u64 = 30;
pub const RETRY_BASE_DELAY_MS: u64 = 100;

/// Session cookie
pub const AUTH_COOKIE_NAME: &str = "auth_token";
pub const SESSION_DURATION_SECS: i64 = 60 * 60 * 24;
pub const SESSION_SECRET_LABEL: &str = "secagent-session:";

/// Paths reachable without a session when the gate is enabled.
pub const PUBLIC_PATHS: &[&str] = &["/login", "/health", "/readyz", "/favicon.ico"];
pub const PUBLIC_PREFIXES: &[&str] = &["/api/auth", "/_next/static", "/_next/image"];
pub const PUBLIC_ASSET_EXTENSIONS: &[&str] = &[".svg", ".png", ".jpg", ".jpeg", ".gif", ".webp"];

/// Chat history
pub const MAX_CHATS: i64 = 50;
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";
pub const TITLE_WORDS: usize = 6;
