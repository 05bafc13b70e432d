use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

/// Deckster client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Director WebSocket endpoint (defaults to the local dev broker).
    pub director_url: String,
    /// Session store HTTP base URL.
    pub api_url: String,
}

impl Config {
    pub fn new(director_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
            director_url: normalize_host(director_url.into()),
            api_url: normalize_host(api_url.into()),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let director_url = env::var("DECKSTER_DIRECTOR_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8700/ws".to_string());
        let api_url = env::var("DECKSTER_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8700".to_string());
        Self::new(director_url, api_url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            director_url: "ws://127.0.0.1:8700/ws".to_string(),
            api_url: "http://127.0.0.1:8700".to_string(),
        }
    }
}

fn normalize_host(url: String) -> String {
    if url.contains("//localhost") {
        url.replacen("localhost", "127.0.0.1", 1)
    } else {
        url
    }
}

/// Tuning knobs for the synchronization engine. Every timer in the engine
/// reads from here so tests can shrink the windows instead of sleeping for
/// the production defaults.
#[derive(Debug, Clone)]
pub struct SyncTuning {
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Ceiling for the backoff schedule.
    pub reconnect_max_delay: Duration,
    /// Consecutive failed reconnects tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Whether unexpected closes trigger reconnection at all.
    pub auto_reconnect: bool,
    /// Quiet window before agent-originated queue entries are flushed.
    pub flush_debounce: Duration,
    /// How long a terminal status note lingers before clearing.
    pub status_linger: Duration,
    /// Deadline for speculative generation placeholders.
    pub generation_timeout: Duration,
    /// Age past which a cached snapshot counts as a miss.
    pub cache_ttl: Duration,
    /// Upper bound on cached message list lengths.
    pub cache_message_cap: usize,
}

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);
const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_secs(3);
const DEFAULT_STATUS_LINGER: Duration = Duration::from_secs(2);
const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_CACHE_MESSAGE_CAP: usize = 500;

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            auto_reconnect: true,
            flush_debounce: DEFAULT_FLUSH_DEBOUNCE,
            status_linger: DEFAULT_STATUS_LINGER,
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_message_cap: DEFAULT_CACHE_MESSAGE_CAP,
        }
    }
}
