//! Engine configuration from defaults and environment variables.

use std::time::Duration;

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Consecutive failures before entering cooldown
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any retry delay
    pub max_delay: Duration,
    /// Explicit connect calls closer together than this are ignored
    pub min_attempt_interval: Duration,
    /// How long to refuse new attempts after `max_attempts` failures
    pub cooldown: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            min_attempt_interval: Duration::from_millis(1000),
            cooldown: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub reconnect: ReconnectConfig,
    /// How long a provisional message may stay unconfirmed.
    pub send_deadline: Duration,
    /// How long a room stays in the mark-as-read in-flight set after the call completes.
    pub read_release_cooldown: Duration,
    pub rooms_cache_ttl: Duration,
    pub history_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            send_deadline: Duration::from_secs(10),
            read_release_cooldown: Duration::from_millis(1000),
            rooms_cache_ttl: Duration::from_secs(30),
            history_page_size: 50,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from environment variables, falling back to defaults.
    ///
    /// Environment variables (durations in milliseconds):
    /// - `RELAYCHAT_MAX_RECONNECT_ATTEMPTS`
    /// - `RELAYCHAT_RECONNECT_BASE_MS`, `RELAYCHAT_RECONNECT_MAX_MS`
    /// - `RELAYCHAT_MIN_ATTEMPT_INTERVAL_MS`, `RELAYCHAT_COOLDOWN_MS`
    /// - `RELAYCHAT_SEND_DEADLINE_MS`, `RELAYCHAT_READ_RELEASE_MS`
    /// - `RELAYCHAT_ROOMS_CACHE_TTL_MS`, `RELAYCHAT_HISTORY_PAGE_SIZE`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let reconnect = ReconnectConfig {
            max_attempts: env_parse("RELAYCHAT_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.reconnect.max_attempts),
            base_delay: env_millis("RELAYCHAT_RECONNECT_BASE_MS")
                .unwrap_or(defaults.reconnect.base_delay),
            max_delay: env_millis("RELAYCHAT_RECONNECT_MAX_MS")
                .unwrap_or(defaults.reconnect.max_delay),
            min_attempt_interval: env_millis("RELAYCHAT_MIN_ATTEMPT_INTERVAL_MS")
                .unwrap_or(defaults.reconnect.min_attempt_interval),
            cooldown: env_millis("RELAYCHAT_COOLDOWN_MS").unwrap_or(defaults.reconnect.cooldown),
        };

        Self {
            reconnect,
            send_deadline: env_millis("RELAYCHAT_SEND_DEADLINE_MS")
                .unwrap_or(defaults.send_deadline),
            read_release_cooldown: env_millis("RELAYCHAT_READ_RELEASE_MS")
                .unwrap_or(defaults.read_release_cooldown),
            rooms_cache_ttl: env_millis("RELAYCHAT_ROOMS_CACHE_TTL_MS")
                .unwrap_or(defaults.rooms_cache_ttl),
            history_page_size: env_parse("RELAYCHAT_HISTORY_PAGE_SIZE")
                .unwrap_or(defaults.history_page_size),
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Credentials {
    /// Real-time endpoint, e.g. `wss://chat.example.com/ws`
    pub ws_url: String,
    /// REST base URL, e.g. `https://chat.example.com/api`
    pub api_url: String,
    pub token: String,
    /// Tenant identifier every command must carry.
    pub company_id: Option<String>,
}

impl Credentials {
    /// Read credentials from the environment.
    ///
    /// - `RELAYCHAT_WS_URL` (default: "ws://localhost:8080/ws")
    /// - `RELAYCHAT_API_URL` (default: "http://localhost:8080/api")
    /// - `RELAYCHAT_TOKEN`
    /// - `RELAYCHAT_COMPANY_ID`
    pub fn from_env() -> Self {
        Self {
            ws_url: std::env::var("RELAYCHAT_WS_URL")
                .unwrap_or_else(|_| "ws://localhost:8080/ws".to_string()),
            api_url: std::env::var("RELAYCHAT_API_URL")
                .unwrap_or_else(|_| "http://localhost:8080/api".to_string()),
            token: std::env::var("RELAYCHAT_TOKEN").unwrap_or_default(),
            company_id: std::env::var("RELAYCHAT_COMPANY_ID")
                .ok()
                .filter(|id| !id.trim().is_empty()),
        }
    }

    /// The tenant identifier, if one is configured and non-blank.
    pub fn tenant(&self) -> Option<&str> {
        self.company_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
