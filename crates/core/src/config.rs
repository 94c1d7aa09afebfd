use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CourierError;
use crate::layout::{KeyLayout, DEFAULT_CHANNEL_PREFIX, DEFAULT_QUEUE_NAME};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub log: LogConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `COURIER_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("COURIER_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            redis: RedisConfig::from_env_profiled(p),
            server: ServerConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
            log: LogConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the gateway or worker cannot run with.
    pub fn validate(&self) -> Result<(), CourierError> {
        let q = &self.queue;
        if q.server_timeout.is_zero() {
            return Err(CourierError::Config("SERVER_TIMEOUT_SECS must be > 0".into()));
        }
        if q.max_timeout < q.server_timeout {
            return Err(CourierError::Config(
                "MAX_TIMEOUT_SECS must be >= SERVER_TIMEOUT_SECS".into(),
            ));
        }
        if q.result_ttl.is_some_and(|ttl| ttl < q.max_timeout) {
            return Err(CourierError::Config(
                "RESULT_TTL_SECS must be 0 or >= MAX_TIMEOUT_SECS".into(),
            ));
        }
        if q.dequeue_wait.is_zero() {
            return Err(CourierError::Config("DEQUEUE_WAIT_MS must be > 0".into()));
        }
        if q.max_attempts == 0 {
            return Err(CourierError::Config("MAX_ATTEMPTS must be >= 1".into()));
        }
        if q.layout.queue_name.is_empty() {
            return Err(CourierError::Config("QUEUE_NAME must not be empty".into()));
        }
        if q.layout.channel_prefix.is_empty() && q.layout.result_key_prefix.is_empty() {
            // Both empty would make the channel name and the result key identical.
            return Err(CourierError::Config(
                "RESULT_CHANNEL_PREFIX and RESULT_KEY_PREFIX cannot both be empty".into(),
            ));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        let q = &self.queue;
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  redis:   {}", self.redis.redacted_url());
        tracing::info!("  server:  {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  queue:   name={}, channel_prefix={}, timeout={:?}, max_timeout={:?}, dequeue_wait={:?}",
            q.layout.queue_name,
            q.layout.channel_prefix,
            q.server_timeout,
            q.max_timeout,
            q.dequeue_wait
        );
        tracing::info!(
            "  knobs:   result_ttl={:?}, max_queue_depth={}, skip_expired_jobs={}, max_attempts={}, dead_letter={}",
            q.result_ttl,
            q.max_queue_depth,
            q.skip_expired_jobs,
            q.max_attempts,
            q.layout.dead_letter_queue.as_deref().unwrap_or("(none)")
        );
        tracing::info!("  log:     list={}, max_entries={}", self.log.list, self.log.max_entries);
    }
}

// ── Redis ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Full connection URL; when set it wins over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "REDIS_URL"),
            host: profiled_env_or(p, "REDIS_HOST", "localhost"),
            port: profiled_env_u16(p, "REDIS_PORT", 6379),
            password: profiled_env_opt(p, "REDIS_PASSWORD"),
            db: profiled_env_opt(p, "REDIS_DB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Connection target with the password masked, safe for logs.
    pub fn redacted_url(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, host)) => format!("redis://***@{host}"),
                None => url.clone(),
            },
            None => {
                let auth = if self.password.is_some() { "***@" } else { "" };
                format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
            }
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".into(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

// ── HTTP server ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 5000),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
        }
    }
}

// ── Queue protocol ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub layout: KeyLayout,

    /// How long a gateway waits for a result before giving up.
    pub server_timeout: Duration,

    /// Longest wait a caller may ask for; longer requests are rejected or clamped.
    pub max_timeout: Duration,

    /// Upper bound of one blocking dequeue; the worker checks for shutdown
    /// between dequeues.
    pub dequeue_wait: Duration,

    /// Expiry of the durable result slot. `None` keeps results forever.
    pub result_ttl: Option<Duration>,

    /// Admission limit on pending jobs. 0 = unbounded.
    pub max_queue_depth: u64,

    /// Drop jobs whose submitter has already timed out instead of processing them.
    pub skip_expired_jobs: bool,

    /// Processing attempts per job before it is given up.
    pub max_attempts: u32,

    /// Read the durable slot once after a notification wait times out.
    pub fallback_poll: bool,

    /// Pause after a broker error in the worker loop.
    pub error_backoff: Duration,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        let server_timeout = Duration::from_secs(profiled_env_u64(p, "SERVER_TIMEOUT_SECS", 30));
        let max_timeout = Duration::from_secs(
            profiled_env_u64(p, "MAX_TIMEOUT_SECS", server_timeout.as_secs()).max(server_timeout.as_secs()),
        );
        let ttl_secs = profiled_env_u64(p, "RESULT_TTL_SECS", max_timeout.as_secs().saturating_mul(3));
        Self {
            layout: KeyLayout {
                queue_name: profiled_env_or(p, "QUEUE_NAME", DEFAULT_QUEUE_NAME),
                channel_prefix: profiled_env_or(p, "RESULT_CHANNEL_PREFIX", DEFAULT_CHANNEL_PREFIX),
                result_key_prefix: profiled_env_or(p, "RESULT_KEY_PREFIX", ""),
                dead_letter_queue: profiled_env_opt(p, "DEAD_LETTER_QUEUE"),
            },
            server_timeout,
            max_timeout,
            dequeue_wait: Duration::from_millis(profiled_env_u64(p, "DEQUEUE_WAIT_MS", 1000)),
            result_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            max_queue_depth: profiled_env_u64(p, "MAX_QUEUE_DEPTH", 0),
            skip_expired_jobs: profiled_env_bool(p, "SKIP_EXPIRED_JOBS", false),
            max_attempts: profiled_env_u32(p, "MAX_ATTEMPTS", 1),
            fallback_poll: profiled_env_bool(p, "FALLBACK_POLL", true),
            error_backoff: Duration::from_millis(profiled_env_u64(p, "WORKER_ERROR_BACKOFF_MS", 1000)),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            layout: KeyLayout::default(),
            server_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(30),
            dequeue_wait: Duration::from_secs(1),
            result_ttl: Some(Duration::from_secs(90)),
            max_queue_depth: 0,
            skip_expired_jobs: false,
            max_attempts: 1,
            fallback_poll: true,
            error_backoff: Duration::from_secs(1),
        }
    }
}

// ── Activity log ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Broker list holding the most recent activity entries.
    pub list: String,
    pub max_entries: usize,
}

impl LogConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            list: profiled_env_or(p, "LOG_LIST", "app_logs"),
            max_entries: profiled_env_u64(p, "LOG_MAX_ENTRIES", 1000) as usize,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            list: "app_logs".into(),
            max_entries: 1000,
        }
    }
}
