//! Runtime configuration loaded from environment variables

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling for a single uploaded audio file (32 MiB)
pub const MAX_UPLOAD_BYTES: usize = 32 << 20;

/// Room for multipart framing on top of the file itself
pub const MULTIPART_OVERHEAD_BYTES: usize = 1 << 20;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_UPLOAD_DIR: &str = "temp/uploads";
const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Root directory; each round gets `<upload_dir>/<round id>/`
    pub upload_dir: PathBuf,
    /// Expiry for round and session records, and the cookie max-age
    pub round_ttl: Duration,
    /// Budget for store calls made while handling one request
    pub store_timeout: Duration,
    /// Redis connection string (only used with the `redis` feature)
    pub redis_url: Option<String>,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window: Duration::from_secs(10),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            round_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            redis_url: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Read a variable, treating empty values as unset
fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a variable, falling back to `default` (with a warning) on bad input
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_var(name) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "Invalid value, using default");
                default
            }
        },
        None => default,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env_var(name)
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(default)
}

impl AppConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ip: IpAddr = env_parse("BIND_ADDR", defaults.bind_addr.ip());
        let port: u16 = env_parse("PORT", DEFAULT_PORT);

        let upload_dir = env_var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);

        let round_ttl = Duration::from_secs(env_parse("ROUND_TTL_SECS", DEFAULT_TTL_SECS).max(1));
        let store_timeout =
            Duration::from_millis(env_parse("STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS).max(1));

        let rate_defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            enabled: env_flag("RATE_LIMIT", rate_defaults.enabled),
            max_requests: env_parse("RATE_LIMIT_MAX", rate_defaults.max_requests),
            window: Duration::from_secs(
                env_parse("RATE_LIMIT_WINDOW", rate_defaults.window.as_secs()).max(1),
            ),
        };

        let config = Self {
            bind_addr: SocketAddr::new(ip, port),
            upload_dir,
            round_ttl,
            store_timeout,
            redis_url: env_var("REDIS_URL"),
            rate_limit,
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            upload_dir = %config.upload_dir.display(),
            round_ttl_secs = config.round_ttl.as_secs(),
            rate_limit_enabled = config.rate_limit.enabled,
            "Config loaded"
        );

        config
    }

    /// Cookie max-age in seconds, matching the record TTL
    pub fn session_max_age(&self) -> u64 {
        self.round_ttl.as_secs()
    }
}
