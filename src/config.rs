use std::env;
use std::time::Duration;

/// Location of the queue backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Process configuration for the webhook subsystem.
///
/// All values come from the environment; malformed numbers fall back
/// to the defaults rather than failing startup.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Registration store location. `file:` URLs point at an SQLite
    /// database on disk.
    pub database_url: String,

    pub redis: RedisConfig,

    /// Period between polls per registration.
    pub monitor_interval: Duration,

    pub cache_ttl: Duration,

    pub cache_max_size: usize,

    /// Enables private-host rejection on registration.
    pub production: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            database_url: "file:./webhook.db".to_string(),
            redis: RedisConfig::default(),
            monitor_interval: Duration::from_millis(3_600_000),
            cache_ttl: Duration::from_millis(300_000),
            cache_max_size: 1000,
            production: false,
        }
    }
}

impl WebhookConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env::var("WEBHOOK_DATABASE_URL").unwrap_or(defaults.database_url),
            redis: RedisConfig {
                host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_parsed("REDIS_PORT", 6379),
                password: env::var("REDIS_PASSWORD").ok().filter(|v| !v.is_empty()),
                db: env_parsed("REDIS_DB", 0),
            },
            monitor_interval: env_millis("TRACKING_MONITOR_INTERVAL", defaults.monitor_interval),
            cache_ttl: env_millis("CACHE_TTL", defaults.cache_ttl),
            cache_max_size: env_parsed("CACHE_MAX_SIZE", defaults.cache_max_size),
            production: env::var("NODE_ENV").as_deref() == Ok("production"),
        }
    }

    /// Filesystem path of the store, with any `file:` prefix stripped.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("file:")
            .unwrap_or(&self.database_url)
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
