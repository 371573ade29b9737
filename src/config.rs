use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the gateway.
///
/// Loaded once at startup and handed to component constructors; nothing reads it afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP gateway listens on.
    pub listen_addr: SocketAddr,
    /// Executable used to launch the Tika worker (normally `java`).
    pub java_bin: PathBuf,
    /// Path of the Tika server archive passed to `-jar`.
    pub tika_jar: PathBuf,
    /// Port the Tika worker binds on `localhost`.
    pub tika_port: u16,
    /// Directory holding the on-disk search index.
    pub index_path: PathBuf,
    /// Enables debug-level logging.
    pub verbose: bool,
    /// How long a freshly launched worker may take to fail before it is assumed healthy.
    pub startup_grace: Duration,
    /// Upper bound on graceful worker termination before a forced kill.
    pub shutdown_timeout: Duration,
    /// Optional idle period after which the worker is stopped.
    pub idle_timeout: Option<Duration>,
    /// Maximum number of hits returned by a search.
    pub search_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9997)),
            java_bin: PathBuf::from("/usr/bin/java"),
            tika_jar: PathBuf::from("/usr/local/share/java/tika-server.jar"),
            tika_port: 9998,
            index_path: PathBuf::from("/data/index.tantivy"),
            verbose: false,
            startup_grace: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            idle_timeout: None,
            search_limit: 10,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env`), falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            listen_addr: load_env_optional("TIKAGATE_HTTP_ADDR")
                .map(|value| {
                    parse_listen_addr(&value)
                        .ok_or_else(|| ConfigError::InvalidValue("TIKAGATE_HTTP_ADDR".into()))
                })
                .transpose()?
                .unwrap_or(defaults.listen_addr),
            java_bin: load_env_optional("TIKAGATE_JAVA")
                .map(PathBuf::from)
                .unwrap_or(defaults.java_bin),
            tika_jar: load_env_optional("TIKAGATE_TIKA_JAR")
                .map(PathBuf::from)
                .unwrap_or(defaults.tika_jar),
            tika_port: parse_env("TIKAGATE_TIKA_PORT")?.unwrap_or(defaults.tika_port),
            index_path: load_env_optional("TIKAGATE_INDEX")
                .map(PathBuf::from)
                .unwrap_or(defaults.index_path),
            verbose: load_env_optional("TIKAGATE_VERBOSE")
                .map(|value| {
                    parse_flag(&value)
                        .ok_or_else(|| ConfigError::InvalidValue("TIKAGATE_VERBOSE".into()))
                })
                .transpose()?
                .unwrap_or(defaults.verbose),
            startup_grace: parse_env("TIKAGATE_STARTUP_GRACE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.startup_grace),
            shutdown_timeout: parse_env("TIKAGATE_SHUTDOWN_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            idle_timeout: parse_env("TIKAGATE_IDLE_TIMEOUT_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            search_limit: parse_env::<usize>("TIKAGATE_SEARCH_LIMIT")?
                .filter(|limit| *limit > 0)
                .unwrap_or(defaults.search_limit),
        })
    }

    /// Base URL of the Tika worker HTTP endpoint.
    pub fn tika_base_url(&self) -> String {
        format!("http://localhost:{}", self.tika_port)
    }
}

/// Parse a listen address, accepting the `:port` shorthand for all interfaces.
pub fn parse_listen_addr(value: &str) -> Option<SocketAddr> {
    let value = value.trim();
    if let Some(port) = value.strip_prefix(':') {
        return port
            .parse::<u16>()
            .ok()
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port)));
    }
    value.parse().ok()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_accepts_port_shorthand() {
        let addr = parse_listen_addr(":9997").expect("shorthand parses");
        assert_eq!(addr, SocketAddr::from(([0, 0, 0, 0], 9997)));
    }

    #[test]
    fn listen_addr_accepts_full_socket_address() {
        let addr = parse_listen_addr("127.0.0.1:8080").expect("address parses");
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn listen_addr_rejects_garbage() {
        assert!(parse_listen_addr("not-an-address").is_none());
        assert!(parse_listen_addr(":port").is_none());
    }

    #[test]
    fn flags_understand_common_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn defaults_mirror_the_stock_deployment() {
        let config = Config::default();
        assert_eq!(config.tika_port, 9998);
        assert_eq!(config.startup_grace, Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.tika_base_url(), "http://localhost:9998");
        assert!(config.idle_timeout.is_none());
    }
}
