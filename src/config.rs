use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `TIMETABLED_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Account created as administrator at startup if no user holds it yet.
    pub admin_email: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "timetabled".into(),
            admin_email: "admin@localhost".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparseable values fall back to the defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: get("TIMETABLED_BIND").unwrap_or(defaults.bind),
            port: parse_or(get("TIMETABLED_PORT"), defaults.port),
            data_dir: get("TIMETABLED_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: get("TIMETABLED_PASSWORD").unwrap_or(defaults.password),
            admin_email: get("TIMETABLED_ADMIN_EMAIL").unwrap_or(defaults.admin_email),
            max_connections: parse_or(get("TIMETABLED_MAX_CONNECTIONS"), defaults.max_connections),
            compact_threshold: parse_or(
                get("TIMETABLED_COMPACT_THRESHOLD"),
                defaults.compact_threshold,
            ),
            tls_cert: get("TIMETABLED_TLS_CERT"),
            tls_key: get("TIMETABLED_TLS_KEY"),
            metrics_port: get("TIMETABLED_METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("timetable.wal")
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}
