use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `CLASHD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5434,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "clashd".into(),
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

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&get, "CLASHD_PORT").unwrap_or(defaults.port),
            bind: get("CLASHD_BIND").unwrap_or(defaults.bind),
            data_dir: get("CLASHD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("CLASHD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&get, "CLASHD_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&get, "CLASHD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            tls_cert: get("CLASHD_TLS_CERT").map(PathBuf::from),
            tls_key: get("CLASHD_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&get, "CLASHD_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("clashd.wal")
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}
