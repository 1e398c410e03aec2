use std::path::PathBuf;
use std::str::FromStr;

/// Server settings read from `TABLEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "tablebook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

/// Parses `key` if present; an unparseable value logs a warning and falls back.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key}={raw}");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "TABLEBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("TABLEBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("TABLEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("TABLEBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "TABLEBOOK_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "TABLEBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("TABLEBOOK_TLS_CERT"),
            tls_key: lookup("TABLEBOOK_TLS_KEY"),
            metrics_port: parsed(&lookup, "TABLEBOOK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tablebook.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/tablebook.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let config = from_pairs(&[
            ("TABLEBOOK_PORT", "6000"),
            ("TABLEBOOK_BIND", "127.0.0.1"),
            ("TABLEBOOK_DATA_DIR", "/var/lib/tablebook"),
            ("TABLEBOOK_PASSWORD", "s3cret"),
            ("TABLEBOOK_MAX_CONNECTIONS", "32"),
            ("TABLEBOOK_COMPACT_THRESHOLD", "50"),
            ("TABLEBOOK_TLS_CERT", "cert.pem"),
            ("TABLEBOOK_TLS_KEY", "key.pem"),
            ("TABLEBOOK_METRICS_PORT", "9100"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/tablebook"));
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(config.tls_key.as_deref(), Some("key.pem"));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = from_pairs(&[
            ("TABLEBOOK_PORT", "not-a-port"),
            ("TABLEBOOK_MAX_CONNECTIONS", "0"),
            ("TABLEBOOK_METRICS_PORT", "70000"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }
}
