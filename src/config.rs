use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read once at start-up from `CARBOOK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub outbox_capacity: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "carbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            outbox_capacity: 1024,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Unset keys keep their defaults;
    /// set but malformed numbers are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let d = Config::default();
        let cfg = Config {
            bind: lookup("CARBOOK_BIND").unwrap_or(d.bind),
            port: parse_var(&lookup, "CARBOOK_PORT")?.unwrap_or(d.port),
            data_dir: lookup("CARBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("CARBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parse_var(&lookup, "CARBOOK_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parse_var(&lookup, "CARBOOK_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            compact_interval: parse_var(&lookup, "CARBOOK_COMPACT_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.compact_interval),
            outbox_capacity: parse_var(&lookup, "CARBOOK_OUTBOX_CAPACITY")?.unwrap_or(d.outbox_capacity),
            metrics_port: parse_var(&lookup, "CARBOOK_METRICS_PORT")?,
            tls_cert: lookup("CARBOOK_TLS_CERT"),
            tls_key: lookup("CARBOOK_TLS_KEY"),
        };

        if cfg.max_connections == 0 {
            return Err(invalid("CARBOOK_MAX_CONNECTIONS must be at least 1"));
        }
        if cfg.outbox_capacity == 0 {
            return Err(invalid("CARBOOK_OUTBOX_CAPACITY must be at least 1"));
        }
        if cfg.compact_interval.is_zero() {
            return Err(invalid("CARBOOK_COMPACT_INTERVAL_SECS must be at least 1"));
        }
        if cfg.tls_cert.is_some() != cfg.tls_key.is_some() {
            return Err(invalid("both CARBOOK_TLS_CERT and CARBOOK_TLS_KEY must be set, or neither"));
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> io::Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(&format!("{key}: cannot parse {raw:?}"))),
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides_from_lookup() {
        let cfg = Config::from_lookup(lookup(&[
            ("CARBOOK_PORT", "6000"),
            ("CARBOOK_DATA_DIR", "/var/lib/carbook"),
            ("CARBOOK_MAX_CONNECTIONS", "8"),
            ("CARBOOK_COMPACT_INTERVAL_SECS", "5"),
            ("CARBOOK_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/carbook"));
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.compact_interval, Duration::from_secs(5));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.password, "carbook");
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("CARBOOK_PORT", "fifty")])).unwrap_err();
        assert!(err.to_string().contains("CARBOOK_PORT"));
    }

    #[test]
    fn zero_connections_rejected() {
        assert!(Config::from_lookup(lookup(&[("CARBOOK_MAX_CONNECTIONS", "0")])).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(Config::from_lookup(lookup(&[("CARBOOK_TLS_CERT", "cert.pem")])).is_err());
        let cfg = Config::from_lookup(lookup(&[
            ("CARBOOK_TLS_CERT", "cert.pem"),
            ("CARBOOK_TLS_KEY", "key.pem"),
        ]))
        .unwrap();
        assert_eq!(cfg.tls_key.as_deref(), Some("key.pem"));
    }
}
